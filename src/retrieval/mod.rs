//! Retrieval-augmented question answering over one notebook.
//!
//! A question moves through an explicit state machine ([`QueryState`]):
//!
//! ```text
//! Received ──▶ Rewritten ──▶ Retrieved ──▶ Grounded ──▶ Answered
//!     │            │             │             │
//!     └────────────┴─────────────┴─────────────┴──────▶ Failed
//! ```
//!
//! - **Rewritten**: follow-up questions ("what about its moons?") are
//!   turned into standalone queries by the `query_rewrite` role. Questions
//!   without references to earlier turns pass through unchanged.
//! - **Retrieved**: the query is embedded and the notebook's chunks that
//!   were embedded by the same model are ranked by cosine similarity.
//! - **Grounded**: hits become numbered passages within
//!   `retrieval.max_context_chars`.
//! - **Answered**: the `chat` role answers, citing passages as `[n]`; the
//!   cited chunk ids are attached and the turn is persisted.

pub mod context;
pub mod orchestrator;
pub mod state;

pub use context::{GroundedContext, Passage};
pub use orchestrator::{Answer, Orchestrator, QueryFailure};
pub use state::{QueryRun, QueryState};
