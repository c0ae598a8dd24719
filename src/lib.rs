//! # Open Notebook
//!
//! A local-first research notebook: import documents into notebooks, then
//! ask questions answered from their contents with citations.
//!
//! Sources (files, web pages, pasted text) are extracted to plain text,
//! chunked, embedded through a configurable model provider and stored in
//! SQLite. Questions are answered by retrieving the closest chunks of the
//! same embedding model and asking a chat model to answer from them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────┐   ┌──────────┐   ┌──────────┐
//! │  Extractor   │──▶│ Chunker │──▶│ Embedder │──▶│  SQLite  │
//! │ pdf/html/... │   └─────────┘   └────┬─────┘   │  store   │
//! └──────────────┘                      │         └────┬─────┘
//!                                       ▼              │
//!                               ┌──────────────┐       │
//!                               │   Provider   │◀──────┤
//!                               │   Registry   │       │
//!                               └──────────────┘       ▼
//!                                       ▲        ┌────────────┐
//!                                       └────────│ Retrieval  │
//!                                                │ state mach.│
//!                                                └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! notebook init
//! notebook notebook create "Soil research"
//! notebook source add <notebook-id> --file paper.pdf
//! notebook conversation new <notebook-id>
//! notebook ask <notebook-id> <conversation-id> "What raised carbon uptake?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`providers`] | Model backends, role bindings, retry and failover |
//! | [`extract`] | Format handlers turning sources into text |
//! | [`chunk`] | Boundary-aware text chunking |
//! | [`embedding`] | Batched chunk embedding and vector helpers |
//! | [`store`] | Notebooks, sources, chunks, notes, conversations |
//! | [`ingest`] | Per-source ingestion pipeline |
//! | [`retrieval`] | Question answering state machine |
//! | [`podcast`] | Podcast scripts from notebook content |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod podcast;
pub mod providers;
pub mod retrieval;
pub mod store;
