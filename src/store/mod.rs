//! SQLite-backed knowledge store.
//!
//! [`SqliteStore`] persists notebooks, sources, chunks, notes, conversations
//! and provider role overrides. It is the only shared mutable state in the
//! system; every multi-row change runs in a single transaction.
//!
//! # Chunk versions
//!
//! Re-ingesting a source never deletes its visible chunks up front. New
//! chunks are written under the source's `pending_version`, embedded, and
//! then [`SqliteStore::activate_version`] flips `active_version` and drops
//! the superseded rows in one transaction. Readers always join on
//! `active_version`, so they see either the old set or the new one.

mod chunks;
mod conversations;
mod notebooks;
mod notes;
mod provider_roles;
mod sources;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::migrate::run_migrations;

pub use notes::NewNote;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the configured database and bring the schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_path(&config.db.path).await
    }

    pub async fn open_path(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
