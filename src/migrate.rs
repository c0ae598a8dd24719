//! Idempotent schema setup. Timestamps are stored as Unix milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS notebooks (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    // active_version is what readers see; pending_version is the chunk set
    // being staged by an in-flight ingestion.
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        notebook_id TEXT NOT NULL REFERENCES notebooks(id) ON DELETE CASCADE,
        origin TEXT NOT NULL,
        title TEXT,
        author TEXT,
        mime_type TEXT,
        filename TEXT,
        url TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        warnings_json TEXT NOT NULL DEFAULT '[]',
        error TEXT,
        active_version INTEGER,
        pending_version INTEGER,
        next_version INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS source_content (
        source_id TEXT PRIMARY KEY REFERENCES sources(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        body BLOB NOT NULL,
        filename TEXT,
        mime_type TEXT,
        title TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
        version INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        text TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        overlap INTEGER NOT NULL DEFAULT 0,
        hash TEXT NOT NULL,
        embedding BLOB,
        embedding_model TEXT,
        created_at INTEGER NOT NULL,
        UNIQUE(source_id, version, ordinal),
        CHECK (start_offset <= end_offset),
        CHECK ((embedding IS NULL) = (embedding_model IS NULL))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notes (
        id TEXT PRIMARY KEY,
        notebook_id TEXT NOT NULL REFERENCES notebooks(id) ON DELETE CASCADE,
        title TEXT,
        text TEXT NOT NULL,
        author TEXT NOT NULL,
        source_id TEXT REFERENCES sources(id) ON DELETE SET NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        notebook_id TEXT NOT NULL REFERENCES notebooks(id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        role TEXT NOT NULL,
        text TEXT NOT NULL,
        cited_json TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        UNIQUE(conversation_id, seq)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS provider_roles (
        role TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        temperature REAL,
        max_tokens INTEGER,
        fallbacks_json TEXT NOT NULL DEFAULT '[]',
        updated_at INTEGER NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_sources_notebook ON sources(notebook_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_source_version ON chunks(source_id, version)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_model ON chunks(embedding_model)",
    "CREATE INDEX IF NOT EXISTS idx_notes_notebook ON notes(notebook_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_conversations_notebook ON conversations(notebook_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq)",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES.iter().chain(INDEXES) {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_path;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = connect_path(&tmp.path().join("t.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('notebooks', 'sources', 'chunks', 'messages')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 4);
    }
}
