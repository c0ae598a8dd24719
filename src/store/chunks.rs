use std::cmp::Ordering;

use sqlx::Row;
use tracing::debug;

use super::{new_id, now_ms, ts, SqliteStore};
use crate::chunk::{content_hash, Segment};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::StoreError;
use crate::models::{Chunk, ScoredChunk};

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    let blob: Option<Vec<u8>> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        source_id: row.get("source_id"),
        ordinal: row.get("ordinal"),
        text: row.get("text"),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        overlap: row.get("overlap"),
        hash: row.get("hash"),
        embedding: blob.map(|b| blob_to_vec(&b)),
        embedding_model: row.get("embedding_model"),
        created_at: ts(row.get("created_at")),
    }
}

impl SqliteStore {
    /// Allocate a fresh pending version for `source_id`, discarding any
    /// chunks left behind by an abandoned earlier attempt.
    pub async fn begin_version(&self, source_id: &str) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT next_version, pending_version FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("source", source_id))?;
        let version: i64 = row.get("next_version");
        let stale: Option<i64> = row.get("pending_version");

        if let Some(stale) = stale {
            sqlx::query("DELETE FROM chunks WHERE source_id = ? AND version = ?")
                .bind(source_id)
                .bind(stale)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE sources SET pending_version = ?, next_version = ? WHERE id = ?")
            .bind(version)
            .bind(version + 1)
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn check_pending(
        &self,
        conn: &mut sqlx::SqliteConnection,
        source_id: &str,
        version: i64,
    ) -> Result<(), StoreError> {
        let pending: Option<Option<i64>> =
            sqlx::query_scalar("SELECT pending_version FROM sources WHERE id = ?")
                .bind(source_id)
                .fetch_optional(&mut *conn)
                .await?;
        match pending {
            None => Err(StoreError::not_found("source", source_id)),
            Some(Some(p)) if p == version => Ok(()),
            Some(_) => Err(StoreError::Consistency(format!(
                "version {} of source {} is no longer pending",
                version, source_id
            ))),
        }
    }

    /// Write un-embedded chunks under a pending version, in ordinal order.
    pub async fn stage_chunks(
        &self,
        source_id: &str,
        version: i64,
        segments: &[Segment],
    ) -> Result<Vec<Chunk>, StoreError> {
        let mut tx = self.pool.begin().await?;
        self.check_pending(&mut tx, source_id, version).await?;

        let now = now_ms();
        let mut chunks = Vec::with_capacity(segments.len());
        for segment in segments {
            let chunk = Chunk {
                id: new_id(),
                source_id: source_id.to_string(),
                ordinal: segment.ordinal as i64,
                text: segment.text.clone(),
                start_offset: segment.start as i64,
                end_offset: segment.end as i64,
                overlap: segment.overlap() as i64,
                hash: content_hash(&segment.text),
                embedding: None,
                embedding_model: None,
                created_at: ts(now),
            };
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_id, version, ordinal, text, start_offset,
                                    end_offset, overlap, hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(source_id)
            .bind(version)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(chunk.overlap)
            .bind(&chunk.hash)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_write(e, "chunk"))?;
            chunks.push(chunk);
        }
        tx.commit().await?;
        Ok(chunks)
    }

    /// Chunks of a version that still lack an embedding.
    pub async fn unembedded_chunks(
        &self,
        source_id: &str,
        version: i64,
    ) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE source_id = ? AND version = ? AND embedding IS NULL ORDER BY ordinal",
        )
        .bind(source_id)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Persist vectors for a batch of chunks. A chunk that already has an
    /// embedding is left untouched; returns how many rows were written.
    pub async fn store_embeddings(
        &self,
        vectors: &[(String, Vec<f32>)],
        model: &str,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for (chunk_id, vector) in vectors {
            let result = sqlx::query(
                "UPDATE chunks SET embedding = ?, embedding_model = ? WHERE id = ? AND embedding IS NULL",
            )
            .bind(vec_to_blob(vector))
            .bind(model)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                debug!(chunk_id = %chunk_id, "chunk already embedded or gone, skipping");
            }
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Drop the vectors of the given chunks so they can be embedded again.
    pub async fn clear_embeddings(&self, chunk_ids: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for chunk_id in chunk_ids {
            sqlx::query("UPDATE chunks SET embedding = NULL, embedding_model = NULL WHERE id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Make a fully embedded pending version the visible chunk set and drop
    /// every other version, in one transaction. A version whose chunks were
    /// embedded by more than one model is refused.
    pub async fn activate_version(&self, source_id: &str, version: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        self.check_pending(&mut tx, source_id, version).await?;

        let missing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE source_id = ? AND version = ? AND embedding IS NULL",
        )
        .bind(source_id)
        .bind(version)
        .fetch_one(&mut *tx)
        .await?;
        if missing > 0 {
            return Err(StoreError::Consistency(format!(
                "{} chunks of source {} are not embedded",
                missing, source_id
            )));
        }
        let models: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT embedding_model) FROM chunks WHERE source_id = ? AND version = ?",
        )
        .bind(source_id)
        .bind(version)
        .fetch_one(&mut *tx)
        .await?;
        if models > 1 {
            return Err(StoreError::Consistency(format!(
                "version {} of source {} mixes {} embedding models",
                version, source_id, models
            )));
        }

        sqlx::query(
            "UPDATE sources SET active_version = ?, pending_version = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(version)
        .bind(now_ms())
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE source_id = ? AND version <> ?")
            .bind(source_id)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Throw away a pending version after a failed or cancelled ingestion.
    pub async fn discard_version(&self, source_id: &str, version: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE source_id = ? AND version = ?")
            .bind(source_id)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE sources SET pending_version = NULL WHERE id = ? AND pending_version = ?",
        )
        .bind(source_id)
        .bind(version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// The visible chunks of a source, by ordinal.
    pub async fn list_chunks(&self, source_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.* FROM chunks c
            JOIN sources s ON s.id = c.source_id AND c.version = s.active_version
            WHERE s.id = ?
            ORDER BY c.ordinal
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Chunk, StoreError> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("chunk", id))?;
        Ok(row_to_chunk(&row))
    }

    /// Top-`k` visible chunks of one notebook embedded by `model_id`,
    /// ranked by cosine similarity. Ties go to the most recently written
    /// chunk.
    pub async fn similarity_search(
        &self,
        notebook_id: &str,
        query: &[f32],
        k: usize,
        model_id: &str,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.get_notebook(notebook_id).await?;
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT c.*, c.rowid AS seq, COALESCE(s.title, s.filename, s.url) AS source_title
            FROM chunks c
            JOIN sources s ON s.id = c.source_id AND c.version = s.active_version
            WHERE s.notebook_id = ?
              AND c.embedding_model = ?
              AND c.embedding IS NOT NULL
            "#,
        )
        .bind(notebook_id)
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(i64, ScoredChunk)> = rows
            .iter()
            .filter_map(|row| {
                let chunk = row_to_chunk(row);
                let vector = chunk.embedding.as_deref()?;
                if vector.len() != query.len() {
                    return None;
                }
                let score = cosine_similarity(query, vector);
                let seq: i64 = row.get("seq");
                Some((
                    seq,
                    ScoredChunk {
                        source_title: row.get("source_title"),
                        chunk,
                        score,
                    },
                ))
            })
            .collect();

        scored.sort_by(|(seq_a, a), (seq_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
                .then_with(|| seq_b.cmp(seq_a))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(_, s)| s).collect())
    }
}
