//! Chunk embedding and vector utilities.
//!
//! [`Embedder`] turns staged chunks into vectors through the registry's
//! `embedding` role and persists each successful batch immediately, so a
//! failure later in the run never costs work already done.
//!
//! # Batch failures
//!
//! Chunks are sent in batches of `embedding.batch_size`. When a batch fails
//! with a transient error it is split in half and both halves are queued
//! again; a single-chunk batch is simply requeued. Each split or requeue
//! increases the batch's depth, and once `embedding.max_split_depth` is
//! reached the error is surfaced. Permanent errors are surfaced at once.
//! Because only failed batches are retried and the store refuses to
//! overwrite an existing vector, every chunk is embedded exactly once.
//!
//! # One model per run
//!
//! The first successful batch pins the run to the target that served it.
//! If a later batch fails over to an alternate, the vectors already written
//! are cleared and the whole run restarts on that alternate, so a chunk
//! version never mixes models. Targets are only ever dropped from the
//! front, which bounds the restarts by the number of alternates.
//!
//! Vectors are stored as little-endian `f32` BLOBs; see [`vec_to_blob`].

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{NotebookError, Result};
use crate::models::Chunk;
use crate::providers::{ProviderRegistry, Role};
use crate::store::SqliteStore;

/// Outcome of one embedding run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbedReport {
    pub embedded: usize,
    /// Provider requests that succeeded.
    pub batches: usize,
    /// Failed batches that were split or requeued.
    pub retried_batches: usize,
    /// The model that produced every vector.
    pub model: Option<String>,
    /// Times the run started over on an alternate target.
    pub restarts: usize,
}

pub struct Embedder {
    registry: Arc<ProviderRegistry>,
    store: Arc<SqliteStore>,
    batch_size: usize,
    max_split_depth: u32,
}

impl Embedder {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<SqliteStore>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            registry,
            store,
            batch_size: config.batch_size.max(1),
            max_split_depth: config.max_split_depth,
        }
    }

    /// Embed every chunk of a pending version that has no vector yet.
    pub async fn embed_pending(
        &self,
        source_id: &str,
        version: i64,
        cancelled: &AtomicBool,
    ) -> Result<EmbedReport> {
        let chunks = self.store.unembedded_chunks(source_id, version).await?;
        self.embed_chunks(&chunks, cancelled).await
    }

    /// Embed `chunks` and persist the vectors batch by batch.
    ///
    /// Cancellation is checked before each request; a request already in
    /// flight completes and its vectors are kept.
    pub async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        cancelled: &AtomicBool,
    ) -> Result<EmbedReport> {
        let mut handle = self.registry.resolve(Role::Embedding)?;
        let mut report = EmbedReport::default();
        let mut written: Vec<String> = Vec::new();
        let mut queue = self.batches(chunks, &HashSet::new());

        while let Some((batch, depth)) = queue.pop_front() {
            if cancelled.load(Ordering::SeqCst) {
                return Err(NotebookError::Cancelled);
            }

            let inputs: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match self.registry.embed_with(&handle, inputs).await {
                Ok(invocation) => {
                    if report.model.as_deref() != Some(invocation.model.as_str()) {
                        if let Some(previous) = &report.model {
                            warn!(
                                from = %previous,
                                to = %invocation.model,
                                discarded = written.len(),
                                "embedding model changed mid-run, re-embedding on the alternate"
                            );
                            self.store.clear_embeddings(&written).await?;
                            written.clear();
                            report.embedded = 0;
                            report.restarts += 1;
                            let current: HashSet<&str> =
                                batch.iter().map(|c| c.id.as_str()).collect();
                            queue = self.batches(chunks, &current);
                        }
                        handle = handle
                            .starting_at(&invocation.provider, &invocation.model)
                            .ok_or_else(|| {
                                NotebookError::Provider(crate::error::ProviderError::malformed(
                                    &invocation.provider,
                                    "embedding served by a target outside the role binding",
                                ))
                            })?;
                        report.model = Some(invocation.model.clone());
                    }

                    let pairs: Vec<(String, Vec<f32>)> = batch
                        .iter()
                        .map(|c| c.id.clone())
                        .zip(invocation.output)
                        .collect();
                    self.store.store_embeddings(&pairs, &invocation.model).await?;
                    debug!(
                        chunks = pairs.len(),
                        provider = %invocation.provider,
                        model = %invocation.model,
                        "embedded batch"
                    );
                    report.embedded += pairs.len();
                    report.batches += 1;
                    written.extend(pairs.into_iter().map(|(id, _)| id));
                }
                Err(e) if e.is_transient() && depth < self.max_split_depth => {
                    report.retried_batches += 1;
                    warn!(
                        size = batch.len(),
                        depth = depth + 1,
                        error = %e,
                        "embedding batch failed, retrying in smaller batches"
                    );
                    if batch.len() > 1 {
                        let mut first = batch;
                        let second = first.split_off(first.len() / 2);
                        queue.push_front((second, depth + 1));
                        queue.push_front((first, depth + 1));
                    } else {
                        queue.push_back((batch, depth + 1));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    fn batches<'a>(
        &self,
        chunks: &'a [Chunk],
        skip: &HashSet<&str>,
    ) -> VecDeque<(Vec<&'a Chunk>, u32)> {
        let remaining: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| !skip.contains(c.id.as_str()))
            .collect();
        remaining
            .chunks(self.batch_size)
            .map(|batch| (batch.to_vec(), 0))
            .collect()
    }

    /// Embed a search query. Returns the vector and the model that produced
    /// it, so the caller can restrict the search to the same model.
    pub async fn embed_query(&self, text: &str) -> Result<(Vec<f32>, String)> {
        let invocation = self.registry.embed(vec![text.to_string()]).await?;
        let model = invocation.model;
        let vector = invocation
            .output
            .into_iter()
            .next()
            .ok_or_else(|| {
                NotebookError::Provider(crate::error::ProviderError::malformed(
                    &invocation.provider,
                    "empty embedding response",
                ))
            })?;
        Ok((vector, model))
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use open_notebook::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
