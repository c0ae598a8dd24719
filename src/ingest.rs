//! Ingestion pipeline orchestration.
//!
//! One pipeline run per source: extract → chunk → stage → embed → activate.
//! Submitting returns as soon as the source row exists (status `pending`);
//! the run itself happens on a spawned task gated by a semaphore so at most
//! `ingest.max_concurrent` sources are processed at once.
//!
//! Chunks are written under a pending version and only become visible when
//! every one of them has a vector and the source's active version flips. A
//! failed or cancelled run marks the source `failed`, throws the pending
//! version away, and leaves whatever was visible before untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk::{Chunker, Segment};
use crate::embedding::Embedder;
use crate::error::{ExtractError, NotebookError, Result};
use crate::extract::web::WebFetcher;
use crate::extract::Extractor;
use crate::models::{SourceDescriptor, SourceStatusReport};
use crate::store::SqliteStore;

/// Summary of a finished ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestOutcome {
    pub source_id: String,
    pub version: i64,
    pub chunks: usize,
    pub embedded: usize,
    /// Model that embedded every chunk of the version.
    pub model: Option<String>,
    pub warnings: Vec<String>,
}

/// Handle to a submitted ingestion run.
#[derive(Debug)]
pub struct IngestJob {
    pub source_id: String,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<Result<IngestOutcome>>,
}

impl IngestJob {
    /// Ask the run to stop at its next step boundary. A provider call
    /// already in flight completes, but its result is discarded.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub async fn wait(self) -> Result<IngestOutcome> {
        self.handle.await.unwrap_or_else(|e| {
            Err(NotebookError::InvalidInput(format!(
                "ingestion task for {} aborted: {}",
                self.source_id, e
            )))
        })
    }
}

/// Files found by [`IngestPipeline::import_dir`].
pub struct ImportReport {
    pub jobs: Vec<IngestJob>,
    /// Matching files that were not submitted, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<SqliteStore>,
    extractor: Arc<Extractor>,
    embedder: Arc<Embedder>,
    chunker: Chunker,
    max_bytes: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Removes a source from the in-flight set when the run ends.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    source_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.source_id);
    }
}

impl IngestPipeline {
    pub fn new(
        store: Arc<SqliteStore>,
        extractor: Arc<Extractor>,
        embedder: Arc<Embedder>,
        chunker: Chunker,
        max_concurrent: usize,
        max_bytes: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            chunker,
            max_bytes,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a source in `notebook_id` and start ingesting it.
    pub async fn submit(
        &self,
        notebook_id: &str,
        descriptor: SourceDescriptor,
    ) -> Result<IngestJob> {
        validate_descriptor(&descriptor, self.max_bytes)?;
        let source = self.store.create_source(notebook_id, &descriptor).await?;
        info!(
            source_id = %source.id,
            notebook_id,
            origin = source.origin.as_str(),
            "source submitted"
        );
        self.spawn(source.id)
    }

    /// Run the pipeline again over the stored content of an existing source.
    /// The previous chunks stay visible until the new set is complete.
    pub async fn reingest(&self, source_id: &str) -> Result<IngestJob> {
        self.store.get_source(source_id).await?;
        self.spawn(source_id.to_string())
    }

    pub async fn get_source_status(&self, source_id: &str) -> Result<SourceStatusReport> {
        Ok(self.store.source_status(source_id).await?)
    }

    /// Submit every file under `root` that matches `include` (everything
    /// when empty) and none of `exclude`. Patterns match the path relative
    /// to `root`.
    pub async fn import_dir(
        &self,
        notebook_id: &str,
        root: &Path,
        include: &[String],
        exclude: &[String],
    ) -> Result<ImportReport> {
        let files = scan_dir(root, include, exclude)?;
        let mut report = ImportReport {
            jobs: Vec::new(),
            skipped: Vec::new(),
        };
        for (path, relative) in files {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    report.skipped.push((path, e.to_string()));
                    continue;
                }
            };
            let descriptor = SourceDescriptor::File {
                bytes,
                mime_type: None,
                filename: Some(relative),
            };
            match self.submit(notebook_id, descriptor).await {
                Ok(job) => report.jobs.push(job),
                Err(NotebookError::InvalidInput(reason)) => {
                    warn!(path = %path.display(), reason = %reason, "skipping file");
                    report.skipped.push((path, reason));
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            root = %root.display(),
            submitted = report.jobs.len(),
            skipped = report.skipped.len(),
            "directory import submitted"
        );
        Ok(report)
    }

    fn spawn(&self, source_id: String) -> Result<IngestJob> {
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !in_flight.insert(source_id.clone()) {
                return Err(NotebookError::InvalidInput(format!(
                    "source {} is already being ingested",
                    source_id
                )));
            }
        }
        let guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            source_id: source_id.clone(),
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let pipeline = self.clone();
        let flag = Arc::clone(&cancelled);
        let id = source_id.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            pipeline.run(&id, &flag).await
        });

        Ok(IngestJob {
            source_id,
            cancelled,
            handle,
        })
    }

    async fn run(&self, source_id: &str, cancelled: &AtomicBool) -> Result<IngestOutcome> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| NotebookError::Cancelled)?;

        let mut version = None;
        match self.process(source_id, cancelled, &mut version).await {
            Ok(outcome) => {
                info!(
                    source_id,
                    version = outcome.version,
                    chunks = outcome.chunks,
                    embedded = outcome.embedded,
                    warnings = outcome.warnings.len(),
                    "source ingested"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(source_id, error = %e, transient = e.is_transient(), "ingestion failed");
                if let Some(version) = version {
                    if let Err(discard) = self.store.discard_version(source_id, version).await {
                        warn!(source_id, version, error = %discard, "could not discard pending chunks");
                    }
                }
                if let Err(mark) = self.store.mark_failed(source_id, &e.to_string()).await {
                    warn!(source_id, error = %mark, "could not record ingestion failure");
                }
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        source_id: &str,
        cancelled: &AtomicBool,
        version: &mut Option<i64>,
    ) -> Result<IngestOutcome> {
        checkpoint(cancelled)?;
        self.store.mark_processing(source_id).await?;
        let descriptor = self.store.source_content(source_id).await?;

        let doc = self.extractor.extract(&descriptor).await?;
        checkpoint(cancelled)?;
        if doc.text.trim().is_empty() {
            return Err(ExtractError::ExtractionFailed("no extractable text".to_string()).into());
        }
        self.store
            .update_source_metadata(source_id, &doc.metadata)
            .await?;

        let segments: Vec<Segment> = self.chunker.segments(&doc.text).collect();
        debug!(source_id, chunks = segments.len(), chars = doc.text.chars().count(), "chunked");

        let staged_version = self.store.begin_version(source_id).await?;
        *version = Some(staged_version);
        let staged = self
            .store
            .stage_chunks(source_id, staged_version, &segments)
            .await?;

        checkpoint(cancelled)?;
        let report = self
            .embedder
            .embed_pending(source_id, staged_version, cancelled)
            .await?;

        // Vectors that arrived after a cancel are discarded with the version.
        checkpoint(cancelled)?;
        self.store
            .activate_version(source_id, staged_version)
            .await?;
        *version = None;
        self.store.mark_done(source_id, &doc.warnings).await?;

        Ok(IngestOutcome {
            source_id: source_id.to_string(),
            version: staged_version,
            chunks: staged.len(),
            embedded: report.embedded,
            model: report.model,
            warnings: doc.warnings,
        })
    }
}

fn checkpoint(cancelled: &AtomicBool) -> Result<()> {
    if cancelled.load(Ordering::SeqCst) {
        Err(NotebookError::Cancelled)
    } else {
        Ok(())
    }
}

/// Reject descriptors that can never ingest before a source row exists.
pub fn validate_descriptor(descriptor: &SourceDescriptor, max_bytes: usize) -> Result<()> {
    match descriptor {
        SourceDescriptor::Text { text, .. } if text.trim().is_empty() => Err(
            NotebookError::InvalidInput("text source is empty".to_string()),
        ),
        SourceDescriptor::Text { .. } => Ok(()),
        SourceDescriptor::Url(url) => WebFetcher::parse_url(url)
            .map(|_| ())
            .map_err(|e| NotebookError::InvalidInput(e.to_string())),
        SourceDescriptor::File { bytes, .. } if bytes.is_empty() => {
            Err(NotebookError::InvalidInput("file is empty".to_string()))
        }
        SourceDescriptor::File { bytes, .. } if bytes.len() > max_bytes => {
            Err(NotebookError::InvalidInput(format!(
                "file is {} bytes, limit is {}",
                bytes.len(),
                max_bytes
            )))
        }
        SourceDescriptor::File { .. } => Ok(()),
    }
}

/// Matching files under `root` as (absolute path, relative path), sorted.
pub fn scan_dir(
    root: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<(PathBuf, String)>> {
    if !root.is_dir() {
        return Err(NotebookError::InvalidInput(format!(
            "import root is not a directory: {}",
            root.display()
        )));
    }
    let include_set = if include.is_empty() {
        build_globset(&["**/*".to_string()])?
    } else {
        build_globset(include)?
    };
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(exclude.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| NotebookError::InvalidInput(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }
        files.push((path.to_path_buf(), relative));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| NotebookError::InvalidInput(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| NotebookError::InvalidInput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn validation_rules() {
        let max = 16;
        assert!(validate_descriptor(
            &SourceDescriptor::Text {
                text: "\n ".into(),
                title: None
            },
            max
        )
        .is_err());
        assert!(validate_descriptor(&SourceDescriptor::Url("ftp://x.org/a".into()), max).is_err());
        assert!(validate_descriptor(&SourceDescriptor::Url("https://x.org/a".into()), max).is_ok());
        assert!(validate_descriptor(
            &SourceDescriptor::File {
                bytes: vec![0; 17],
                mime_type: None,
                filename: None
            },
            max
        )
        .is_err());
    }

    #[test]
    fn scan_applies_globs_and_default_excludes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("docs/sub")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("docs/a.md"), "a").unwrap();
        fs::write(root.join("docs/sub/b.md"), "b").unwrap();
        fs::write(root.join("docs/c.txt"), "c").unwrap();
        fs::write(root.join(".git/config.md"), "x").unwrap();
        fs::write(root.join("docs/draft.md"), "d").unwrap();

        let files = scan_dir(
            root,
            &["**/*.md".to_string()],
            &["**/draft.md".to_string()],
        )
        .unwrap();
        let names: Vec<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();
        assert_eq!(names, vec!["docs/a.md", "docs/sub/b.md"]);
    }

    #[test]
    fn scan_rejects_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = scan_dir(&tmp.path().join("nope"), &[], &[]).unwrap_err();
        assert!(matches!(err, NotebookError::InvalidInput(_)));
    }
}
