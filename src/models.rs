//! Core data models used throughout the notebook pipeline.
//!
//! These types represent the notebooks, sources, chunks, notes and
//! conversations that flow between the ingestion pipeline, the knowledge
//! store and the retrieval orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Top-level container for sources, notes and conversations.
#[derive(Debug, Clone, Serialize)]
pub struct Notebook {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a source's raw content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceOrigin {
    File,
    Url,
    Text,
}

impl SourceOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOrigin::File => "file",
            SourceOrigin::Url => "url",
            SourceOrigin::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(SourceOrigin::File),
            "url" => Some(SourceOrigin::Url),
            "text" => Some(SourceOrigin::Text),
            _ => None,
        }
    }
}

/// Extraction lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Processing => "processing",
            SourceStatus::Done => "done",
            SourceStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SourceStatus::Pending),
            "processing" => Some(SourceStatus::Processing),
            "done" => Some(SourceStatus::Done),
            "failed" => Some(SourceStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceStatus::Done | SourceStatus::Failed)
    }
}

/// Raw input for one source. Persisted alongside the source so it can be
/// re-ingested later.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDescriptor {
    File {
        bytes: Vec<u8>,
        /// Declared type; detected from the bytes and filename when absent.
        mime_type: Option<String>,
        filename: Option<String>,
    },
    Url(String),
    Text {
        text: String,
        title: Option<String>,
    },
}

impl SourceDescriptor {
    pub fn origin(&self) -> SourceOrigin {
        match self {
            SourceDescriptor::File { .. } => SourceOrigin::File,
            SourceDescriptor::Url(_) => SourceOrigin::Url,
            SourceDescriptor::Text { .. } => SourceOrigin::Text,
        }
    }

    /// Metadata known before extraction runs.
    pub fn initial_metadata(&self) -> SourceMetadata {
        match self {
            SourceDescriptor::File {
                mime_type,
                filename,
                ..
            } => SourceMetadata {
                title: filename.clone(),
                mime_type: mime_type.clone(),
                filename: filename.clone(),
                ..Default::default()
            },
            SourceDescriptor::Url(url) => SourceMetadata {
                url: Some(url.clone()),
                ..Default::default()
            },
            SourceDescriptor::Text { title, .. } => SourceMetadata {
                title: title.clone(),
                mime_type: Some("text/plain".to_string()),
                ..Default::default()
            },
        }
    }
}

/// Descriptive metadata captured during extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub url: Option<String>,
}

/// A single ingested document.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: String,
    pub notebook_id: String,
    pub origin: SourceOrigin,
    pub metadata: SourceMetadata,
    pub status: SourceStatus,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    /// Chunk-set version visible to readers; `None` until the first
    /// successful ingestion.
    pub active_version: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn display_title(&self) -> &str {
        self.metadata
            .title
            .as_deref()
            .or(self.metadata.filename.as_deref())
            .or(self.metadata.url.as_deref())
            .unwrap_or("(untitled)")
    }
}

/// Response shape of `get_source_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatusReport {
    pub source_id: String,
    pub status: SourceStatus,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// A bounded text segment of a source.
///
/// `start_offset..end_offset` is the character span this chunk owns in the
/// source text; spans of one chunk set are contiguous and never overlap.
/// `text` additionally carries `overlap` characters preceding the span so
/// neighbouring chunks share context: it is the source text over
/// `text_start()..end_offset`, not `start_offset..end_offset`.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    pub ordinal: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub overlap: i64,
    pub hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Character offset in the source where `text` begins.
    pub fn text_start(&self) -> i64 {
        self.start_offset - self.overlap
    }
}

/// A chunk returned from similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub source_title: Option<String>,
    pub score: f32,
}

/// Who wrote a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorKind {
    Human,
    Ai,
}

impl AuthorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorKind::Human => "human",
            AuthorKind::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(AuthorKind::Human),
            "ai" => Some(AuthorKind::Ai),
            _ => None,
        }
    }
}

/// An annotation attached to a notebook.
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub id: String,
    pub notebook_id: String,
    pub title: Option<String>,
    pub text: String,
    pub author: AuthorKind,
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A chat session scoped to one notebook.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub notebook_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One entry of a conversation transcript. Never modified once stored.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: MessageRole,
    pub text: String,
    pub cited_chunk_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A message waiting to be appended; `seq` and `id` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub text: String,
    pub cited_chunk_ids: Vec<String>,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            cited_chunk_ids: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, cited_chunk_ids: Vec<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
            cited_chunk_ids,
        }
    }
}
