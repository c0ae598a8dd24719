//! Error taxonomy shared by every pipeline stage.
//!
//! Each layer has its own error type ([`ProviderError`], [`ExtractError`],
//! [`StoreError`]); [`NotebookError`] unifies them at the pipeline and
//! orchestration boundary and classifies them with [`ErrorKind`] so
//! callers can tell a transient failure from a permanent one.

use thiserror::Error;

use crate::providers::{Capability, Role};

/// Errors raised by provider backends and the provider registry.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{provider} rate limited the request: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider} timed out: {message}")]
    Timeout { provider: String, message: String },

    #[error("{provider} server error {status}: {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("network error talking to {provider}: {message}")]
    Network { provider: String, message: String },

    #[error("invalid credential for {provider}: {message}")]
    InvalidCredential { provider: String, message: String },

    #[error("{provider} rejected the request: {message}")]
    Rejected { provider: String, message: String },

    #[error("{provider} returned a malformed response: {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("provider '{provider}' does not support {capability}")]
    UnsupportedCapability {
        provider: String,
        capability: Capability,
    },

    #[error("no provider configured for role '{0}'")]
    RoleNotConfigured(Role),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("all providers for role '{role}' exhausted; last error: {last}")]
    ProviderUnavailable { role: Role, last: String },
}

impl ProviderError {
    /// Whether a retry (now or later) may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Server { .. }
                | ProviderError::Network { .. }
                | ProviderError::ProviderUnavailable { .. }
        )
    }

    /// Classify a non-success HTTP status.
    ///
    /// 429 and 5xx are retriable, 401/403 are credential problems, every
    /// other 4xx is a permanent rejection.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        let provider = provider.to_string();
        match status {
            401 | 403 => ProviderError::InvalidCredential {
                provider,
                message: body,
            },
            408 => ProviderError::Timeout {
                provider,
                message: body,
            },
            429 => ProviderError::RateLimited {
                provider,
                message: body,
            },
            s if s >= 500 => ProviderError::Server {
                provider,
                status: s,
                message: body,
            },
            _ => ProviderError::Rejected {
                provider,
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }

    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: provider.to_string(),
                message: err.to_string(),
            }
        } else {
            ProviderError::Network {
                provider: provider.to_string(),
                message: err.to_string(),
            }
        }
    }

    pub fn malformed(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::MalformedResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

/// Errors raised while turning a source descriptor into text.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("timed out fetching {0}")]
    FetchTimeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Errors raised by the knowledge store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Map a write error, turning foreign-key and uniqueness failures into
    /// [`StoreError::ConstraintViolation`].
    pub fn from_write(err: sqlx::Error, what: &str) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_foreign_key_violation() {
                return StoreError::ConstraintViolation(format!(
                    "{} references a missing parent",
                    what
                ));
            }
            if db_err.is_unique_violation() {
                return StoreError::ConstraintViolation(format!("{} already exists", what));
            }
        }
        StoreError::Database(err)
    }
}

/// Coarse classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientProvider,
    PermanentProvider,
    Extraction,
    Consistency,
    NotFound,
    InvalidInput,
    Cancelled,
}

/// Umbrella error for pipeline and orchestration operations.
#[derive(Debug, Error)]
pub enum NotebookError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl NotebookError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NotebookError::Provider(e) if e.is_transient() => ErrorKind::TransientProvider,
            NotebookError::Provider(_) => ErrorKind::PermanentProvider,
            NotebookError::Extraction(ExtractError::Provider(e)) if e.is_transient() => {
                ErrorKind::TransientProvider
            }
            NotebookError::Extraction(ExtractError::FetchTimeout(_)) => {
                ErrorKind::TransientProvider
            }
            NotebookError::Extraction(_) => ErrorKind::Extraction,
            NotebookError::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            NotebookError::Store(_) => ErrorKind::Consistency,
            NotebookError::InvalidInput(_) => ErrorKind::InvalidInput,
            NotebookError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientProvider
    }
}

pub type Result<T, E = NotebookError> = std::result::Result<T, E>;
