//! Provider abstraction over text-generation, embedding, speech and
//! transcription back ends.
//!
//! Every call into a model goes through a [`ProviderRequest`], a tagged
//! union with one variant per [`Capability`]. A [`Backend`] advertises which
//! capabilities it serves and answers requests with the matching
//! [`ProviderResponse`] variant. The [`ProviderRegistry`] maps logical
//! [`Role`]s onto configured backends and adds retry, failover and usage
//! accounting on top.
//!
//! # Shipped backends
//!
//! | `kind` | Backend | Capabilities |
//! |--------|---------|--------------|
//! | `openai`, `groq`, `mistral`, `openrouter`, `lmstudio`, `openai_compatible` | [`openai::OpenAiBackend`] | chat, embed, speech, transcribe |
//! | `anthropic` | [`anthropic::AnthropicBackend`] | chat |
//! | `gemini` | [`gemini::GeminiBackend`] | chat, embed |
//! | `ollama` | [`ollama::OllamaBackend`] | chat, embed |

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::models::MessageRole;

pub use registry::{
    bindings_from_config, Invocation, ModelTarget, ProviderHandle, ProviderRegistry, RetryPolicy, RoleBinding,
    UsageLog, UsageOutcome, UsageRecord,
};

/// What a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Embed,
    Speech,
    Transcribe,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Chat => "chat",
            Capability::Embed => "embed",
            Capability::Speech => "speech",
            Capability::Transcribe => "transcribe",
        };
        f.write_str(s)
    }
}

/// Logical job a model is used for. Each role is bound to a provider and
/// model in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Chat,
    /// Rewrites follow-up questions; resolves to the chat binding when
    /// not configured on its own.
    QueryRewrite,
    Embedding,
    Speech,
    Transcription,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Chat,
        Role::QueryRewrite,
        Role::Embedding,
        Role::Speech,
        Role::Transcription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Chat => "chat",
            Role::QueryRewrite => "query_rewrite",
            Role::Embedding => "embedding",
            Role::Speech => "speech",
            Role::Transcription => "transcription",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Role::ALL.into_iter().find(|r| r.as_str() == s)
    }

    pub fn capability(&self) -> Capability {
        match self {
            Role::Chat | Role::QueryRewrite => Capability::Chat,
            Role::Embedding => Capability::Embed,
            Role::Speech => Capability::Speech,
            Role::Transcription => Capability::Transcribe,
        }
    }

    /// Role consulted when this one has no binding of its own.
    pub fn fallback_role(&self) -> Option<Role> {
        match self {
            Role::QueryRewrite => Some(Role::Chat),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters attached to a role binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, options: GenerationOptions) -> Self {
        Self {
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
    pub language: Option<String>,
    pub format: String,
}

#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio: Vec<u8>,
    pub mime_type: String,
    pub language: Option<String>,
}

/// One request per capability.
#[derive(Debug, Clone)]
pub enum ProviderRequest {
    Chat(ChatRequest),
    Embed(EmbedRequest),
    Speech(SpeechRequest),
    Transcribe(TranscribeRequest),
}

impl ProviderRequest {
    pub fn capability(&self) -> Capability {
        match self {
            ProviderRequest::Chat(_) => Capability::Chat,
            ProviderRequest::Embed(_) => Capability::Embed,
            ProviderRequest::Speech(_) => Capability::Speech,
            ProviderRequest::Transcribe(_) => Capability::Transcribe,
        }
    }

    /// Rough work size recorded in the usage log: prompt characters for
    /// chat and speech, inputs for embeddings, bytes for audio.
    pub fn units(&self) -> u64 {
        match self {
            ProviderRequest::Chat(r) => r.messages.iter().map(|m| m.content.len() as u64).sum(),
            ProviderRequest::Embed(r) => r.inputs.len() as u64,
            ProviderRequest::Speech(r) => r.text.len() as u64,
            ProviderRequest::Transcribe(r) => r.audio.len() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    /// Set when the provider stopped because of the token limit.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechResponse {
    pub audio: Vec<u8>,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeResponse {
    pub text: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    Chat(ChatResponse),
    Embed(Vec<Vec<f32>>),
    Speech(SpeechResponse),
    Transcribe(TranscribeResponse),
}

impl ProviderResponse {
    pub fn capability(&self) -> Capability {
        match self {
            ProviderResponse::Chat(_) => Capability::Chat,
            ProviderResponse::Embed(_) => Capability::Embed,
            ProviderResponse::Speech(_) => Capability::Speech,
            ProviderResponse::Transcribe(_) => Capability::Transcribe,
        }
    }
}

/// A concrete model service.
///
/// Implementations translate a [`ProviderRequest`] into the provider's wire
/// format and classify failures into [`ProviderError`] variants so the
/// registry can decide between retrying, failing over and giving up.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Configured provider name (the `[providers.<name>]` key).
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Models this backend is known to serve, for display.
    fn known_models(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(
        &self,
        model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Reject a request the backend cannot serve.
pub(crate) fn unsupported(provider: &str, request: &ProviderRequest) -> ProviderError {
    ProviderError::UnsupportedCapability {
        provider: provider.to_string(),
        capability: request.capability(),
    }
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Read the credential named by `api_key_env`, if any.
pub(crate) fn read_api_key(config: &ProviderConfig) -> Option<String> {
    config
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|key| !key.is_empty())
}

/// Instantiate a backend for a `[providers.<name>]` table.
///
/// # Errors
///
/// Returns an error for unknown `kind` values or if the HTTP client cannot
/// be built. Missing credentials are reported at call time as
/// [`ProviderError::InvalidCredential`].
pub fn build_backend(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.kind.as_str() {
        "openai" | "groq" | "mistral" | "openrouter" | "lmstudio" | "openai_compatible" => {
            Arc::new(openai::OpenAiBackend::from_config(name, config)?)
        }
        "anthropic" => Arc::new(anthropic::AnthropicBackend::from_config(name, config)?),
        "gemini" => Arc::new(gemini::GeminiBackend::from_config(name, config)?),
        "ollama" => Arc::new(ollama::OllamaBackend::from_config(name, config)?),
        other => bail!(
            "Unknown provider kind '{}' for provider '{}'. Must be openai, groq, mistral, openrouter, lmstudio, openai_compatible, anthropic, gemini, or ollama.",
            other,
            name
        ),
    };
    Ok(backend)
}
