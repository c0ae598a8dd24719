//! TOML configuration.
//!
//! Every section is optional; missing values fall back to the defaults
//! below. [`load_config`] parses and validates a file, and
//! [`Config::default`] gives a usable configuration for tests and for
//! `notebook init`.
//!
//! ```toml
//! [db]
//! path = "./data/notebook.sqlite"
//!
//! [chunking]
//! target_chars = 1000
//! overlap_chars = 200
//!
//! [providers.openai]
//! kind = "openai"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [roles.chat]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! options = { temperature = 0.7, max_tokens = 4000 }
//!
//! [roles.embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::providers::{GenerationOptions, Role};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
    #[serde(default)]
    pub podcast: PodcastConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/notebook.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    /// How far back from the hard cut the chunker looks for a natural break.
    #[serde(default = "default_boundary_window")]
    pub boundary_window: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: default_target_chars(),
            overlap_chars: default_overlap_chars(),
            boundary_window: default_boundary_window(),
        }
    }
}

fn default_target_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_boundary_window() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum number of times a failing batch is halved before the
    /// failure is surfaced.
    #[serde(default = "default_max_split_depth")]
    pub max_split_depth: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_split_depth: default_max_split_depth(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_max_split_depth() -> u32 {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_rewrite")]
    pub rewrite: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            history_turns: default_history_turns(),
            rewrite: default_rewrite(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    8000
}
fn default_history_turns() -> usize {
    10
}
fn default_rewrite() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    32_000
}

/// A `[providers.<name>]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub kind: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra model ids to list alongside the backend's built-in ones.
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_provider_timeout_secs() -> u64 {
    60
}

/// A `[roles.<role>]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct RoleConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub options: RoleOptions,
    /// Alternates tried in order after the primary exhausts its retries.
    #[serde(default)]
    pub fallbacks: Vec<FallbackConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RoleOptions {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl RoleOptions {
    pub fn to_generation(&self) -> GenerationOptions {
        let defaults = GenerationOptions::default();
        GenerationOptions {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PodcastConfig {
    #[serde(default = "default_speakers")]
    pub speakers: Vec<String>,
    #[serde(default = "default_word_count")]
    pub word_count: usize,
    #[serde(default = "default_style")]
    pub style: String,
    /// Speech voices, assigned to speakers by position.
    #[serde(default = "default_voices")]
    pub voices: Vec<String>,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
}

impl Default for PodcastConfig {
    fn default() -> Self {
        Self {
            speakers: default_speakers(),
            word_count: default_word_count(),
            style: default_style(),
            voices: default_voices(),
            audio_format: default_audio_format(),
        }
    }
}

fn default_speakers() -> Vec<String> {
    vec!["Host".to_string(), "Guest".to_string()]
}
fn default_word_count() -> usize {
    1000
}
fn default_style() -> String {
    "conversational".to_string()
}
fn default_voices() -> Vec<String> {
    vec!["alloy".to_string(), "echo".to_string()]
}
fn default_audio_format() -> String {
    "mp3".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.target_chars == 0 {
        anyhow::bail!("chunking.target_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.target_chars {
        anyhow::bail!(
            "chunking.overlap_chars ({}) must be < chunking.target_chars ({})",
            config.chunking.overlap_chars,
            config.chunking.target_chars
        );
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        anyhow::bail!("retrieval.max_context_chars must be > 0");
    }

    if config.ingest.max_concurrent == 0 {
        anyhow::bail!("ingest.max_concurrent must be > 0");
    }

    if config.podcast.speakers.is_empty() {
        anyhow::bail!("podcast.speakers must name at least one speaker");
    }

    // Validate roles
    for (name, role) in &config.roles {
        if Role::parse(name).is_none() {
            anyhow::bail!(
                "Unknown role '{}'. Must be chat, query_rewrite, embedding, speech, or transcription.",
                name
            );
        }
        if !config.providers.contains_key(&role.provider) {
            anyhow::bail!(
                "roles.{} references undeclared provider '{}'",
                name,
                role.provider
            );
        }
        for fallback in &role.fallbacks {
            if !config.providers.contains_key(&fallback.provider) {
                anyhow::bail!(
                    "roles.{} fallback references undeclared provider '{}'",
                    name,
                    fallback.provider
                );
            }
        }
        if let Some(t) = role.options.temperature {
            if !(0.0..=2.0).contains(&t) {
                anyhow::bail!("roles.{}.options.temperature must be in [0.0, 2.0]", name);
            }
        }
    }

    Ok(())
}
