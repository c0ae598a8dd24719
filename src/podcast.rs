//! Podcast scripts from notebook content.
//!
//! [`PodcastScripter`] gathers a notebook's ingested sources and notes,
//! asks the `chat` role for a dialogue between the configured speakers and
//! parses the reply into ordered `(speaker, text)` segments. Turning those
//! segments into audio is the job of a [`PodcastRenderer`];
//! [`SpeechRenderer`] is a simple one that synthesizes each segment through
//! the `speech` role and writes the clips to a directory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PodcastConfig;
use crate::error::{NotebookError, ProviderError, Result};
use crate::models::{Chunk, SourceStatus};
use crate::providers::{ChatMessage, ProviderRegistry, Role, SpeechRequest};
use crate::store::SqliteStore;

/// Material beyond this many characters is left out of the prompt.
const MAX_MATERIAL_CHARS: usize = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodcastSegment {
    pub speaker: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodcastScript {
    pub notebook_id: String,
    pub style: String,
    pub word_budget: usize,
    pub source_ids: Vec<String>,
    pub note_ids: Vec<String>,
    pub segments: Vec<PodcastSegment>,
}

/// Which parts of the notebook feed the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodcastContent {
    pub sources: bool,
    pub notes: bool,
}

impl Default for PodcastContent {
    fn default() -> Self {
        Self {
            sources: true,
            notes: true,
        }
    }
}

/// Opaque reference to rendered audio (a path, URL or job id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioArtifact(pub String);

/// Downstream audio production.
#[async_trait]
pub trait PodcastRenderer: Send + Sync {
    async fn render(&self, segments: &[PodcastSegment]) -> Result<AudioArtifact>;
}

pub struct PodcastScripter {
    store: Arc<SqliteStore>,
    registry: Arc<ProviderRegistry>,
    config: PodcastConfig,
}

struct Material {
    title: String,
    text: String,
}

impl PodcastScripter {
    pub fn new(
        store: Arc<SqliteStore>,
        registry: Arc<ProviderRegistry>,
        config: PodcastConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn script(&self, notebook_id: &str, content: PodcastContent) -> Result<PodcastScript> {
        self.store.get_notebook(notebook_id).await?;
        let mut material = Vec::new();
        let mut source_ids = Vec::new();
        let mut note_ids = Vec::new();

        if content.sources {
            for source in self.store.list_sources(notebook_id).await? {
                if source.status != SourceStatus::Done {
                    continue;
                }
                let text = source_text(&self.store.list_chunks(&source.id).await?);
                if text.trim().is_empty() {
                    continue;
                }
                material.push(Material {
                    title: format!("Source: {}", source.display_title()),
                    text,
                });
                source_ids.push(source.id);
            }
        }
        if content.notes {
            for note in self.store.list_notes(notebook_id).await? {
                let title = note.title.clone().unwrap_or_else(|| note.id.clone());
                material.push(Material {
                    title: format!("Note: {}", title),
                    text: note.text,
                });
                note_ids.push(note.id);
            }
        }

        let content_words: usize = material
            .iter()
            .map(|m| m.text.split_whitespace().count())
            .sum();
        if content_words == 0 {
            return Err(NotebookError::InvalidInput(
                "notebook has no content to build a podcast from".to_string(),
            ));
        }
        let word_budget = self.config.word_count.min(content_words);

        let messages = vec![
            ChatMessage::system(self.instructions(word_budget)),
            ChatMessage::user(render_material(&material)),
        ];
        let invocation = self.registry.chat(Role::Chat, messages).await?;
        let segments = parse_script(&invocation.output.text, &self.config.speakers);
        if segments.is_empty() {
            return Err(ProviderError::malformed(
                &invocation.provider,
                "reply contained no speaker lines",
            )
            .into());
        }
        info!(
            notebook_id,
            segments = segments.len(),
            word_budget,
            sources = source_ids.len(),
            notes = note_ids.len(),
            "podcast script written"
        );

        Ok(PodcastScript {
            notebook_id: notebook_id.to_string(),
            style: self.config.style.clone(),
            word_budget,
            source_ids,
            note_ids,
            segments,
        })
    }

    /// Write a script and hand it to `renderer`.
    pub async fn produce(
        &self,
        notebook_id: &str,
        content: PodcastContent,
        renderer: &dyn PodcastRenderer,
    ) -> Result<(PodcastScript, AudioArtifact)> {
        let script = self.script(notebook_id, content).await?;
        let artifact = renderer.render(&script.segments).await?;
        Ok((script, artifact))
    }

    fn instructions(&self, word_budget: usize) -> String {
        format!(
            "You write podcast scripts. Write a {style} dialogue between {speakers} that walks \
             a listener through the material the user provides, in about {words} words. Put \
             every turn on its own line formatted as `Speaker: text`, using only these speaker \
             names: {names}. Do not add stage directions.",
            style = self.config.style,
            speakers = self.config.speakers.join(" and "),
            words = word_budget,
            names = self.config.speakers.join(", "),
        )
    }
}

fn render_material(material: &[Material]) -> String {
    let mut out = String::new();
    for item in material {
        out.push_str(&format!("## {}\n\n{}\n\n", item.title, item.text.trim()));
    }
    if out.chars().count() > MAX_MATERIAL_CHARS {
        warn!(limit = MAX_MATERIAL_CHARS, "podcast material truncated");
        out = out.chars().take(MAX_MATERIAL_CHARS).collect();
    }
    out
}

/// Rebuild source text from its chunks by concatenating the owned spans.
pub fn source_text(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .flat_map(|c| c.text.chars().skip(c.overlap.max(0) as usize))
        .collect()
}

/// Parse `Speaker: text` lines. Lines without a known speaker continue the
/// previous turn; consecutive turns by one speaker are merged.
pub fn parse_script(text: &str, speakers: &[String]) -> Vec<PodcastSegment> {
    let mut segments: Vec<PodcastSegment> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match split_speaker(line, speakers) {
            Some((speaker, said)) => match segments.last_mut() {
                Some(last) if last.speaker == speaker => {
                    last.text.push(' ');
                    last.text.push_str(said);
                }
                _ => segments.push(PodcastSegment {
                    speaker: speaker.to_string(),
                    text: said.to_string(),
                }),
            },
            None => {
                if let Some(last) = segments.last_mut() {
                    last.text.push(' ');
                    last.text.push_str(line);
                }
            }
        }
    }
    segments.retain(|s| !s.text.trim().is_empty());
    segments
}

fn split_speaker<'a, 'b>(line: &'a str, speakers: &'b [String]) -> Option<(&'b str, &'a str)> {
    let (label, rest) = line.split_once(':')?;
    let label = label.trim().trim_matches(['*', '_']).trim();
    let rest = rest.trim_start_matches(['*', '_']).trim();
    speakers
        .iter()
        .find(|s| s.eq_ignore_ascii_case(label))
        .map(|s| (s.as_str(), rest))
}

/// Synthesizes each segment through the `speech` role and writes numbered
/// clips into `out_dir`. The artifact is the directory path.
pub struct SpeechRenderer {
    registry: Arc<ProviderRegistry>,
    speakers: Vec<String>,
    voices: Vec<String>,
    format: String,
    out_dir: PathBuf,
}

impl SpeechRenderer {
    pub fn new(registry: Arc<ProviderRegistry>, config: &PodcastConfig, out_dir: PathBuf) -> Self {
        Self {
            registry,
            speakers: config.speakers.clone(),
            voices: config.voices.clone(),
            format: config.audio_format.clone(),
            out_dir,
        }
    }

    fn voice_for(&self, speaker: &str) -> String {
        let index = self
            .speakers
            .iter()
            .position(|s| s == speaker)
            .unwrap_or(0);
        match self.voices.len() {
            0 => "alloy".to_string(),
            n => self.voices[index % n].clone(),
        }
    }
}

#[async_trait]
impl PodcastRenderer for SpeechRenderer {
    async fn render(&self, segments: &[PodcastSegment]) -> Result<AudioArtifact> {
        tokio::fs::create_dir_all(&self.out_dir).await.map_err(|e| {
            NotebookError::InvalidInput(format!("cannot create {}: {}", self.out_dir.display(), e))
        })?;
        for (i, segment) in segments.iter().enumerate() {
            let invocation = self
                .registry
                .synthesize(SpeechRequest {
                    text: segment.text.clone(),
                    voice: self.voice_for(&segment.speaker),
                    language: None,
                    format: self.format.clone(),
                })
                .await?;
            let path = self.out_dir.join(format!(
                "{:03}_{}.{}",
                i + 1,
                segment.speaker.to_lowercase(),
                invocation.output.format
            ));
            tokio::fs::write(&path, &invocation.output.audio)
                .await
                .map_err(|e| {
                    NotebookError::InvalidInput(format!("cannot write {}: {}", path.display(), e))
                })?;
        }
        Ok(AudioArtifact(self.out_dir.display().to_string()))
    }
}
