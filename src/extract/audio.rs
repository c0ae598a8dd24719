//! Audio files, transcribed through the `transcription` role.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{ExtractedDocument, FileInput, FormatHandler};
use crate::error::ExtractError;
use crate::providers::{ProviderRegistry, TranscribeRequest};

pub struct AudioHandler {
    registry: Arc<ProviderRegistry>,
}

impl AudioHandler {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl FormatHandler for AudioHandler {
    fn name(&self) -> &str {
        "audio"
    }

    fn mime_types(&self) -> &[&'static str] {
        &[
            "audio/mpeg",
            "audio/mp3",
            "audio/wav",
            "audio/x-wav",
            "audio/mp4",
            "audio/m4a",
            "audio/x-m4a",
            "audio/ogg",
            "audio/flac",
            "audio/x-flac",
            "audio/webm",
        ]
    }

    fn extensions(&self) -> &[&'static str] {
        &["mp3", "wav", "m4a", "ogg", "flac", "webm"]
    }

    async fn extract(&self, input: FileInput<'_>) -> Result<ExtractedDocument, ExtractError> {
        let invocation = self
            .registry
            .transcribe(TranscribeRequest {
                audio: input.bytes.to_vec(),
                mime_type: input.mime_type.to_string(),
                language: None,
            })
            .await?;
        info!(
            provider = %invocation.provider,
            model = %invocation.model,
            bytes = input.bytes.len(),
            "transcribed audio"
        );
        let text = invocation.output.text;
        if text.trim().is_empty() {
            return Err(ExtractError::ExtractionFailed(
                "transcription returned no speech".to_string(),
            ));
        }
        Ok(ExtractedDocument::new(text)
            .with_warning("transcribed from audio; speaker labels and timing not preserved"))
    }
}
