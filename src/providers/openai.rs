//! OpenAI-compatible HTTP backend.
//!
//! Serves every provider that speaks the OpenAI `/v1` dialect: OpenAI
//! itself, Groq, Mistral, OpenRouter, LM Studio and self-hosted servers.
//! The `kind` only picks a default base URL and model list.
//!
//! | Capability | Endpoint |
//! |------------|----------|
//! | chat | `POST {base}/chat/completions` |
//! | embed | `POST {base}/embeddings` |
//! | speech | `POST {base}/audio/speech` |
//! | transcribe | `POST {base}/audio/transcriptions` (multipart) |

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{
    http_client, read_api_key, Backend, Capability, ChatResponse, ProviderRequest,
    ProviderResponse, SpeechResponse, TranscribeResponse,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

const CAPABILITIES: &[Capability] = &[
    Capability::Chat,
    Capability::Embed,
    Capability::Speech,
    Capability::Transcribe,
];

pub struct OpenAiBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    /// Local servers (LM Studio, self-hosted) accept anonymous calls.
    requires_key: bool,
    models: Vec<String>,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let (default_url, requires_key, builtin) = defaults_for(&config.kind);
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_url.to_string());
        let mut models: Vec<String> = builtin.iter().map(|m| m.to_string()).collect();
        models.extend(config.models.iter().cloned());

        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: read_api_key(config),
            requires_key,
            models,
            client: http_client(config.timeout_secs)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ProviderError> {
        match &self.api_key {
            Some(key) => Ok(builder.header("Authorization", format!("Bearer {}", key))),
            None if self.requires_key => Err(ProviderError::InvalidCredential {
                provider: self.name.clone(),
                message: "API key environment variable not set".to_string(),
            }),
            None => Ok(builder),
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .authorize(builder)?
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(&self.name, status.as_u16(), body))
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value, ProviderError> {
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::malformed(&self.name, e.to_string()))
    }
}

/// Default base URL, whether a key is mandatory, and built-in model list.
fn defaults_for(kind: &str) -> (&'static str, bool, &'static [&'static str]) {
    match kind {
        "groq" => (
            "https://api.groq.com/openai/v1",
            true,
            &["llama-3.3-70b-versatile", "llama-3.1-8b-instant", "whisper-large-v3"],
        ),
        "mistral" => (
            "https://api.mistral.ai/v1",
            true,
            &["mistral-large-latest", "mistral-small-latest", "mistral-embed"],
        ),
        "openrouter" => ("https://openrouter.ai/api/v1", true, &[]),
        "lmstudio" => ("http://localhost:1234/v1", false, &[]),
        "openai_compatible" => ("http://localhost:8080/v1", false, &[]),
        _ => (
            "https://api.openai.com/v1",
            true,
            &[
                "gpt-4o",
                "gpt-4o-mini",
                "text-embedding-3-small",
                "text-embedding-3-large",
                "tts-1",
                "whisper-1",
            ],
        ),
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn known_models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn invoke(
        &self,
        model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        match request {
            ProviderRequest::Chat(chat) => {
                let messages: Vec<serde_json::Value> = chat
                    .messages
                    .iter()
                    .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                    .collect();
                let body = json!({
                    "model": model,
                    "messages": messages,
                    "temperature": chat.temperature,
                    "max_tokens": chat.max_tokens,
                });
                let json = self
                    .send_json(self.client.post(self.url("chat/completions")).json(&body))
                    .await?;
                parse_chat_response(&self.name, &json).map(ProviderResponse::Chat)
            }
            ProviderRequest::Embed(embed) => {
                let body = json!({ "model": model, "input": embed.inputs });
                let json = self
                    .send_json(self.client.post(self.url("embeddings")).json(&body))
                    .await?;
                parse_embedding_response(&self.name, &json).map(ProviderResponse::Embed)
            }
            ProviderRequest::Speech(speech) => {
                let body = json!({
                    "model": model,
                    "input": speech.text,
                    "voice": speech.voice,
                    "response_format": speech.format,
                });
                let response = self
                    .send(self.client.post(self.url("audio/speech")).json(&body))
                    .await?;
                let audio = response
                    .bytes()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;
                Ok(ProviderResponse::Speech(SpeechResponse {
                    audio: audio.to_vec(),
                    format: speech.format.clone(),
                }))
            }
            ProviderRequest::Transcribe(audio) => {
                let ext = audio
                    .mime_type
                    .rsplit('/')
                    .next()
                    .unwrap_or("bin")
                    .to_string();
                let file_part = reqwest::multipart::Part::bytes(audio.audio.clone())
                    .file_name(format!("audio.{}", ext))
                    .mime_str(&audio.mime_type)
                    .map_err(|e| ProviderError::Rejected {
                        provider: self.name.clone(),
                        message: format!("invalid audio mime type: {}", e),
                    })?;
                let mut form = reqwest::multipart::Form::new()
                    .part("file", file_part)
                    .text("model", model.to_string());
                if let Some(lang) = &audio.language {
                    form = form.text("language", lang.clone());
                }
                let json = self
                    .send_json(
                        self.client
                            .post(self.url("audio/transcriptions"))
                            .multipart(form),
                    )
                    .await?;
                let text = json
                    .get("text")
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| ProviderError::malformed(&self.name, "missing text"))?;
                Ok(ProviderResponse::Transcribe(TranscribeResponse {
                    text: text.to_string(),
                    language: json
                        .get("language")
                        .and_then(|l| l.as_str())
                        .map(String::from),
                }))
            }
        }
    }
}

/// Extract `choices[0].message.content`; `finish_reason == "length"` marks
/// the answer as truncated.
fn parse_chat_response(provider: &str, json: &serde_json::Value) -> Result<ChatResponse, ProviderError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::malformed(provider, "missing choices"))?;
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::malformed(provider, "missing message content"))?;
    let truncated = choice.get("finish_reason").and_then(|f| f.as_str()) == Some("length");
    Ok(ChatResponse {
        text: text.to_string(),
        truncated,
    })
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embedding_response(
    provider: &str,
    json: &serde_json::Value,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::malformed(provider, "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::malformed(provider, "missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_finish_marks_truncated() {
        let json = json!({
            "choices": [{ "message": { "content": "partial" }, "finish_reason": "length" }]
        });
        let resp = parse_chat_response("p", &json).unwrap();
        assert!(resp.truncated);
        assert_eq!(resp.text, "partial");
    }

    #[test]
    fn embeddings_are_reordered_by_index() {
        let json = json!({
            "data": [
                { "index": 1, "embedding": [2.0] },
                { "index": 0, "embedding": [1.0] }
            ]
        });
        let vecs = parse_embedding_response("p", &json).unwrap();
        assert_eq!(vecs, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn missing_choices_is_malformed() {
        let err = parse_chat_response("p", &json!({})).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    }
}
