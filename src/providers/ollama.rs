//! Ollama native API backend (chat and embeddings). No credentials.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{
    http_client, unsupported, Backend, Capability, ChatResponse, ProviderRequest, ProviderResponse,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub struct OllamaBackend {
    name: String,
    base_url: String,
    models: Vec<String>,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            models: config.models.clone(),
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(&self.name, status.as_u16(), text));
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(&self.name, e.to_string()))
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Chat, Capability::Embed]
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
                    "stream": false,
                    "options": {
                        "temperature": chat.temperature,
                        "num_predict": chat.max_tokens,
                    }
                });
                let json = self.post("chat", &body).await?;
                let text = json
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| ProviderError::malformed(&self.name, "missing message content"))?;
                let truncated = json.get("done_reason").and_then(|d| d.as_str()) == Some("length");
                Ok(ProviderResponse::Chat(ChatResponse {
                    text: text.to_string(),
                    truncated,
                }))
            }
            ProviderRequest::Embed(embed) => {
                let body = json!({ "model": model, "input": embed.inputs });
                let json = self.post("embed", &body).await?;
                let embeddings = json
                    .get("embeddings")
                    .and_then(|e| e.as_array())
                    .ok_or_else(|| ProviderError::malformed(&self.name, "missing embeddings"))?;
                let vectors = embeddings
                    .iter()
                    .map(|e| {
                        e.as_array()
                            .map(|values| {
                                values
                                    .iter()
                                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                                    .collect()
                            })
                            .ok_or_else(|| ProviderError::malformed(&self.name, "bad embedding"))
                    })
                    .collect::<Result<Vec<Vec<f32>>, ProviderError>>()?;
                Ok(ProviderResponse::Embed(vectors))
            }
            other => Err(unsupported(&self.name, other)),
        }
    }
}
