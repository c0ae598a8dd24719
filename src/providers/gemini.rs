//! Google Gemini backend (chat and embeddings).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{
    http_client, read_api_key, unsupported, Backend, Capability, ChatRequest, ChatResponse,
    ProviderRequest, ProviderResponse,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::models::MessageRole;

pub struct GeminiBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    models: Vec<String>,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let mut models = vec![
            "gemini-1.5-pro".to_string(),
            "gemini-1.5-flash".to_string(),
            "text-embedding-004".to_string(),
        ];
        models.extend(config.models.iter().cloned());
        Ok(Self {
            name: name.to_string(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: read_api_key(config),
            models,
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn post(
        &self,
        model: &str,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::InvalidCredential {
                provider: self.name.clone(),
                message: "API key environment variable not set".to_string(),
            })?;
        let response = self
            .client
            .post(format!("{}/models/{}:{}", self.base_url, model, method))
            .header("x-goog-api-key", api_key)
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

    async fn chat(&self, model: &str, chat: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let system: Vec<&str> = chat
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<serde_json::Value> = chat
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| {
                let role = if m.role == MessageRole::Assistant {
                    "model"
                } else {
                    "user"
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": chat.temperature,
                "maxOutputTokens": chat.max_tokens,
            }
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }

        let json = self.post(model, "generateContent", &body).await?;
        parse_generate_response(&self.name, &json)
    }

    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let requests: Vec<serde_json::Value> = inputs
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", model),
                    "content": { "parts": [{ "text": text }] }
                })
            })
            .collect();
        let json = self
            .post(model, "batchEmbedContents", &json!({ "requests": requests }))
            .await?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::malformed(&self.name, "missing embeddings"))?;
        embeddings
            .iter()
            .map(|e| {
                e.get("values")
                    .and_then(|v| v.as_array())
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                            .collect()
                    })
                    .ok_or_else(|| ProviderError::malformed(&self.name, "missing values"))
            })
            .collect()
    }
}

fn parse_generate_response(
    provider: &str,
    json: &serde_json::Value,
) -> Result<ChatResponse, ProviderError> {
    let candidate = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::malformed(provider, "missing candidates"))?;
    let text: String = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();
    let truncated = candidate.get("finishReason").and_then(|f| f.as_str()) == Some("MAX_TOKENS");
    Ok(ChatResponse { text, truncated })
}

#[async_trait]
impl Backend for GeminiBackend {
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
            ProviderRequest::Chat(chat) => self.chat(model, chat).await.map(ProviderResponse::Chat),
            ProviderRequest::Embed(embed) => self
                .embed(model, &embed.inputs)
                .await
                .map(ProviderResponse::Embed),
            other => Err(unsupported(&self.name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_candidate_parts() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "a" }, { "text": "b" }] },
                "finishReason": "STOP"
            }]
        });
        let resp = parse_generate_response("gemini", &json).unwrap();
        assert_eq!(resp.text, "ab");
        assert!(!resp.truncated);
    }
}
