//! Anthropic Messages API backend (chat only).

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

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    models: Vec<String>,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let mut models = vec![
            "claude-3-5-sonnet-latest".to_string(),
            "claude-3-5-haiku-latest".to_string(),
        ];
        models.extend(config.models.iter().cloned());
        Ok(Self {
            name: name.to_string(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: read_api_key(config),
            models,
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn chat(&self, model: &str, chat: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::InvalidCredential {
                provider: self.name.clone(),
                message: "API key environment variable not set".to_string(),
            })?;

        // System prompts travel in a top-level field, not in `messages`.
        let system: Vec<&str> = chat
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<serde_json::Value> = chat
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": model,
            "max_tokens": chat.max_tokens,
            "temperature": chat.temperature,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(&self.name, status.as_u16(), text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(&self.name, e.to_string()))?;
        parse_messages_response(&self.name, &json)
    }
}

fn parse_messages_response(
    provider: &str,
    json: &serde_json::Value,
) -> Result<ChatResponse, ProviderError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ProviderError::malformed(provider, "missing content"))?;
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    let truncated = json.get("stop_reason").and_then(|s| s.as_str()) == Some("max_tokens");
    Ok(ChatResponse { text, truncated })
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Chat]
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
            other => Err(unsupported(&self.name, other)),
        }
    }
}
