//! OpenAI-compatible provider
//!
//! Any server exposing `/chat/completions` in the OpenAI format. The API key
//! is read from the environment variable named in config and never stored.

use async_trait::async_trait;
use reqwest::Client;
use sdk::errors::ModelError;
use sdk::model::{GenerationParams, LanguageModel};
use serde_json::{json, Value};
use std::time::Duration;

use super::{http_client, map_status};
use crate::config::OpenAIConfig;

pub struct OpenAIProvider {
    config: OpenAIConfig,
    api_key: Option<String>,
    client: Client,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig, api_key: Option<String>) -> Self {
        Self {
            config,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            client: http_client(Duration::from_secs(120)),
        }
    }

    /// Create a provider reading the key from `config.api_key_env`
    pub fn from_env(config: OpenAIConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok();
        Self::new(config, api_key)
    }

    fn build_payload(&self, prompt: &str, params: &GenerationParams) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &params.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn check_health(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ModelError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ModelError::AuthenticationFailed(format!("{} is not set", self.config.api_key_env))
        })?;

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.build_payload(prompt, params))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::NetworkError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status, text));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ModelError::ParseError(e.to_string()))?;

        data.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(str::to_string)
            .ok_or_else(|| ModelError::ParseError("No message content in response".to_string()))
    }
}
