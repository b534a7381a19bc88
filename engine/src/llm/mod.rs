//! Language-model providers
//!
//! Concrete [`LanguageModel`] implementations. The chain executor only sees
//! the trait; which provider backs it is decided here from config.

use reqwest::{Client, StatusCode};
use sdk::errors::{EngineError, ModelError};
use sdk::model::LanguageModel;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LLMConfig;

pub mod ollama;
pub mod openai;

pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;

/// HTTP client with a request timeout. Falls back to the default client if
/// the TLS backend cannot be configured.
pub(crate) fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client, using defaults: {}", e);
            Client::new()
        })
}

/// Map an unsuccessful HTTP status onto a model error
pub(crate) fn map_status(status: StatusCode, body: String) -> ModelError {
    match status.as_u16() {
        401 | 403 => ModelError::AuthenticationFailed(body),
        429 => ModelError::RateLimitExceeded,
        400..=499 => ModelError::InvalidRequest(body),
        _ => ModelError::ProviderUnavailable(body),
    }
}

/// Build the provider selected in config
pub fn build_provider(config: &LLMConfig) -> Result<Arc<dyn LanguageModel>, EngineError> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(
            config.ollama.base_url.clone(),
            config.ollama.model.clone(),
        ))),
        "openai" => Ok(Arc::new(OpenAIProvider::from_env(config.openai.clone()))),
        other => Err(EngineError::Config(format!("Unknown LLM provider '{}'", other))),
    }
}
