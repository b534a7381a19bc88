//! External language-model service interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

/// Sampling parameters passed with every prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Optional system instruction prepended by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Sampling temperature (0.0-2.0)
    pub temperature: f32,

    /// Upper bound on generated tokens
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

impl GenerationParams {
    /// Sets the system instruction
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }
}

/// A text-generation backend
///
/// This is the single call type wrapped by the call governor.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name (e.g. "ollama", "openai")
    fn name(&self) -> &str;

    /// Generates a completion for `prompt`
    async fn generate(&self, prompt: &str, params: &GenerationParams)
        -> Result<String, ModelError>;

    /// Checks whether the provider is reachable. Defaults to true.
    async fn check_health(&self) -> bool {
        true
    }
}
