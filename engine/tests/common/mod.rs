//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use rhythm_engine::config::{Config, StoreBackend};
use rhythm_engine::registry::ServiceRegistry;
use rhythm_engine::store::InMemoryStore;
use sdk::errors::ModelError;
use sdk::model::{GenerationParams, LanguageModel};
use sdk::store::PersistentStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Model that returns a fixed reply, or fails while `failing` is set
pub struct ScriptedModel {
    reply: String,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        let model = Self::replying("");
        model.set_failing(true);
        model
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(ModelError::ProviderUnavailable("model offline".to_string()))
        } else {
            Ok(self.reply.clone())
        }
    }
}

/// One JSON reply that satisfies every built-in chain
pub const UNIVERSAL_REPLY: &str = r#"{"valid": true, "issues": [], "complexity": "low", "priority": 2, "estimate_minutes": 15, "message": "Nice work", "insight": "Steady", "suggestion": "Rest", "focus": "Deep work", "blocks": [], "subtasks": []}"#;

/// In-memory config with fast retries and a circuit that does not trip
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.backoff.base_ms = 1;
    config.backoff.cap_ms = 4;
    config.governor.failure_threshold = 1_000;
    config.governor.rate_per_sec = 10_000.0;
    config.governor.burst = 10_000;
    config.scheduler.poll_interval_ms = 10;
    config
}

pub fn registry_with(model: Arc<ScriptedModel>) -> (Arc<dyn PersistentStore>, ServiceRegistry) {
    let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
    let registry = ServiceRegistry::new(test_config())
        .with_store(Arc::clone(&store))
        .with_model(model);
    (store, registry)
}
