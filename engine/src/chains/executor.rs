//! Chain executor
//!
//! Runs a chain end to end: cache lookup, context gathering, governed model
//! calls with retries, cache write. Degradable chains absorb failures into a
//! template result; non-degradable ones raise `ChainExecutionError`.
//!
//! The executor reads memory but never writes it.

use sdk::errors::{ChainExecutionError, GovernorError, GovernorErrorKind};
use sdk::model::{GenerationParams, LanguageModel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{definition, fallback, parse_output, render, system_prompt, ChainName};
use crate::backoff::BackoffPolicy;
use crate::cache::{cache_key, normalize, TieredCache};
use crate::config::Config;
use crate::governor::{CallGovernor, InvokeOptions, LLM_RESOURCE};
use crate::memory::{MemoryStore, RetentionClass};

/// Result of a chain run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutput {
    pub chain: ChainName,
    pub value: Value,
    /// True when `value` is the template fallback
    pub degraded: bool,
    /// True when `value` came from the cache
    pub cached: bool,
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Retries after the first attempt of each step
    pub max_retries: u32,
    pub cache_ttl: Duration,
    pub backoff: BackoffPolicy,
    pub non_degradable: HashSet<ChainName>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            cache_ttl: Duration::from_secs(1_800),
            backoff: BackoffPolicy::default(),
            non_degradable: HashSet::from([ChainName::TaskValidation]),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

impl ChainSettings {
    /// Settings from the `chains`, `backoff` and `llm` config sections
    pub fn from_config(config: &Config) -> Result<Self, sdk::errors::EngineError> {
        Ok(Self {
            max_retries: config.chains.max_retries,
            cache_ttl: Duration::from_secs(config.chains.cache_ttl_secs),
            backoff: config.backoff.policy(),
            non_degradable: config.non_degradable_chains()?.into_iter().collect(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        })
    }
}

/// Why a chain could not produce a model result
enum StepFailure {
    CircuitOpen,
    Exhausted { attempts: u32, last_error: String },
}

pub struct ChainExecutor {
    model: Arc<dyn LanguageModel>,
    governor: Arc<CallGovernor>,
    cache: Arc<TieredCache>,
    memory: Arc<MemoryStore>,
    settings: ChainSettings,
}

impl ChainExecutor {
    /// Create a new executor
    pub fn new(
        model: Arc<dyn LanguageModel>,
        governor: Arc<CallGovernor>,
        cache: Arc<TieredCache>,
        memory: Arc<MemoryStore>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            model,
            governor,
            cache,
            memory,
            settings,
        }
    }

    pub fn is_degradable(&self, chain: ChainName) -> bool {
        !self.settings.non_degradable.contains(&chain)
    }

    /// Run a chain given by name
    pub async fn run_named(
        &self,
        chain_name: &str,
        inputs: &Value,
        owner_id: &str,
        use_cache: bool,
    ) -> Result<ChainOutput, ChainExecutionError> {
        let chain: ChainName = chain_name.parse()?;
        self.run(chain, inputs, owner_id, use_cache).await
    }

    /// Run a chain
    ///
    /// # Errors
    ///
    /// - `InvalidInput` when required inputs are missing
    /// - `Exhausted` / `CircuitOpen` for non-degradable chains that could
    ///   not reach the model
    pub async fn run(
        &self,
        chain: ChainName,
        inputs: &Value,
        owner_id: &str,
        use_cache: bool,
    ) -> Result<ChainOutput, ChainExecutionError> {
        let def = definition(chain);
        let inputs = normalize(inputs);
        def.check_inputs(&inputs)?;

        let key = cache_key(chain.as_str(), &inputs, owner_id);
        if use_cache {
            if let Some(value) = self.cache.get(&key).await {
                debug!(chain = %chain, owner_id = %owner_id, "Chain served from cache");
                return Ok(ChainOutput {
                    chain,
                    value,
                    degraded: false,
                    cached: true,
                });
            }
        }

        let context = self.gather_context(owner_id).await;

        match self.run_steps(chain, &inputs, &context).await {
            Ok(value) => {
                if use_cache {
                    self.cache
                        .set(&key, value.clone(), Some(self.settings.cache_ttl))
                        .await;
                }
                info!(chain = %chain, owner_id = %owner_id, "Chain completed");
                Ok(ChainOutput {
                    chain,
                    value,
                    degraded: false,
                    cached: false,
                })
            }
            Err(failure) => self.degrade(chain, &inputs, owner_id, failure),
        }
    }

    fn degrade(
        &self,
        chain: ChainName,
        inputs: &Value,
        owner_id: &str,
        failure: StepFailure,
    ) -> Result<ChainOutput, ChainExecutionError> {
        let error = match failure {
            StepFailure::CircuitOpen => ChainExecutionError::CircuitOpen {
                chain: chain.to_string(),
            },
            StepFailure::Exhausted {
                attempts,
                last_error,
            } => ChainExecutionError::Exhausted {
                chain: chain.to_string(),
                attempts,
                last_error,
            },
        };

        if !self.is_degradable(chain) {
            warn!(chain = %chain, owner_id = %owner_id, error = %error, "Non-degradable chain failed");
            return Err(error);
        }

        warn!(chain = %chain, owner_id = %owner_id, error = %error, "Chain degraded to fallback");
        Ok(ChainOutput {
            chain,
            value: fallback(chain, inputs),
            degraded: true,
            cached: false,
        })
    }

    async fn gather_context(&self, owner_id: &str) -> Vec<String> {
        let limit = self.memory.context_records();
        match self
            .memory
            .recall_recent(owner_id, RetentionClass::Working, limit)
            .await
        {
            Ok(records) => records
                .into_iter()
                .map(|record| format!("- {}: {}", record.key, record.value))
                .collect(),
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Memory context unavailable");
                Vec::new()
            }
        }
    }

    async fn run_steps(
        &self,
        chain: ChainName,
        inputs: &Value,
        context: &[String],
    ) -> Result<Value, StepFailure> {
        let def = definition(chain);
        let mut outputs: HashMap<&'static str, String> = HashMap::new();
        let mut previous: Option<String> = None;

        for (index, step) in def.steps.iter().enumerate() {
            let last_step = index + 1 == def.steps.len();
            let prompt = render(step.template, inputs, context, &outputs, previous.as_deref());
            let params = GenerationParams {
                system: Some(system_prompt(def, last_step)),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
            };

            let text = self.call_with_retries(chain, step.name, &prompt, &params).await?;
            outputs.insert(step.name, text.clone());
            previous = Some(text);
        }

        Ok(parse_output(previous.as_deref().unwrap_or_default()))
    }

    async fn call_with_retries(
        &self,
        chain: ChainName,
        step: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, StepFailure> {
        let attempts = self.settings.max_retries + 1;
        let mut last_error: Option<GovernorError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.settings.backoff.delay(attempt - 1);
                debug!(chain = %chain, step = %step, attempt, delay_ms = delay.as_millis() as u64, "Retrying chain step");
                tokio::time::sleep(delay).await;
            }

            let model = Arc::clone(&self.model);
            let result = self
                .governor
                .invoke(LLM_RESOURCE, InvokeOptions::default(), || async move {
                    model.generate(prompt, params).await
                })
                .await;

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.kind() == GovernorErrorKind::CircuitOpen => {
                    return Err(StepFailure::CircuitOpen);
                }
                Err(e) => {
                    warn!(chain = %chain, step = %step, attempt = attempt + 1, error = %e, "Chain step failed");
                    last_error = Some(e);
                }
            }
        }

        Err(StepFailure::Exhausted {
            attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}
