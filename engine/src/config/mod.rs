//! Configuration management
//!
//! This module handles loading, validation, and management of the Rhythm
//! configuration. Configuration is stored in TOML format at
//! ~/.rhythm/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **store**: Persistent store backend (sqlite or in-memory)
//! - **llm**: Language-model provider settings
//! - **cache**: Local cache tier size and default ttl
//! - **memory**: Per-retention-class ttls and sweep interval
//! - **governor**: Rate, concurrency and circuit breaker limits
//! - **backoff**: Retry delay policy shared by chains and the planner
//! - **chains**: Chain retry and degradation settings
//! - **planner**: Attempt limits, retention, cancellation behaviour
//! - **scheduler**: Background worker polling and shutdown
//!
//! Every section except `core` may be omitted and falls back to defaults.
//!
//! # Examples
//!
//! ```no_run
//! use rhythm_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Provider: {}", config.llm.provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::chains::ChainName;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Persistent store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Language-model provider configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Tiered cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Memory store configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Call governor configuration
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Retry backoff configuration
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Chain executor configuration
    #[serde(default)]
    pub chains: ChainsConfig,

    /// Action planner configuration
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Background scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Persistent store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// Backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database path. Defaults to `<data_dir>/rhythm.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
}

/// Language-model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Provider to use (ollama, openai)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Sampling temperature passed with every chain step
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Token limit for every chain step
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for the chat completions API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key.
    /// The key itself is never written to the config file.
    #[serde(default = "default_openai_api_key_env")]
    pub api_key_env: String,
}

/// Tiered cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries in the in-process tier
    #[serde(default = "default_local_capacity")]
    pub local_capacity: u64,

    /// Ttl applied when a caller does not pass one (seconds)
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
}

/// Memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Default ttl for short-term records (seconds)
    #[serde(default = "default_short_term_ttl")]
    pub short_term_ttl_secs: u64,

    /// Default ttl for working records (seconds)
    #[serde(default = "default_working_ttl")]
    pub working_ttl_secs: u64,

    /// Default ttl for long-term records (seconds). Unset means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_term_ttl_secs: Option<u64>,

    /// Default ttl for semantic records (seconds). Unset means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_ttl_secs: Option<u64>,

    /// Interval between expiry sweeps (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Number of recent working records fed to chains as context
    #[serde(default = "default_context_records")]
    pub context_records: usize,
}

/// Call governor configuration, applied to every governed resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Sustained call rate (tokens per second)
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,

    /// Token bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Maximum in-flight calls per resource
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a probe (seconds)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Timeout applied to every governed call (seconds)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Longest a caller waits for a rate token or a concurrency slot (ms)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

/// Retry delay policy shared by chain retries and planner retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry (ms)
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,

    /// Upper bound on any retry delay (ms)
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

/// Chain executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainsConfig {
    /// Retries after the first attempt for transient upstream failures
    #[serde(default = "default_chain_retries")]
    pub max_retries: u32,

    /// Ttl of cached chain results (seconds)
    #[serde(default = "default_chain_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Chains that raise instead of returning a fallback
    #[serde(default = "default_non_degradable")]
    pub non_degradable: Vec<String>,
}

/// Action planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Attempts allowed when an action spec does not set its own
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// How long terminal actions are kept for polling (seconds)
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Cancel dependents transitively when an action is cancelled
    #[serde(default = "default_true")]
    pub cascade_cancel: bool,

    /// How long a workflow's first batch is kept from background workers
    /// while the caller runs it (seconds)
    #[serde(default = "default_first_batch_hold")]
    pub first_batch_hold_secs: u64,
}

/// Background scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between cycles (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Actions executed concurrently per owner in one cycle
    #[serde(default = "default_per_owner_concurrency")]
    pub per_owner_concurrency: usize,

    /// Actions executed concurrently across all owners
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Time in-flight actions get to finish after a stop signal (seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Interval between retention purges (seconds)
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Interval between re-queues of owners with open work (seconds)
    #[serde(default = "default_recover_interval")]
    pub recover_interval_secs: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.rhythm")
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_local_capacity() -> u64 {
    1_000
}

fn default_cache_ttl() -> u64 {
    1_800
}

fn default_short_term_ttl() -> u64 {
    3_600
}

fn default_working_ttl() -> u64 {
    86_400
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_context_records() -> usize {
    5
}

fn default_rate_per_sec() -> f64 {
    2.0
}

fn default_burst() -> u32 {
    5
}

fn default_max_concurrent() -> usize {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    300
}

fn default_call_timeout() -> u64 {
    30
}

fn default_max_wait_ms() -> u64 {
    2_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_chain_retries() -> u32 {
    2
}

fn default_chain_cache_ttl() -> u64 {
    1_800
}

fn default_non_degradable() -> Vec<String> {
    vec![ChainName::TaskValidation.as_str().to_string()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retention() -> u64 {
    7 * 24 * 3_600
}

fn default_first_batch_hold() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_per_owner_concurrency() -> usize {
    2
}

fn default_max_in_flight() -> usize {
    16
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_recover_interval() -> u64 {
    30
}

fn default_purge_interval() -> u64 {
    3_600
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            ollama: OllamaConfig::default(),
            openai: OpenAIConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_api_key_env(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: default_local_capacity(),
            default_ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_ttl_secs: default_short_term_ttl(),
            working_ttl_secs: default_working_ttl(),
            long_term_ttl_secs: None,
            semantic_ttl_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            context_records: default_context_records(),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
            max_concurrent: default_max_concurrent(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            call_timeout_secs: default_call_timeout(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl Default for ChainsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_chain_retries(),
            cache_ttl_secs: default_chain_cache_ttl(),
            non_degradable: default_non_degradable(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            retention_secs: default_retention(),
            cascade_cancel: true,
            first_batch_hold_secs: default_first_batch_hold(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            per_owner_concurrency: default_per_owner_concurrency(),
            max_in_flight: default_max_in_flight(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            purge_interval_secs: default_purge_interval(),
            recover_interval_secs: default_recover_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            store: StoreConfig::default(),
            llm: LLMConfig::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
            governor: GovernorConfig::default(),
            backoff: BackoffConfig::default(),
            chains: ChainsConfig::default(),
            planner: PlannerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl BackoffConfig {
    /// The retry policy described by this section
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.cap_ms),
        )
    }
}

impl Config {
    /// Load configuration from the default location (~/.rhythm/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.rhythm/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".rhythm").join("config.toml"))
    }

    /// Path of the SQLite database backing the persistent store
    pub fn sqlite_path(&self) -> PathBuf {
        self.store
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.core.data_dir.join("rhythm.db"))
    }

    /// Chains configured as non-degradable, parsed
    pub fn non_degradable_chains(&self) -> Result<Vec<ChainName>, EngineError> {
        self.chains
            .non_degradable
            .iter()
            .map(|name| {
                ChainName::from_str(name)
                    .map_err(|_| EngineError::Config(format!("Unknown chain '{}'", name)))
            })
            .collect()
    }

    /// Validate values without touching the file system
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai"];
        if !valid_providers.contains(&self.llm.provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid provider '{}'. Must be one of: {}",
                self.llm.provider,
                valid_providers.join(", ")
            )));
        }

        // Unknown chain names fail here rather than at call time
        self.non_degradable_chains()?;

        if self.cache.local_capacity == 0 {
            return Err(EngineError::Config(
                "cache.local_capacity must be greater than 0".to_string(),
            ));
        }

        if !(self.governor.rate_per_sec > 0.0) {
            return Err(EngineError::Config(
                "governor.rate_per_sec must be greater than 0".to_string(),
            ));
        }
        if self.governor.burst == 0
            || self.governor.max_concurrent == 0
            || self.governor.failure_threshold == 0
        {
            return Err(EngineError::Config(
                "governor.burst, max_concurrent and failure_threshold must be greater than 0"
                    .to_string(),
            ));
        }
        if self.governor.call_timeout_secs == 0 {
            return Err(EngineError::Config(
                "governor.call_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.backoff.cap_ms < self.backoff.base_ms {
            return Err(EngineError::Config(
                "backoff.cap_ms must not be smaller than backoff.base_ms".to_string(),
            ));
        }

        if self.planner.default_max_attempts == 0 {
            return Err(EngineError::Config(
                "planner.default_max_attempts must be at least 1".to_string(),
            ));
        }

        if self.scheduler.per_owner_concurrency == 0 || self.scheduler.max_in_flight == 0 {
            return Err(EngineError::Config(
                "scheduler concurrency limits must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.recover_interval_secs == 0 {
            return Err(EngineError::Config(
                "scheduler.recover_interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate, expand `~` in paths and create the data directory
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        self.validate()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if let Some(path) = &self.store.sqlite_path {
            self.store.sqlite_path = Some(expand_path(path)?);
        }

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
