//! Error types and handling
//!
//! This module provides the error taxonomy shared by the orchestration engine
//! and its collaborators. Every error implements [`ErrorExt`], which supplies a
//! user-safe hint and tells callers whether retrying can help.
//!
//! # Error Categories
//!
//! - **Governor**: rate limiting, circuit breaking, upstream failures
//! - **Chain**: a non-degradable chain exhausted its retries
//! - **Plan validation**: cycles or invalid dependencies, rejected before mutation
//! - **Action execution**: a tool or chain failed while the planner ran an action
//! - **Store / Model / Tool**: failures reported by external collaborators

use thiserror::Error;

/// Extensions implemented by every engine error
pub trait ErrorExt {
    /// Returns a hint that is safe to show to end users
    ///
    /// Hints never contain owner ids, payloads or provider credentials.
    fn user_hint(&self) -> &str;

    /// Returns whether retrying the failed operation can succeed
    fn is_retryable(&self) -> bool;
}

/// Coarse classification of governor failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GovernorErrorKind {
    RateLimited,
    CircuitOpen,
    UpstreamFailure,
}

/// Failures raised by the call governor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GovernorError {
    #[error("Rate limit exceeded for {resource}")]
    RateLimited { resource: String },

    #[error("Too many in-flight calls to {resource} (limit {limit})")]
    Saturated { resource: String, limit: usize },

    #[error("Circuit open for {resource}, retry in {retry_after_ms} ms")]
    CircuitOpen {
        resource: String,
        retry_after_ms: u64,
    },

    #[error("Call to {resource} timed out after {timeout_ms} ms")]
    Timeout { resource: String, timeout_ms: u64 },

    #[error("Upstream failure on {resource}: {message}")]
    UpstreamFailure { resource: String, message: String },
}

impl GovernorError {
    /// Maps the error onto the three governor kinds.
    ///
    /// A saturated resource is reported as rate limited; a timeout is an
    /// upstream failure.
    pub fn kind(&self) -> GovernorErrorKind {
        match self {
            Self::RateLimited { .. } | Self::Saturated { .. } => GovernorErrorKind::RateLimited,
            Self::CircuitOpen { .. } => GovernorErrorKind::CircuitOpen,
            Self::Timeout { .. } | Self::UpstreamFailure { .. } => {
                GovernorErrorKind::UpstreamFailure
            }
        }
    }

    /// Name of the governed resource
    pub fn resource(&self) -> &str {
        match self {
            Self::RateLimited { resource }
            | Self::Saturated { resource, .. }
            | Self::CircuitOpen { resource, .. }
            | Self::Timeout { resource, .. }
            | Self::UpstreamFailure { resource, .. } => resource,
        }
    }
}

/// Raised by the chain executor when a non-degradable chain cannot produce a result
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainExecutionError {
    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Invalid input for chain {chain}: {reason}")]
    InvalidInput { chain: String, reason: String },

    #[error("Chain {chain} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        chain: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Chain {chain} unavailable: circuit open")]
    CircuitOpen { chain: String },
}

/// Plan rejected before any action was persisted
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("Plan contains no actions")]
    EmptyPlan,

    #[error("Duplicate action key: {0}")]
    DuplicateKey(String),

    #[error("Action '{action}' depends on unknown action '{dependency}'")]
    UnknownDependency { action: String, dependency: String },

    #[error("Action '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Dependency graph contains a cycle involving '{0}'")]
    CycleDetected(String),

    #[error("Action '{0}' must allow at least one attempt")]
    InvalidMaxAttempts(String),
}

/// Failure of a single planned action
#[derive(Debug, Error)]
pub enum ActionExecutionError {
    #[error("Action {action_id} chain failed: {source}")]
    Chain {
        action_id: String,
        #[source]
        source: ChainExecutionError,
    },

    #[error("Action {action_id} tool '{tool}' failed: {source}")]
    Tool {
        action_id: String,
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("Action {action_id} failed: {message}")]
    Internal { action_id: String, message: String },

    #[error("Action {action_id} was interrupted")]
    Interrupted { action_id: String },
}

/// Errors reported by a persistent store backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors reported by a language-model provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Errors reported by a tool adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool {tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Tool {0} unavailable")]
    Unavailable(String),
}

/// Main engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error(transparent)]
    Chain(#[from] ChainExecutionError),

    #[error("Plan validation failed: {0}")]
    PlanValidation(#[from] PlanValidationError),

    #[error(transparent)]
    ActionExecution(#[from] ActionExecutionError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Action {action_id} cannot move from {from} to {to}")]
    InvalidTransition {
        action_id: String,
        from: String,
        to: String,
    },

    #[error("Workflow {workflow} failed: {reason}")]
    WorkflowFailed { workflow: String, reason: String },

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for GovernorError {
    fn user_hint(&self) -> &str {
        match self {
            Self::RateLimited { .. } | Self::Saturated { .. } => {
                "The assistant is busy. Please try again in a moment"
            }
            Self::CircuitOpen { .. } => "The assistant is temporarily unavailable",
            Self::Timeout { .. } => "The assistant took too long to respond",
            Self::UpstreamFailure { .. } => "The assistant service returned an error",
        }
    }

    fn is_retryable(&self) -> bool {
        true
    }
}

impl ErrorExt for ChainExecutionError {
    fn user_hint(&self) -> &str {
        match self {
            Self::UnknownChain(_) => "Unknown processing routine requested",
            Self::InvalidInput { .. } => "The request is missing required information",
            Self::Exhausted { .. } | Self::CircuitOpen { .. } => {
                "This feature is temporarily unavailable"
            }
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::CircuitOpen { .. })
    }
}

impl ErrorExt for PlanValidationError {
    fn user_hint(&self) -> &str {
        "The requested steps could not be scheduled"
    }

    fn is_retryable(&self) -> bool {
        false
    }
}

impl ErrorExt for ActionExecutionError {
    fn user_hint(&self) -> &str {
        "A scheduled step failed"
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Chain { source, .. } => source.is_retryable(),
            Self::Tool { source, .. } => source.is_retryable(),
            Self::Internal { .. } | Self::Interrupted { .. } => true,
        }
    }
}

impl ErrorExt for StoreError {
    fn user_hint(&self) -> &str {
        "Storage operation failed. Try again later"
    }

    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

impl ErrorExt for ModelError {
    fn user_hint(&self) -> &str {
        match self {
            Self::AuthenticationFailed(_) => "Language model credentials are invalid",
            Self::InvalidRequest(_) | Self::ParseError(_) => {
                "The language model could not handle the request"
            }
            _ => "Language model unavailable. Check your network",
        }
    }

    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_)
        )
    }
}

impl ErrorExt for ToolError {
    fn user_hint(&self) -> &str {
        match self {
            Self::NotFound(_) => "The requested integration is not available",
            Self::InvalidArguments { .. } => "The integration rejected the request",
            Self::Failed { .. } | Self::Unavailable(_) => "Integration call failed",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Unavailable(_))
    }
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Store(e) => e.user_hint(),
            Self::Governor(e) => e.user_hint(),
            Self::Chain(e) => e.user_hint(),
            Self::PlanValidation(e) => e.user_hint(),
            Self::ActionExecution(e) => e.user_hint(),
            Self::Tool(e) => e.user_hint(),
            Self::Model(e) => e.user_hint(),
            Self::ActionNotFound(_) | Self::PlanNotFound(_) => "The requested plan does not exist",
            Self::InvalidTransition { .. } => "The step is no longer in a state that allows this",
            Self::WorkflowFailed { .. } => "The request could not be completed",
            Self::ShuttingDown => "Service is restarting. Please try again",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Governor(e) => e.is_retryable(),
            Self::Chain(e) => e.is_retryable(),
            Self::ActionExecution(e) => e.is_retryable(),
            Self::Tool(e) => e.is_retryable(),
            Self::Model(e) => e.is_retryable(),
            Self::WorkflowFailed { .. } | Self::ShuttingDown | Self::Io(_) => true,
            Self::Config(_)
            | Self::PlanValidation(_)
            | Self::ActionNotFound(_)
            | Self::PlanNotFound(_)
            | Self::InvalidTransition { .. } => false,
        }
    }
}
