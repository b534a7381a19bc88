//! Rhythm SDK
//!
//! Collaborator interfaces and the shared error taxonomy for the Rhythm
//! orchestration engine. Integrations implement these traits; the engine
//! consumes them.

/// Error types and handling
pub mod errors;

/// Language-model service interface
pub mod model;

/// Persistent key/value store interface
pub mod store;

/// Tool adapter interface
pub mod types;

// Re-export commonly used types
pub use errors::{
    ActionExecutionError, ChainExecutionError, EngineError, ErrorExt, GovernorError,
    GovernorErrorKind, ModelError, PlanValidationError, StoreError, ToolError,
};
pub use model::{GenerationParams, LanguageModel};
pub use store::PersistentStore;
pub use types::{ToolAdapter, ToolRequest};
