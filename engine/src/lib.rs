//! Rhythm Engine Library
//!
//! Workflow orchestration core: memory, cached chains, a dependency-aware
//! action planner and the resilience layer around language-model calls.
//! It is used by both the `rhythm` binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Persistent store backends
pub mod store;

/// Shared exponential backoff
pub mod backoff;

/// Two-tier cache for chain outputs
pub mod cache;

/// Owner-scoped memory with retention classes
pub mod memory;

/// Rate, concurrency and circuit control for external calls
pub mod governor;

/// LLM provider implementations
pub mod llm;

/// Fixed prompt chains and their executor
pub mod chains;

/// Tool registry behind the tool adapter interface
pub mod tools;

/// Dependency-aware action planning
pub mod planner;

/// Background execution of planned actions
pub mod scheduler;

/// Named workflows
pub mod orchestrator;

/// Lazily built process-local services
pub mod registry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
