//! Tool adapter interface and request types
//!
//! Task, calendar, mood, reward and music integrations are reached only
//! through [`ToolAdapter`]. The engine never talks to a concrete external API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ToolError;

/// A domain integration callable by name
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Invokes `tool_name` with JSON `args` on behalf of `owner_id`
    async fn call(&self, tool_name: &str, args: &Value, owner_id: &str)
        -> Result<Value, ToolError>;
}

/// A single tool invocation, as handed to tool handlers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRequest {
    pub tool: String,
    pub owner_id: String,
    pub args: Value,
}

impl ToolRequest {
    /// Create a new request
    pub fn new(tool: impl Into<String>, owner_id: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            owner_id: owner_id.into(),
            args,
        }
    }

    /// Get a required string argument
    pub fn arg_str(&self, key: &str) -> Result<&str, ToolError> {
        self.args
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| self.missing(key))
    }

    /// Get a required integer argument
    pub fn arg_i64(&self, key: &str) -> Result<i64, ToolError> {
        self.args
            .get(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| self.missing(key))
    }

    /// Get an optional string argument
    pub fn arg_str_opt(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }

    fn missing(&self, key: &str) -> ToolError {
        ToolError::InvalidArguments {
            tool: self.tool.clone(),
            reason: format!("missing argument '{}'", key),
        }
    }
}
