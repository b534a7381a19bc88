//! Tool registry
//!
//! Named handlers behind the [`ToolAdapter`] interface. Task, calendar, mood
//! and reward integrations register themselves here; the planner only ever
//! calls through the adapter.

use async_trait::async_trait;
use sdk::errors::ToolError;
use sdk::types::{ToolAdapter, ToolRequest};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Tool names used by the built-in workflows
pub mod names {
    pub const TASKS_CREATE: &str = "tasks.create";
    pub const CALENDAR_SCHEDULE: &str = "calendar.schedule";
    pub const MOOD_RECORD: &str = "mood.record";
    pub const REWARDS_GRANT: &str = "rewards.grant";
}

/// A single integration
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, request: &ToolRequest) -> Result<Value, ToolError>;
}

/// Handler built from a synchronous closure
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(&ToolRequest) -> Result<Value, ToolError> + Send + Sync,
{
    async fn handle(&self, request: &ToolRequest) -> Result<Value, ToolError> {
        (self.0)(request)
    }
}

/// Acknowledges every call without side effects.
///
/// Stands in for integrations when the engine runs on its own.
pub struct AcknowledgeTool;

#[async_trait]
impl ToolHandler for AcknowledgeTool {
    async fn handle(&self, request: &ToolRequest) -> Result<Value, ToolError> {
        info!(tool = %request.tool, owner_id = %request.owner_id, "Tool call acknowledged locally");
        Ok(json!({
            "tool": request.tool,
            "accepted": true,
            "args": request.args,
        }))
    }
}

/// Registry of available tools, dispatched by name
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    fallback: Option<Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Create an empty registry with no tools enabled
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry that acknowledges every tool call
    pub fn local() -> Self {
        Self::empty().with_fallback(Arc::new(AcknowledgeTool))
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Handler for names without a registered tool
    pub fn with_fallback(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.handlers.contains_key(name) || self.fallback.is_some()
    }

    /// Registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolAdapter for ToolRegistry {
    async fn call(
        &self,
        tool_name: &str,
        args: &Value,
        owner_id: &str,
    ) -> Result<Value, ToolError> {
        let handler = self
            .handlers
            .get(tool_name)
            .or(self.fallback.as_ref())
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        debug!(tool = %tool_name, owner_id = %owner_id, "Dispatching tool");
        let request = ToolRequest::new(tool_name, owner_id, args.clone());
        handler.handle(&request).await
    }
}
