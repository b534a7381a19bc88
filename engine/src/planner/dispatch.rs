//! Action dispatch
//!
//! Executes one action according to its kind. The planner owns the state
//! machine; this module only performs the work.

use async_trait::async_trait;
use sdk::errors::ActionExecutionError;
use sdk::types::ToolAdapter;
use serde_json::{json, Value};
use std::sync::Arc;

use super::types::{ActionKind, PlannedAction};
use crate::chains::ChainExecutor;
use crate::memory::MemoryStore;

/// Performs the work of a planned action
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Execute `action` with `payload` (its stored payload plus upstream outputs)
    async fn execute(
        &self,
        action: &PlannedAction,
        payload: Value,
    ) -> Result<Value, ActionExecutionError>;
}

/// Dispatches to the chain executor, a tool adapter or the memory store
pub struct Dispatcher {
    chains: Arc<ChainExecutor>,
    tools: Arc<dyn ToolAdapter>,
    memory: Arc<MemoryStore>,
}

impl Dispatcher {
    pub fn new(
        chains: Arc<ChainExecutor>,
        tools: Arc<dyn ToolAdapter>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            chains,
            tools,
            memory,
        }
    }
}

#[async_trait]
impl ActionRunner for Dispatcher {
    async fn execute(
        &self,
        action: &PlannedAction,
        payload: Value,
    ) -> Result<Value, ActionExecutionError> {
        match &action.kind {
            ActionKind::Chain { chain, use_cache } => {
                let output = self
                    .chains
                    .run(*chain, &payload, &action.owner_id, *use_cache)
                    .await
                    .map_err(|source| ActionExecutionError::Chain {
                        action_id: action.id.clone(),
                        source,
                    })?;
                serde_json::to_value(&output).map_err(|e| ActionExecutionError::Internal {
                    action_id: action.id.clone(),
                    message: e.to_string(),
                })
            }
            ActionKind::Tool { tool } => self
                .tools
                .call(tool, &payload, &action.owner_id)
                .await
                .map_err(|source| ActionExecutionError::Tool {
                    action_id: action.id.clone(),
                    tool: tool.clone(),
                    source,
                }),
            ActionKind::Remember { class, key } => {
                self.memory
                    .remember(&action.owner_id, *class, key, payload, None)
                    .await
                    .map_err(|e| ActionExecutionError::Internal {
                        action_id: action.id.clone(),
                        message: e.to_string(),
                    })?;
                Ok(json!({ "remembered": key, "class": class }))
            }
        }
    }
}
