//! Planner data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sdk::errors::{ActionExecutionError, ErrorExt};
use serde_json::Value;
use std::fmt;

use crate::chains::ChainName;
use crate::memory::RetentionClass;

/// What executing an action does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Run a chain with the payload as inputs
    Chain {
        chain: ChainName,
        #[serde(default = "default_use_cache")]
        use_cache: bool,
    },
    /// Call a tool with the payload as arguments
    Tool { tool: String },
    /// Write the payload to the owner's memory
    Remember { class: RetentionClass, key: String },
}

fn default_use_cache() -> bool {
    true
}

impl ActionKind {
    pub fn chain(chain: ChainName) -> Self {
        ActionKind::Chain {
            chain,
            use_cache: true,
        }
    }

    pub fn tool(tool: impl Into<String>) -> Self {
        ActionKind::Tool { tool: tool.into() }
    }

    pub fn remember(class: RetentionClass, key: impl Into<String>) -> Self {
        ActionKind::Remember {
            class,
            key: key.into(),
        }
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        match self {
            ActionKind::Chain { chain, .. } => format!("chain:{}", chain),
            ActionKind::Tool { tool } => format!("tool:{}", tool),
            ActionKind::Remember { class, key } => format!("remember:{}:{}", class, key),
        }
    }
}

/// A requested action, before planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Unique within one `plan` request
    pub key: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub payload: Value,
    /// Keys of actions in the same request, or ids of the owner's existing actions
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    /// Falls back to the planner default when unset
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ActionSpec {
    /// Create a new spec with no dependencies
    pub fn new(key: impl Into<String>, kind: ActionKind, payload: Value) -> Self {
        Self {
            key: key.into(),
            kind,
            payload,
            depends_on: Vec::new(),
            priority: 0,
            max_attempts: None,
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Ready => "ready",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked through its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub id: String,
    pub plan_id: String,
    pub owner_id: String,
    pub key: String,
    pub kind: ActionKind,
    pub payload: Value,
    /// Ids of actions that must complete first
    pub depends_on: Vec<String>,
    pub priority: i32,
    pub status: ActionStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Position in the plan's topological order
    pub seq: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Kept away from background workers until this time, unless released
    /// earlier. Set while a caller runs the plan's first batch itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_until: Option<DateTime<Utc>>,
}

impl PlannedAction {
    /// Ready and not waiting out a retry delay
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Ready && self.retry_at.map_or(true, |at| at <= now)
    }

    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.held_until.is_some_and(|until| until > now)
    }

    pub fn attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Result of executing an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success { output: Value },
    Failure {
        error: String,
        /// False for errors another attempt cannot fix
        #[serde(default = "default_retryable")]
        retryable: bool,
    },
}

fn default_retryable() -> bool {
    true
}

impl ActionOutcome {
    pub fn success(output: Value) -> Self {
        ActionOutcome::Success { output }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ActionOutcome::Failure {
            error: error.into(),
            retryable: true,
        }
    }

    /// A failure that is retried only if `error` is transient
    pub fn from_error(error: &ActionExecutionError) -> Self {
        ActionOutcome::Failure {
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Persisted plan header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub plan_id: String,
    pub owner_id: String,
    /// Action ids in topological order
    pub action_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OverallStatus {
    /// Summarize a plan's actions
    ///
    /// Any failure fails the plan. A plan whose actions are all terminal
    /// without failure is completed when all completed and cancelled
    /// otherwise. Once any action has started the plan is running.
    pub fn from_actions(actions: &[PlannedAction]) -> Self {
        if actions.iter().any(|a| a.status == ActionStatus::Failed) {
            return OverallStatus::Failed;
        }
        if actions.iter().all(|a| a.status == ActionStatus::Completed) {
            return OverallStatus::Completed;
        }
        if actions.iter().all(|a| a.status.is_terminal()) {
            return OverallStatus::Cancelled;
        }
        let started = actions.iter().any(|a| {
            matches!(a.status, ActionStatus::Running | ActionStatus::Completed)
                || a.attempt_count > 0
        });
        if started {
            OverallStatus::Running
        } else {
            OverallStatus::Pending
        }
    }
}

/// Plan status as returned to pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatus {
    pub plan_id: String,
    pub owner_id: String,
    pub overall_status: OverallStatus,
    pub actions: Vec<PlannedAction>,
}

impl PlanStatus {
    pub fn action_by_key(&self, key: &str) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| a.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(status: ActionStatus, attempts: u32) -> PlannedAction {
        PlannedAction {
            id: "a".to_string(),
            plan_id: "p".to_string(),
            owner_id: "u1".to_string(),
            key: "a".to_string(),
            kind: ActionKind::tool("tasks.create"),
            payload: json!({}),
            depends_on: Vec::new(),
            priority: 0,
            status,
            attempt_count: attempts,
            max_attempts: 3,
            created_at: Utc::now(),
            seq: 0,
            retry_at: None,
            started_at: None,
            completed_at: None,
            output: None,
            last_error: None,
            held_until: None,
        }
    }

    #[test]
    fn test_overall_status() {
        use ActionStatus::*;
        let overall = |statuses: &[(ActionStatus, u32)]| {
            let actions: Vec<_> = statuses.iter().map(|(s, n)| action(*s, *n)).collect();
            OverallStatus::from_actions(&actions)
        };

        assert_eq!(overall(&[(Pending, 0), (Ready, 0)]), OverallStatus::Pending);
        assert_eq!(overall(&[(Completed, 1), (Pending, 0)]), OverallStatus::Running);
        assert_eq!(overall(&[(Ready, 1)]), OverallStatus::Running);
        assert_eq!(overall(&[(Completed, 1), (Completed, 1)]), OverallStatus::Completed);
        assert_eq!(overall(&[(Completed, 1), (Failed, 3)]), OverallStatus::Failed);
        assert_eq!(overall(&[(Completed, 1), (Cancelled, 0)]), OverallStatus::Cancelled);
    }

    #[test]
    fn test_kind_serialization_is_tagged() {
        let kind = ActionKind::chain(ChainName::TaskAnalysis);
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json, json!({"type": "chain", "chain": "task_analysis", "use_cache": true}));

        let parsed: ActionKind =
            serde_json::from_value(json!({"type": "chain", "chain": "mood_insight"})).unwrap();
        assert_eq!(parsed, ActionKind::chain(ChainName::MoodInsight));
    }

    #[test]
    fn test_is_due_respects_retry_at() {
        let now = Utc::now();
        let mut a = action(ActionStatus::Ready, 1);
        assert!(a.is_due(now));
        a.retry_at = Some(now + chrono::Duration::seconds(5));
        assert!(!a.is_due(now));
        assert!(a.is_due(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_outcome_from_error_keeps_retry_class() {
        use sdk::errors::ToolError;

        let bad_args = ActionExecutionError::Tool {
            action_id: "a".to_string(),
            tool: "tasks.create".to_string(),
            source: ToolError::InvalidArguments {
                tool: "tasks.create".to_string(),
                reason: "title missing".to_string(),
            },
        };
        assert!(matches!(
            ActionOutcome::from_error(&bad_args),
            ActionOutcome::Failure { retryable: false, .. }
        ));

        let interrupted = ActionExecutionError::Interrupted {
            action_id: "a".to_string(),
        };
        assert!(matches!(
            ActionOutcome::from_error(&interrupted),
            ActionOutcome::Failure { retryable: true, .. }
        ));

        // outcomes recorded before the flag existed stay retryable
        let old: ActionOutcome =
            serde_json::from_value(json!({"result": "failure", "error": "boom"})).unwrap();
        assert_eq!(old, ActionOutcome::failure("boom"));
    }

    #[test]
    fn test_spec_builder() {
        let spec = ActionSpec::new("b", ActionKind::tool("x"), json!({}))
            .after(["a"])
            .with_priority(2)
            .with_max_attempts(5);
        assert_eq!(spec.depends_on, vec!["a"]);
        assert_eq!(spec.priority, 2);
        assert_eq!(spec.max_attempts, Some(5));
    }
}
