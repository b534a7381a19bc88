//! Orchestrator
//!
//! Named workflows composed from memory, the planner and the scheduler.
//! Every workflow follows the same sequence:
//!
//! 1. Read what it needs from memory
//! 2. Persist a plan
//! 3. Run the plan's first ready batch while the caller waits
//! 4. Hand the rest to the background scheduler
//! 5. Record the outcome in working memory
//!
//! Only a failure in the first batch fails the call; the rest of the plan
//! is then cancelled. Later failures show up on the plan status.
//!
//! The plan is held away from the scheduler until the first batch is done,
//! so a background cycle for the same owner cannot claim those actions.

pub mod workflows;

pub use workflows::{MoodEntry, TaskRequest};

use chrono::Utc;
use futures::future::join_all;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::memory::{MemoryStore, RetentionClass};
use crate::planner::{ActionPlanner, ActionSpec, ActionStatus, OverallStatus, PlanStatus};
use crate::scheduler::Scheduler;

/// Long-term memory key holding owner preferences
pub const PREFERENCES_KEY: &str = "preferences";

/// What a workflow call returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow: String,
    pub plan_id: String,
    /// Outputs of the first batch, by action key
    pub outputs: BTreeMap<String, Value>,
    /// Plan status after the first batch
    pub status: OverallStatus,
}

pub struct Orchestrator {
    planner: Arc<ActionPlanner>,
    scheduler: Arc<Scheduler>,
    memory: Arc<MemoryStore>,
}

impl Orchestrator {
    pub fn new(
        planner: Arc<ActionPlanner>,
        scheduler: Arc<Scheduler>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            planner,
            scheduler,
            memory,
        }
    }

    /// Create a task: analyze and validate now, the rest in the background
    pub async fn create_task_workflow(
        &self,
        owner_id: &str,
        request: TaskRequest,
    ) -> Result<WorkflowResult, EngineError> {
        if request.title.trim().is_empty() {
            return Err(EngineError::WorkflowFailed {
                workflow: workflows::CREATE_TASK.to_string(),
                reason: "task title is empty".to_string(),
            });
        }

        let preferences = self
            .memory
            .recall(owner_id, RetentionClass::LongTerm, PREFERENCES_KEY)
            .await?
            .map(|record| record.value);

        let specs = workflows::create_task_plan(&request, preferences.as_ref());
        self.run_workflow(workflows::CREATE_TASK, owner_id, specs).await
    }

    /// Plan the owner's day from recent working memory
    pub async fn daily_optimization_workflow(
        &self,
        owner_id: &str,
    ) -> Result<WorkflowResult, EngineError> {
        let recent: Vec<Value> = self
            .memory
            .recall_recent(owner_id, RetentionClass::Working, self.memory.context_records())
            .await?
            .into_iter()
            .map(|record| json!({ "key": record.key, "value": record.value }))
            .collect();

        let specs = workflows::daily_optimization_plan(Utc::now().date_naive(), recent);
        self.run_workflow(workflows::DAILY_OPTIMIZATION, owner_id, specs)
            .await
    }

    /// Record a mood check-in and reflect on it
    pub async fn mood_checkin_workflow(
        &self,
        owner_id: &str,
        entry: MoodEntry,
    ) -> Result<WorkflowResult, EngineError> {
        if !entry.is_valid() {
            return Err(EngineError::WorkflowFailed {
                workflow: workflows::MOOD_CHECKIN.to_string(),
                reason: format!(
                    "mood score {} is outside {}..={}",
                    entry.score,
                    MoodEntry::MIN_SCORE,
                    MoodEntry::MAX_SCORE
                ),
            });
        }

        let previous = self
            .memory
            .recall(owner_id, RetentionClass::Working, "mood:last")
            .await?
            .map(|record| {
                let mut value = record.value;
                if let Value::Object(map) = &mut value {
                    map.remove("upstream");
                }
                value
            });

        let specs = workflows::mood_checkin_plan(&entry, previous.as_ref());
        self.run_workflow(workflows::MOOD_CHECKIN, owner_id, specs)
            .await
    }

    /// Plan status for polling
    pub async fn get_plan(&self, plan_id: &str) -> Result<PlanStatus, EngineError> {
        self.planner.get_plan(plan_id).await
    }

    async fn run_workflow(
        &self,
        workflow: &str,
        owner_id: &str,
        specs: Vec<ActionSpec>,
    ) -> Result<WorkflowResult, EngineError> {
        if self.scheduler.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }

        let plan_id = self.planner.plan_held(owner_id, specs).await?;

        let batch: Vec<String> = self
            .planner
            .ready_in_plan(owner_id, &plan_id)
            .await?
            .into_iter()
            .map(|action| action.id)
            .collect();

        let token = CancellationToken::new();
        let results = join_all(
            batch
                .iter()
                .map(|id| self.planner.run_action(id, &token)),
        )
        .await;

        let mut outputs = BTreeMap::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(action) if action.status == ActionStatus::Completed => {
                    outputs.insert(action.key, action.output.unwrap_or(Value::Null));
                }
                Ok(action) => {
                    let reason = action
                        .last_error
                        .unwrap_or_else(|| format!("action ended {}", action.status));
                    failure.get_or_insert(format!("{}: {}", action.key, reason));
                }
                Err(e) => {
                    failure.get_or_insert(e.to_string());
                }
            }
        }

        if let Some(reason) = failure {
            error!(
                workflow = %workflow,
                owner_id = %owner_id,
                plan_id = %plan_id,
                reason = %reason,
                "Workflow failed in its first batch"
            );
            self.cancel_plan(&plan_id).await;
            if let Err(e) = self.planner.release(&plan_id).await {
                warn!(plan_id = %plan_id, error = %e, "Could not release plan");
            }
            self.record_outcome(workflow, owner_id, &plan_id, "failed").await;
            return Err(EngineError::WorkflowFailed {
                workflow: workflow.to_string(),
                reason,
            });
        }

        self.planner.release(&plan_id).await?;
        self.scheduler.enqueue(owner_id).await?;

        let status = self.planner.get_plan(&plan_id).await?.overall_status;
        self.record_outcome(workflow, owner_id, &plan_id, "started").await;

        info!(
            workflow = %workflow,
            owner_id = %owner_id,
            plan_id = %plan_id,
            first_batch = outputs.len(),
            "Workflow started"
        );

        Ok(WorkflowResult {
            workflow: workflow.to_string(),
            plan_id,
            outputs,
            status,
        })
    }

    async fn cancel_plan(&self, plan_id: &str) {
        let actions = match self.planner.get_plan(plan_id).await {
            Ok(status) => status.actions,
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Could not load plan to cancel");
                return;
            }
        };
        for action in actions.iter().filter(|a| !a.status.is_terminal()) {
            if let Err(e) = self.planner.cancel(&action.id).await {
                // already cancelled through a cascade, or finished meanwhile
                warn!(action_id = %action.id, error = %e, "Could not cancel action");
            }
        }
    }

    async fn record_outcome(&self, workflow: &str, owner_id: &str, plan_id: &str, outcome: &str) {
        let value = json!({
            "plan_id": plan_id,
            "outcome": outcome,
            "at": Utc::now(),
        });
        if let Err(e) = self
            .memory
            .remember(
                owner_id,
                RetentionClass::Working,
                &format!("workflow:{}", workflow),
                value,
                None,
            )
            .await
        {
            warn!(workflow = %workflow, owner_id = %owner_id, error = %e, "Failed to record workflow outcome");
        }
    }
}
