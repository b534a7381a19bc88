//! Action Planner
//!
//! Turns action specs into a persisted dependency graph per owner and walks
//! each action through its lifecycle:
//!
//! ```text
//! pending -> ready -> running -> completed
//!                         |
//!                         +-> failed        (attempts exhausted)
//!                         +-> ready         (retry after backoff)
//! pending | ready | running -> cancelled
//! ```
//!
//! An action becomes ready only when every dependency has completed. All
//! state lives in the persistent store, so several workers can share it:
//!
//! - `plan:{plan_id}`: [`PlanRecord`]
//! - `action:{owner}:{action_id}`: [`PlannedAction`]
//! - `action_index:{action_id}`: owner id, for lookups by id
//!
//! The store has no compare-and-set, so mutations are serialized within a
//! process only. Across processes the last writer wins.
//!
//! A plan created with [`ActionPlanner::plan_held`] is invisible to
//! [`ActionPlanner::ready_actions`] until [`ActionPlanner::release`] is
//! called or the hold expires. The caller runs the first batch itself via
//! [`ActionPlanner::ready_in_plan`].

mod dispatch;
mod graph;
pub mod types;

pub use dispatch::{ActionRunner, Dispatcher};
pub use types::{
    ActionKind, ActionOutcome, ActionSpec, ActionStatus, OverallStatus, PlanRecord, PlanStatus,
    PlannedAction,
};

use chrono::{DateTime, Utc};
use sdk::errors::{ActionExecutionError, EngineError};
use sdk::store::PersistentStore;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::store::{get_json, set_json};

const PLAN_PREFIX: &str = "plan:";
const ACTION_PREFIX: &str = "action:";
const INDEX_PREFIX: &str = "action_index:";

/// Planner tuning
#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub default_max_attempts: u32,
    pub retention: Duration,
    pub cascade_cancel: bool,
    pub backoff: BackoffPolicy,
    /// Lease on a held plan, so a crashed caller cannot strand it
    pub first_batch_hold: Duration,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            retention: Duration::from_secs(7 * 24 * 3_600),
            cascade_cancel: true,
            backoff: BackoffPolicy::default(),
            first_batch_hold: Duration::from_secs(300),
        }
    }
}

impl PlannerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_max_attempts: config.planner.default_max_attempts,
            retention: Duration::from_secs(config.planner.retention_secs),
            cascade_cancel: config.planner.cascade_cancel,
            backoff: config.backoff.policy(),
            first_batch_hold: Duration::from_secs(config.planner.first_batch_hold_secs),
        }
    }
}

fn plan_key(plan_id: &str) -> String {
    format!("{}{}", PLAN_PREFIX, plan_id)
}

fn action_key(owner_id: &str, action_id: &str) -> String {
    format!("{}{}:{}", ACTION_PREFIX, owner_id, action_id)
}

fn index_key(action_id: &str) -> String {
    format!("{}{}", INDEX_PREFIX, action_id)
}

fn transition_error(action: &PlannedAction, to: &str) -> EngineError {
    EngineError::InvalidTransition {
        action_id: action.id.clone(),
        from: action.status.to_string(),
        to: to.to_string(),
    }
}

/// A pending action that can never become ready
fn is_blocked_forever(action: &PlannedAction, status_by_id: &HashMap<String, ActionStatus>) -> bool {
    action.status == ActionStatus::Pending
        && action.depends_on.iter().any(|dep| {
            matches!(
                status_by_id.get(dep),
                None | Some(ActionStatus::Failed) | Some(ActionStatus::Cancelled)
            )
        })
}

/// Dependency-aware action planner
pub struct ActionPlanner {
    store: Arc<dyn PersistentStore>,
    runner: Arc<dyn ActionRunner>,
    settings: PlannerSettings,
    mutation: Mutex<()>,
}

impl ActionPlanner {
    /// Create a new planner
    pub fn new(
        store: Arc<dyn PersistentStore>,
        runner: Arc<dyn ActionRunner>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            store,
            runner,
            settings,
            mutation: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    async fn load_owner_actions(&self, owner_id: &str) -> Result<Vec<PlannedAction>, EngineError> {
        let prefix = format!("{}{}:", ACTION_PREFIX, owner_id);
        let mut actions = Vec::new();
        for key in self.store.keys(&prefix).await? {
            if let Some(action) = get_json::<PlannedAction>(self.store.as_ref(), &key).await? {
                // an owner id containing ':' can share a prefix with another owner
                if action.owner_id == owner_id {
                    actions.push(action);
                }
            }
        }
        Ok(actions)
    }

    async fn load_action(&self, action_id: &str) -> Result<PlannedAction, EngineError> {
        let owner_id: String = get_json(self.store.as_ref(), &index_key(action_id))
            .await?
            .ok_or_else(|| EngineError::ActionNotFound(action_id.to_string()))?;
        get_json(self.store.as_ref(), &action_key(&owner_id, action_id))
            .await?
            .ok_or_else(|| EngineError::ActionNotFound(action_id.to_string()))
    }

    async fn save_action(&self, action: &PlannedAction) -> Result<(), EngineError> {
        set_json(
            self.store.as_ref(),
            &action_key(&action.owner_id, &action.id),
            action,
            None,
        )
        .await?;
        Ok(())
    }

    /// Validate and persist a plan. Returns the plan id.
    ///
    /// Dependencies may name keys in `specs` or ids of the owner's existing
    /// actions. Nothing is written unless the whole request is valid.
    pub async fn plan(&self, owner_id: &str, specs: Vec<ActionSpec>) -> Result<String, EngineError> {
        self.create_plan(owner_id, specs, None).await
    }

    /// Like [`plan`](Self::plan), but the actions stay hidden from
    /// [`ready_actions`](Self::ready_actions) until [`release`](Self::release)
    /// or until the configured hold elapses
    pub async fn plan_held(
        &self,
        owner_id: &str,
        specs: Vec<ActionSpec>,
    ) -> Result<String, EngineError> {
        let hold = chrono::Duration::from_std(self.settings.first_batch_hold)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.create_plan(owner_id, specs, Some(Utc::now() + hold))
            .await
    }

    async fn create_plan(
        &self,
        owner_id: &str,
        specs: Vec<ActionSpec>,
        held_until: Option<DateTime<Utc>>,
    ) -> Result<String, EngineError> {
        let _guard = self.mutation.lock().await;

        let existing: HashMap<String, Vec<String>> = self
            .load_owner_actions(owner_id)
            .await?
            .into_iter()
            .map(|action| (action.id, action.depends_on))
            .collect();
        let new_ids: Vec<String> = specs.iter().map(|_| Uuid::new_v4().to_string()).collect();

        let validated = graph::validate(&specs, &new_ids, &existing).map_err(|e| {
            warn!(owner_id = %owner_id, error = %e, "Plan rejected");
            e
        })?;

        let plan_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        // record first: a partial write must stay visible to get_plan and purge
        let record = PlanRecord {
            plan_id: plan_id.clone(),
            owner_id: owner_id.to_string(),
            action_ids: validated.order.iter().map(|&i| new_ids[i].clone()).collect(),
            created_at,
        };
        set_json(self.store.as_ref(), &plan_key(&plan_id), &record, None).await?;

        for (seq, &index) in validated.order.iter().enumerate() {
            let spec = &specs[index];
            let action = PlannedAction {
                id: new_ids[index].clone(),
                plan_id: plan_id.clone(),
                owner_id: owner_id.to_string(),
                key: spec.key.clone(),
                kind: spec.kind.clone(),
                payload: spec.payload.clone(),
                depends_on: validated.depends_on[index].clone(),
                priority: spec.priority,
                status: ActionStatus::Pending,
                attempt_count: 0,
                max_attempts: spec
                    .max_attempts
                    .unwrap_or(self.settings.default_max_attempts),
                created_at,
                seq: seq as u32,
                retry_at: None,
                started_at: None,
                completed_at: None,
                output: None,
                last_error: None,
                held_until,
            };
            self.save_action(&action).await?;
            set_json(self.store.as_ref(), &index_key(&action.id), owner_id, None).await?;
        }

        info!(
            owner_id = %owner_id,
            plan_id = %plan_id,
            actions = specs.len(),
            held = held_until.is_some(),
            "Plan created"
        );
        Ok(plan_id)
    }

    /// Promote pending actions whose dependencies all completed, then return
    /// every due ready action of the owner that is not held
    ///
    /// Ordered by priority (highest first), then creation time, then
    /// position in the plan.
    pub async fn ready_actions(&self, owner_id: &str) -> Result<Vec<PlannedAction>, EngineError> {
        self.collect_ready(owner_id, None).await
    }

    /// Like [`ready_actions`](Self::ready_actions), restricted to one plan
    /// and including its held actions
    pub async fn ready_in_plan(
        &self,
        owner_id: &str,
        plan_id: &str,
    ) -> Result<Vec<PlannedAction>, EngineError> {
        self.collect_ready(owner_id, Some(plan_id)).await
    }

    async fn collect_ready(
        &self,
        owner_id: &str,
        plan_id: Option<&str>,
    ) -> Result<Vec<PlannedAction>, EngineError> {
        let _guard = self.mutation.lock().await;
        let now = Utc::now();

        let mut actions = self.load_owner_actions(owner_id).await?;
        let mut status_by_id: HashMap<String, ActionStatus> =
            actions.iter().map(|a| (a.id.clone(), a.status)).collect();

        // cascade cancellation can ripple down chains of dependents
        let mut changed = true;
        while changed {
            changed = false;
            for action in actions.iter_mut().filter(|a| a.status == ActionStatus::Pending) {
                let all_completed = action
                    .depends_on
                    .iter()
                    .all(|dep| status_by_id.get(dep) == Some(&ActionStatus::Completed));
                let dep_cancelled = action
                    .depends_on
                    .iter()
                    .any(|dep| status_by_id.get(dep) == Some(&ActionStatus::Cancelled));

                if all_completed {
                    action.status = ActionStatus::Ready;
                    debug!(action_id = %action.id, key = %action.key, "Action ready");
                } else if self.settings.cascade_cancel && dep_cancelled {
                    action.status = ActionStatus::Cancelled;
                    action.completed_at = Some(now);
                    action.last_error = Some("dependency cancelled".to_string());
                    info!(action_id = %action.id, key = %action.key, "Action cancelled with its dependency");
                    changed = true;
                } else {
                    continue;
                }
                status_by_id.insert(action.id.clone(), action.status);
                self.save_action(action).await?;
            }
        }

        let mut ready: Vec<PlannedAction> = actions
            .into_iter()
            .filter(|a| a.is_due(now))
            .filter(|a| match plan_id {
                Some(plan_id) => a.plan_id == plan_id,
                None => !a.is_held(now),
            })
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(ready)
    }

    /// Hand a held plan over to background workers
    pub async fn release(&self, plan_id: &str) -> Result<(), EngineError> {
        let _guard = self.mutation.lock().await;
        let record: PlanRecord = get_json(self.store.as_ref(), &plan_key(plan_id))
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;

        for id in &record.action_ids {
            let key = action_key(&record.owner_id, id);
            let Some(mut action) = get_json::<PlannedAction>(self.store.as_ref(), &key).await?
            else {
                continue;
            };
            if action.held_until.take().is_some() {
                self.save_action(&action).await?;
            }
        }

        debug!(plan_id = %plan_id, "Plan released");
        Ok(())
    }

    /// Claim a ready action: ready -> running, counting the attempt
    pub async fn start(&self, action_id: &str) -> Result<PlannedAction, EngineError> {
        let _guard = self.mutation.lock().await;
        let mut action = self.load_action(action_id).await?;

        if action.status != ActionStatus::Ready {
            return Err(transition_error(&action, "running"));
        }

        action.status = ActionStatus::Running;
        action.attempt_count += 1;
        action.started_at = Some(Utc::now());
        action.retry_at = None;
        self.save_action(&action).await?;

        debug!(action_id = %action.id, attempt = action.attempt_count, "Action started");
        Ok(action)
    }

    /// Record the outcome of an attempt
    ///
    /// A ready action is treated as started by this call. Results for
    /// cancelled actions are discarded. A retryable failure with attempts
    /// left puts the action back to ready after a backoff delay; otherwise
    /// it fails. The first retry waits `backoff.delay(0)`.
    pub async fn mark_result(
        &self,
        action_id: &str,
        outcome: ActionOutcome,
    ) -> Result<PlannedAction, EngineError> {
        let _guard = self.mutation.lock().await;
        let mut action = self.load_action(action_id).await?;
        let now = Utc::now();

        match action.status {
            ActionStatus::Cancelled => {
                debug!(action_id = %action.id, "Discarding result of cancelled action");
                return Ok(action);
            }
            ActionStatus::Ready => {
                action.attempt_count += 1;
                action.started_at = Some(now);
            }
            ActionStatus::Running => {}
            _ => return Err(transition_error(&action, "completed")),
        }

        match outcome {
            ActionOutcome::Success { output } => {
                action.status = ActionStatus::Completed;
                action.output = Some(output);
                action.completed_at = Some(now);
                action.retry_at = None;
                info!(action_id = %action.id, key = %action.key, plan_id = %action.plan_id, "Action completed");
            }
            ActionOutcome::Failure {
                error: message,
                retryable,
            } => {
                action.last_error = Some(message.clone());
                if retryable && action.attempts_left() {
                    let delay = self
                        .settings
                        .backoff
                        .delay(action.attempt_count.saturating_sub(1));
                    action.status = ActionStatus::Ready;
                    action.retry_at =
                        Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
                    warn!(
                        action_id = %action.id,
                        attempt = action.attempt_count,
                        max_attempts = action.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "Action failed, will retry"
                    );
                } else {
                    action.status = ActionStatus::Failed;
                    action.completed_at = Some(now);
                    error!(
                        action_id = %action.id,
                        key = %action.key,
                        plan_id = %action.plan_id,
                        attempts = action.attempt_count,
                        retryable,
                        error = %message,
                        "Action failed permanently"
                    );
                }
            }
        }

        self.save_action(&action).await?;
        Ok(action)
    }

    /// Cancel an action. Returns the ids cancelled by this call.
    ///
    /// Pending, ready and running actions can be cancelled; a running
    /// action keeps running and its result is discarded. With cascading
    /// enabled every unfinished transitive dependent is cancelled too.
    pub async fn cancel(&self, action_id: &str) -> Result<Vec<String>, EngineError> {
        let _guard = self.mutation.lock().await;
        let action = self.load_action(action_id).await?;

        match action.status {
            ActionStatus::Cancelled => return Ok(Vec::new()),
            ActionStatus::Completed | ActionStatus::Failed => {
                return Err(transition_error(&action, "cancelled"));
            }
            _ => {}
        }

        let now = Utc::now();
        let owner_id = action.owner_id.clone();
        let mut by_id: HashMap<String, PlannedAction> = if self.settings.cascade_cancel {
            self.load_owner_actions(&owner_id)
                .await?
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect()
        } else {
            HashMap::new()
        };
        by_id.insert(action.id.clone(), action);

        let mut cancelled = Vec::new();
        let mut queue = VecDeque::from([action_id.to_string()]);
        let mut visited = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(target) = by_id.get_mut(&id) else {
                continue;
            };
            if target.status.is_terminal() {
                continue;
            }

            target.status = ActionStatus::Cancelled;
            target.completed_at = Some(now);
            if id != action_id {
                target.last_error = Some(format!("dependency {} cancelled", action_id));
            }
            self.save_action(target).await?;
            cancelled.push(id.clone());

            if self.settings.cascade_cancel {
                for dependent in by_id.values().filter(|a| a.depends_on.contains(&id)) {
                    queue.push_back(dependent.id.clone());
                }
            }
        }

        info!(owner_id = %owner_id, action_id = %action_id, cancelled = cancelled.len(), "Action cancelled");
        Ok(cancelled)
    }

    /// Fetch one action
    pub async fn get_action(&self, action_id: &str) -> Result<PlannedAction, EngineError> {
        self.load_action(action_id).await
    }

    /// Fetch a plan with its actions and overall status
    pub async fn get_plan(&self, plan_id: &str) -> Result<PlanStatus, EngineError> {
        let record: PlanRecord = get_json(self.store.as_ref(), &plan_key(plan_id))
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;

        let mut actions = Vec::with_capacity(record.action_ids.len());
        for id in &record.action_ids {
            if let Some(action) =
                get_json::<PlannedAction>(self.store.as_ref(), &action_key(&record.owner_id, id))
                    .await?
            {
                actions.push(action);
            }
        }

        Ok(PlanStatus {
            plan_id: record.plan_id,
            owner_id: record.owner_id,
            overall_status: OverallStatus::from_actions(&actions),
            actions,
        })
    }

    /// The action's payload with dependency outputs under `upstream.{key}`
    async fn prepare_payload(&self, action: &PlannedAction) -> Result<Value, EngineError> {
        let mut payload = match &action.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };

        if !action.depends_on.is_empty() {
            let mut upstream = Map::new();
            for dep_id in &action.depends_on {
                let dep: Option<PlannedAction> =
                    get_json(self.store.as_ref(), &action_key(&action.owner_id, dep_id)).await?;
                if let Some(dep) = dep {
                    upstream.insert(dep.key, dep.output.unwrap_or(Value::Null));
                }
            }
            payload.insert("upstream".to_string(), Value::Object(upstream));
        }

        Ok(Value::Object(payload))
    }

    /// Execute a claimed action without touching its state
    pub async fn execute(&self, action: &PlannedAction) -> Result<Value, ActionExecutionError> {
        let payload =
            self.prepare_payload(action)
                .await
                .map_err(|e| ActionExecutionError::Internal {
                    action_id: action.id.clone(),
                    message: e.to_string(),
                })?;
        self.runner.execute(action, payload).await
    }

    /// Start, execute and record one action
    ///
    /// If `token` is cancelled first, the attempt is recorded as a failure.
    pub async fn run_action(
        &self,
        action_id: &str,
        token: &CancellationToken,
    ) -> Result<PlannedAction, EngineError> {
        let action = self.start(action_id).await?;

        let outcome = tokio::select! {
            result = self.execute(&action) => match result {
                Ok(output) => ActionOutcome::success(output),
                Err(e) => ActionOutcome::from_error(&e),
            },
            _ = token.cancelled() => {
                warn!(action_id = %action_id, "Action interrupted");
                ActionOutcome::from_error(&ActionExecutionError::Interrupted {
                    action_id: action_id.to_string(),
                })
            }
        };

        self.mark_result(action_id, outcome).await
    }

    /// Whether the owner has actions that are or can still become runnable
    pub async fn has_open_work(&self, owner_id: &str) -> Result<bool, EngineError> {
        let actions = self.load_owner_actions(owner_id).await?;
        let status_by_id: HashMap<String, ActionStatus> =
            actions.iter().map(|a| (a.id.clone(), a.status)).collect();
        Ok(actions
            .iter()
            .any(|a| !a.status.is_terminal() && !is_blocked_forever(a, &status_by_id)))
    }

    /// Owners that have open work, sorted
    pub async fn owners_with_work(&self) -> Result<Vec<String>, EngineError> {
        let mut owners = BTreeSet::new();
        for key in self.store.keys(ACTION_PREFIX).await? {
            let Some((owner_id, _)) = key
                .strip_prefix(ACTION_PREFIX)
                .and_then(|rest| rest.rsplit_once(':'))
            else {
                continue;
            };
            if !owners.contains(owner_id) {
                owners.insert(owner_id.to_string());
            }
        }

        let mut with_work = Vec::new();
        for owner_id in owners {
            if self.has_open_work(&owner_id).await? {
                with_work.push(owner_id);
            }
        }
        Ok(with_work)
    }

    /// Delete plans whose actions all finished more than `retention` ago.
    /// Returns the number of actions removed.
    ///
    /// Plans still referenced by an unfinished action of the owner are kept.
    pub async fn purge_finished(&self, retention: Duration) -> Result<usize, EngineError> {
        let _guard = self.mutation.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(3_650));

        let mut referenced_by_owner: HashMap<String, HashSet<String>> = HashMap::new();
        let mut removed = 0;

        for key in self.store.keys(PLAN_PREFIX).await? {
            let Some(record) = get_json::<PlanRecord>(self.store.as_ref(), &key).await? else {
                continue;
            };

            let mut actions = Vec::with_capacity(record.action_ids.len());
            for id in &record.action_ids {
                if let Some(action) = get_json::<PlannedAction>(
                    self.store.as_ref(),
                    &action_key(&record.owner_id, id),
                )
                .await?
                {
                    actions.push(action);
                }
            }

            if !actions.iter().all(|a| a.status.is_terminal()) {
                continue;
            }
            let finished_at = actions
                .iter()
                .filter_map(|a| a.completed_at)
                .max()
                .unwrap_or(record.created_at);
            if finished_at > cutoff {
                continue;
            }

            if !referenced_by_owner.contains_key(&record.owner_id) {
                let referenced: HashSet<String> = self
                    .load_owner_actions(&record.owner_id)
                    .await?
                    .into_iter()
                    .filter(|a| !a.status.is_terminal())
                    .flat_map(|a| a.depends_on)
                    .collect();
                referenced_by_owner.insert(record.owner_id.clone(), referenced);
            }
            let still_needed = referenced_by_owner
                .get(&record.owner_id)
                .is_some_and(|refs| record.action_ids.iter().any(|id| refs.contains(id)));
            if still_needed {
                continue;
            }

            for id in &record.action_ids {
                self.store.delete(&action_key(&record.owner_id, id)).await?;
                self.store.delete(&index_key(id)).await?;
            }
            self.store.delete(&key).await?;
            removed += actions.len();
            debug!(plan_id = %record.plan_id, "Plan purged");
        }

        if removed > 0 {
            info!(removed, "Purged finished actions");
        }
        Ok(removed)
    }

    /// Plan summary for logs and CLI output
    pub fn describe(status: &PlanStatus) -> Value {
        json!({
            "plan_id": status.plan_id,
            "overall_status": status.overall_status,
            "actions": status
                .actions
                .iter()
                .map(|a| json!({
                    "key": a.key,
                    "kind": a.kind.label(),
                    "status": a.status,
                    "attempts": a.attempt_count,
                    "error": a.last_error,
                }))
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    struct EchoRunner;

    #[async_trait]
    impl ActionRunner for EchoRunner {
        async fn execute(
            &self,
            _action: &PlannedAction,
            payload: Value,
        ) -> Result<Value, ActionExecutionError> {
            Ok(payload)
        }
    }

    fn planner(cascade_cancel: bool) -> ActionPlanner {
        ActionPlanner::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EchoRunner),
            PlannerSettings {
                cascade_cancel,
                backoff: BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
                ..PlannerSettings::default()
            },
        )
    }

    fn spec(key: &str, deps: &[&str]) -> ActionSpec {
        ActionSpec::new(key, ActionKind::tool("tasks.create"), json!({"title": key}))
            .after(deps.iter().copied())
    }

    fn keys(actions: &[PlannedAction]) -> Vec<&str> {
        actions.iter().map(|a| a.key.as_str()).collect()
    }

    async fn id_of(planner: &ActionPlanner, plan_id: &str, key: &str) -> String {
        planner
            .get_plan(plan_id)
            .await
            .unwrap()
            .action_by_key(key)
            .unwrap()
            .id
            .clone()
    }

    #[tokio::test]
    async fn test_priority_then_creation_order() {
        let planner = planner(true);
        planner
            .plan(
                "u1",
                vec![
                    spec("low", &[]),
                    spec("high", &[]).with_priority(5),
                    spec("low2", &[]),
                ],
            )
            .await
            .unwrap();

        let ready = planner.ready_actions("u1").await.unwrap();
        assert_eq!(keys(&ready), vec!["high", "low", "low2"]);
    }

    #[tokio::test]
    async fn test_start_requires_ready() {
        let planner = planner(true);
        let plan_id = planner
            .plan("u1", vec![spec("a", &[]), spec("b", &["a"])])
            .await
            .unwrap();
        let b = id_of(&planner, &plan_id, "b").await;

        let err = planner.start(&b).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_upstream_outputs_reach_dependents() {
        let planner = planner(true);
        let plan_id = planner
            .plan("u1", vec![spec("a", &[]), spec("b", &["a"])])
            .await
            .unwrap();
        let token = CancellationToken::new();

        let a = id_of(&planner, &plan_id, "a").await;
        planner.ready_actions("u1").await.unwrap();
        planner.run_action(&a, &token).await.unwrap();

        let b = id_of(&planner, &plan_id, "b").await;
        planner.ready_actions("u1").await.unwrap();
        let done = planner.run_action(&b, &token).await.unwrap();

        let output = done.output.unwrap();
        assert_eq!(output["title"], "b");
        assert_eq!(output["upstream"]["a"]["title"], "a");
    }

    #[tokio::test]
    async fn test_cancel_cascades_to_dependents() {
        let planner = planner(true);
        let plan_id = planner
            .plan(
                "u1",
                vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["b"]), spec("d", &[])],
            )
            .await
            .unwrap();
        let a = id_of(&planner, &plan_id, "a").await;

        let cancelled = planner.cancel(&a).await.unwrap();
        assert_eq!(cancelled.len(), 3);

        let status = planner.get_plan(&plan_id).await.unwrap();
        assert_eq!(status.action_by_key("c").unwrap().status, ActionStatus::Cancelled);
        assert_eq!(status.action_by_key("d").unwrap().status, ActionStatus::Pending);
        assert_eq!(keys(&planner.ready_actions("u1").await.unwrap()), vec!["d"]);
    }

    #[tokio::test]
    async fn test_cancel_without_cascade_leaves_dependents_blocked() {
        let planner = planner(false);
        let plan_id = planner
            .plan("u1", vec![spec("a", &[]), spec("b", &["a"])])
            .await
            .unwrap();
        let a = id_of(&planner, &plan_id, "a").await;

        assert_eq!(planner.cancel(&a).await.unwrap(), vec![a.clone()]);
        assert!(planner.ready_actions("u1").await.unwrap().is_empty());

        let status = planner.get_plan(&plan_id).await.unwrap();
        assert_eq!(status.action_by_key("b").unwrap().status, ActionStatus::Pending);
        assert!(!planner.has_open_work("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_completed_is_rejected() {
        let planner = planner(true);
        let plan_id = planner.plan("u1", vec![spec("a", &[])]).await.unwrap();
        let a = id_of(&planner, &plan_id, "a").await;
        planner.ready_actions("u1").await.unwrap();
        planner
            .mark_result(&a, ActionOutcome::success(json!(1)))
            .await
            .unwrap();

        let err = planner.cancel(&a).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_result_for_cancelled_running_action_is_discarded() {
        let planner = planner(true);
        let plan_id = planner.plan("u1", vec![spec("a", &[])]).await.unwrap();
        let a = id_of(&planner, &plan_id, "a").await;
        planner.ready_actions("u1").await.unwrap();
        planner.start(&a).await.unwrap();

        planner.cancel(&a).await.unwrap();
        let after = planner
            .mark_result(&a, ActionOutcome::success(json!("late")))
            .await
            .unwrap();
        assert_eq!(after.status, ActionStatus::Cancelled);
        assert!(after.output.is_none());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let planner = planner(true);
        assert!(matches!(
            planner.get_action("nope").await,
            Err(EngineError::ActionNotFound(_))
        ));
        assert!(matches!(
            planner.get_plan("nope").await,
            Err(EngineError::PlanNotFound(_))
        ));
    }

    /// Store that rejects writes once `budget` sets have gone through
    struct FailingStore {
        inner: InMemoryStore,
        budget: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl PersistentStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, sdk::errors::StoreError> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: Vec<u8>,
            ttl: Option<Duration>,
        ) -> Result<(), sdk::errors::StoreError> {
            use std::sync::atomic::Ordering;
            let left = self.budget.load(Ordering::SeqCst);
            if left == 0 {
                return Err(sdk::errors::StoreError::Unavailable("disk full".to_string()));
            }
            self.budget.store(left - 1, Ordering::SeqCst);
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, sdk::errors::StoreError> {
            self.inner.delete(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, sdk::errors::StoreError> {
            self.inner.keys(prefix).await
        }
    }

    #[tokio::test]
    async fn test_partial_plan_stays_reachable() {
        let store = Arc::new(FailingStore {
            inner: InMemoryStore::new(),
            // plan record, then one action and its index entry
            budget: std::sync::atomic::AtomicUsize::new(3),
        });
        let planner = ActionPlanner::new(
            Arc::clone(&store) as Arc<dyn PersistentStore>,
            Arc::new(EchoRunner),
            PlannerSettings::default(),
        );

        let err = planner
            .plan("u1", vec![spec("a", &[]), spec("b", &["a"])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        store
            .budget
            .store(usize::MAX, std::sync::atomic::Ordering::SeqCst);

        // the written action is reachable through its plan, so purge can find it
        let ready = planner.ready_actions("u1").await.unwrap();
        assert_eq!(keys(&ready), vec!["a"]);
        let status = planner.get_plan(&ready[0].plan_id).await.unwrap();
        assert_eq!(keys(&status.actions), vec!["a"]);
    }

    #[tokio::test]
    async fn test_held_plan_hidden_until_released() {
        let planner = planner(true);
        let open = planner.plan("u1", vec![spec("open", &[])]).await.unwrap();
        let held = planner
            .plan_held("u1", vec![spec("first", &[]), spec("second", &["first"])])
            .await
            .unwrap();

        assert_eq!(keys(&planner.ready_actions("u1").await.unwrap()), vec!["open"]);
        assert_eq!(
            keys(&planner.ready_in_plan("u1", &held).await.unwrap()),
            vec!["first"]
        );
        assert_eq!(
            keys(&planner.ready_in_plan("u1", &open).await.unwrap()),
            vec!["open"]
        );
        assert!(planner.has_open_work("u1").await.unwrap());

        let token = CancellationToken::new();
        let first = id_of(&planner, &held, "first").await;
        planner.run_action(&first, &token).await.unwrap();
        // dependents of the first batch are held too
        assert_eq!(keys(&planner.ready_actions("u1").await.unwrap()), vec!["open"]);

        planner.release(&held).await.unwrap();
        assert_eq!(
            keys(&planner.ready_actions("u1").await.unwrap()),
            vec!["open", "second"]
        );
        let status = planner.get_plan(&held).await.unwrap();
        assert!(status.actions.iter().all(|a| a.held_until.is_none()));
    }

    #[tokio::test]
    async fn test_expired_hold_is_ignored() {
        let planner = ActionPlanner::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EchoRunner),
            PlannerSettings {
                first_batch_hold: Duration::ZERO,
                ..PlannerSettings::default()
            },
        );
        planner.plan_held("u1", vec![spec("a", &[])]).await.unwrap();
        assert_eq!(keys(&planner.ready_actions("u1").await.unwrap()), vec!["a"]);
    }

    #[tokio::test]
    async fn test_first_retry_waits_base_delay() {
        let planner = ActionPlanner::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EchoRunner),
            PlannerSettings {
                backoff: BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(600)),
                ..PlannerSettings::default()
            },
        );
        let plan_id = planner.plan("u1", vec![spec("a", &[])]).await.unwrap();
        let a = id_of(&planner, &plan_id, "a").await;
        planner.ready_actions("u1").await.unwrap();

        let before = Utc::now();
        let failed = planner
            .mark_result(&a, ActionOutcome::failure("timeout"))
            .await
            .unwrap();
        let after = Utc::now();

        assert_eq!(failed.attempt_count, 1);
        let retry_at = failed.retry_at.unwrap();
        assert!(retry_at >= before + chrono::Duration::seconds(60));
        assert!(retry_at <= after + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_permanent_error_skips_remaining_attempts() {
        let planner = planner(true);
        let plan_id = planner
            .plan("u1", vec![spec("a", &[]).with_max_attempts(3)])
            .await
            .unwrap();
        let a = id_of(&planner, &plan_id, "a").await;
        planner.ready_actions("u1").await.unwrap();

        let error = ActionExecutionError::Tool {
            action_id: a.clone(),
            tool: "tasks.create".to_string(),
            source: sdk::errors::ToolError::InvalidArguments {
                tool: "tasks.create".to_string(),
                reason: "title missing".to_string(),
            },
        };
        let done = planner
            .mark_result(&a, ActionOutcome::from_error(&error))
            .await
            .unwrap();
        assert_eq!(done.status, ActionStatus::Failed);
        assert_eq!(done.attempt_count, 1);
        assert!(done.last_error.unwrap().contains("title missing"));
    }

    #[tokio::test]
    async fn test_owners_with_work_and_purge() {
        let planner = planner(true);
        let plan_id = planner.plan("u1", vec![spec("a", &[])]).await.unwrap();
        planner.plan("u2", vec![spec("x", &[])]).await.unwrap();
        assert_eq!(planner.owners_with_work().await.unwrap(), vec!["u1", "u2"]);

        let a = id_of(&planner, &plan_id, "a").await;
        planner.ready_actions("u1").await.unwrap();
        planner
            .mark_result(&a, ActionOutcome::success(json!(null)))
            .await
            .unwrap();
        assert_eq!(planner.owners_with_work().await.unwrap(), vec!["u2"]);

        // retention not yet elapsed
        assert_eq!(planner.purge_finished(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(planner.purge_finished(Duration::ZERO).await.unwrap(), 1);
        assert!(planner.get_plan(&plan_id).await.is_err());
        assert!(planner.get_action(&a).await.is_err());
    }
}
