//! Background Scheduler
//!
//! Drives planned actions to completion outside of request paths. Owners
//! with work are queued in the persistent store under
//! `scheduler:owners:{owner_id}`, so several worker processes can poll the
//! same queue. Each entry carries a fresh stamp per enqueue; an owner is
//! only dequeued if its stamp is unchanged since the poll that found it
//! idle, so a concurrent enqueue is never erased.
//!
//! Every poll claims up to `per_owner_concurrency` actions per owner,
//! counting the owner's actions still in flight, bounded globally by
//! `max_in_flight`. Tasks live on one `JoinSet` across polls, so a slow
//! action never delays other owners. Every action gets its own
//! cancellation token, a child of the scheduler's interrupt token.
//!
//! Owners with open work are re-queued every `recover_interval`, which
//! repairs entries lost to a crash or to another process.
//!
//! # Shutdown
//!
//! 1. `shutdown()` cancels the stop token, so nothing new is claimed
//! 2. In-flight actions get `shutdown_timeout` to finish
//! 3. Survivors are interrupted and recorded as failed attempts; they are
//!    retried later if attempts remain

use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::store::PersistentStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::planner::{ActionPlanner, ActionStatus, PlannedAction};
use crate::store::{get_json, set_json};

const QUEUE_PREFIX: &str = "scheduler:owners:";

fn queue_key(owner_id: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, owner_id)
}

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub per_owner_concurrency: usize,
    pub max_in_flight: usize,
    pub shutdown_timeout: Duration,
    /// How often finished plans are purged
    pub purge_interval: Duration,
    /// How often owners with open work are re-queued
    pub recover_interval: Duration,
    /// Age after which finished plans are purged
    pub retention: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            per_owner_concurrency: 2,
            max_in_flight: 16,
            shutdown_timeout: Duration::from_secs(30),
            purge_interval: Duration::from_secs(3_600),
            recover_interval: Duration::from_secs(30),
            retention: Duration::from_secs(7 * 24 * 3_600),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
            per_owner_concurrency: config.scheduler.per_owner_concurrency,
            max_in_flight: config.scheduler.max_in_flight,
            shutdown_timeout: Duration::from_secs(config.scheduler.shutdown_timeout_secs),
            purge_interval: Duration::from_secs(config.scheduler.purge_interval_secs),
            recover_interval: Duration::from_secs(config.scheduler.recover_interval_secs),
            retention: Duration::from_secs(config.planner.retention_secs),
        }
    }
}

/// Persisted queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct QueueEntry {
    queued_at: DateTime<Utc>,
    stamp: String,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Queued owners visited
    pub owners: usize,
    /// Actions started
    pub started: usize,
    pub completed: usize,
    /// Failed attempts that will be retried
    pub retried: usize,
    /// Actions that exhausted their attempts
    pub failed: usize,
    /// Results discarded because the action was cancelled meanwhile
    pub discarded: usize,
    /// Interrupted before getting a slot; the action is still ready
    pub deferred: usize,
    /// Actions that could not be claimed or recorded
    pub errors: usize,
}

impl CycleReport {
    fn record(&mut self, action: &PlannedAction) {
        match action.status {
            ActionStatus::Completed => self.completed += 1,
            ActionStatus::Ready => self.retried += 1,
            ActionStatus::Failed => self.failed += 1,
            ActionStatus::Cancelled => self.discarded += 1,
            ActionStatus::Pending | ActionStatus::Running => {}
        }
    }

    fn harvest(&mut self, joined: Result<ActionTask, JoinError>) {
        match joined {
            Ok(Some(Ok(action))) => self.record(&action),
            Ok(Some(Err(e))) => {
                warn!(error = %e, "Action could not be run");
                self.errors += 1;
            }
            Ok(None) => self.deferred += 1,
            Err(e) => {
                error!(error = %e, "Action task panicked");
                self.errors += 1;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.started + self.completed + self.retried + self.failed + self.discarded + self.errors
            == 0
    }

    fn log(&self) {
        if !self.is_idle() {
            info!(
                owners = self.owners,
                started = self.started,
                completed = self.completed,
                retried = self.retried,
                failed = self.failed,
                errors = self.errors,
                "Scheduler cycle finished"
            );
        }
    }
}

type ActionTask = Option<Result<PlannedAction, EngineError>>;

/// Actions spawned and not yet harvested
#[derive(Debug, Default)]
struct InFlight {
    per_owner: HashMap<String, usize>,
    actions: HashSet<String>,
}

/// Removes an action from [`InFlight`] when its task ends, however it ends
struct InFlightGuard {
    in_flight: Arc<Mutex<InFlight>>,
    owner_id: String,
    action_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.actions.remove(&self.action_id);
        if let Some(count) = in_flight.per_owner.get_mut(&self.owner_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.per_owner.remove(&self.owner_id);
            }
        }
    }
}

/// Polls queued owners and runs their ready actions
pub struct Scheduler {
    planner: Arc<ActionPlanner>,
    store: Arc<dyn PersistentStore>,
    settings: SchedulerSettings,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<InFlight>>,
    /// Orders queue writes within this process
    queue_lock: tokio::sync::Mutex<()>,
    stop: CancellationToken,
}

impl Scheduler {
    pub fn new(
        planner: Arc<ActionPlanner>,
        store: Arc<dyn PersistentStore>,
        settings: SchedulerSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        Self {
            planner,
            store,
            settings,
            slots,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
            queue_lock: tokio::sync::Mutex::new(()),
            stop: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Queue an owner for background processing
    pub async fn enqueue(&self, owner_id: &str) -> Result<(), EngineError> {
        let entry = QueueEntry {
            queued_at: Utc::now(),
            stamp: Uuid::new_v4().to_string(),
        };
        let _guard = self.queue_lock.lock().await;
        set_json(self.store.as_ref(), &queue_key(owner_id), &entry, None).await?;
        debug!(owner_id = %owner_id, "Owner queued");
        Ok(())
    }

    /// Owners currently queued, sorted
    pub async fn queued_owners(&self) -> Result<Vec<String>, EngineError> {
        Ok(self
            .store
            .keys(QUEUE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(QUEUE_PREFIX).map(str::to_string))
            .collect())
    }

    /// Queued owners with the stamp each was read with
    async fn read_queue(&self) -> Result<Vec<(String, Option<String>)>, EngineError> {
        let mut queue = Vec::new();
        for owner_id in self.queued_owners().await? {
            let stamp = get_json::<QueueEntry>(self.store.as_ref(), &queue_key(&owner_id))
                .await
                .ok()
                .flatten()
                .map(|entry| entry.stamp);
            queue.push((owner_id, stamp));
        }
        Ok(queue)
    }

    /// Remove the owner's entry unless it was re-queued after `stamp` was
    /// read. Returns whether the entry was removed.
    async fn dequeue_if_unchanged(
        &self,
        owner_id: &str,
        stamp: Option<&str>,
    ) -> Result<bool, EngineError> {
        let _guard = self.queue_lock.lock().await;
        let key = queue_key(owner_id);
        let current = get_json::<QueueEntry>(self.store.as_ref(), &key)
            .await
            .ok()
            .flatten()
            .map(|entry| entry.stamp);
        if current.as_deref() != stamp {
            debug!(owner_id = %owner_id, "Owner re-queued meanwhile, keeping entry");
            return Ok(false);
        }
        self.store.delete(&key).await?;
        debug!(owner_id = %owner_id, "Owner dequeued");
        Ok(true)
    }

    /// Queue every owner that has open work. Returns how many were queued.
    ///
    /// Picks up owners whose queue entry was lost, e.g. after a crash.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let owners = self.planner.owners_with_work().await?;
        for owner_id in &owners {
            self.enqueue(owner_id).await?;
        }
        Ok(owners.len())
    }

    fn running(&self, owner_id: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .per_owner
            .get(owner_id)
            .copied()
            .unwrap_or(0)
    }

    /// Claim ready actions of every queued owner onto `tasks`
    async fn spawn_ready(
        &self,
        tasks: &mut JoinSet<ActionTask>,
        interrupt: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<Vec<(String, Option<String>)>, EngineError> {
        let queue = self.read_queue().await?;
        report.owners = queue.len();

        for (owner_id, _) in &queue {
            let capacity = self
                .settings
                .per_owner_concurrency
                .saturating_sub(self.running(owner_id));
            if capacity == 0 {
                continue;
            }

            let ready = match self.planner.ready_actions(owner_id).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(owner_id = %owner_id, error = %e, "Failed to load ready actions");
                    report.errors += 1;
                    continue;
                }
            };

            let mut claimed = 0;
            for action in ready {
                if claimed == capacity {
                    break;
                }
                let guard = {
                    let mut in_flight = self
                        .in_flight
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    // spawned earlier and still waiting for a slot
                    if !in_flight.actions.insert(action.id.clone()) {
                        continue;
                    }
                    *in_flight.per_owner.entry(owner_id.clone()).or_default() += 1;
                    InFlightGuard {
                        in_flight: Arc::clone(&self.in_flight),
                        owner_id: owner_id.clone(),
                        action_id: action.id.clone(),
                    }
                };

                let planner = Arc::clone(&self.planner);
                let slots = Arc::clone(&self.slots);
                let token = interrupt.child_token();
                claimed += 1;
                report.started += 1;

                tasks.spawn(async move {
                    let _guard = guard;
                    let _permit = tokio::select! {
                        permit = slots.acquire_owned() => permit.ok()?,
                        _ = token.cancelled() => return None,
                    };
                    Some(planner.run_action(&action.id, &token).await)
                });
            }
        }

        Ok(queue)
    }

    /// Dequeue visited owners with nothing running and no open work
    async fn dequeue_idle(&self, queue: &[(String, Option<String>)]) -> Result<(), EngineError> {
        for (owner_id, stamp) in queue {
            if self.running(owner_id) > 0 {
                continue;
            }
            match self.planner.has_open_work(owner_id).await {
                Ok(false) => {
                    self.dequeue_if_unchanged(owner_id, stamp.as_deref())
                        .await?;
                }
                Ok(true) => {}
                Err(e) => warn!(owner_id = %owner_id, error = %e, "Failed to check open work"),
            }
        }
        Ok(())
    }

    /// Run one cycle to completion
    pub async fn run_once(&self) -> Result<CycleReport, EngineError> {
        let interrupt = CancellationToken::new();
        let mut report = CycleReport::default();
        let mut tasks: JoinSet<ActionTask> = JoinSet::new();

        let queue = self.spawn_ready(&mut tasks, &interrupt, &mut report).await?;
        while let Some(joined) = tasks.join_next().await {
            report.harvest(joined);
        }
        self.dequeue_idle(&queue).await?;

        report.log();
        Ok(report)
    }

    /// Poll until [`Scheduler::shutdown`] is called
    pub async fn run_forever(&self, poll_interval: Duration) -> Result<(), EngineError> {
        info!(poll_interval_ms = poll_interval.as_millis() as u64, "Scheduler started");

        match self.recover().await {
            Ok(count) if count > 0 => info!(owners = count, "Recovered queued owners"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to recover queued owners"),
        }
        let mut last_purge = Instant::now();
        let mut last_recover = Instant::now();

        let interrupt = CancellationToken::new();
        let mut tasks: JoinSet<ActionTask> = JoinSet::new();
        let mut report = CycleReport::default();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                report.harvest(joined);
            }
            if self.stop.is_cancelled() {
                break;
            }

            match self.spawn_ready(&mut tasks, &interrupt, &mut report).await {
                Ok(queue) => {
                    if let Err(e) = self.dequeue_idle(&queue).await {
                        error!(error = %e, "Failed to update owner queue");
                    }
                }
                Err(e) => error!(error = %e, "Scheduler cycle failed"),
            }
            report.log();
            report = CycleReport::default();

            if last_purge.elapsed() >= self.settings.purge_interval {
                last_purge = Instant::now();
                match self.planner.purge_finished(self.settings.retention).await {
                    Ok(removed) => debug!(removed, "Retention purge finished"),
                    Err(e) => warn!(error = %e, "Retention purge failed"),
                }
            }
            if last_recover.elapsed() >= self.settings.recover_interval {
                last_recover = Instant::now();
                if let Err(e) = self.recover().await {
                    warn!(error = %e, "Failed to rebuild owner queue");
                }
            }

            // a finished action may have unblocked dependents, so poll again
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => report.harvest(joined),
            }
        }

        if !tasks.is_empty() {
            info!(
                in_flight = tasks.len(),
                timeout_secs = self.settings.shutdown_timeout.as_secs(),
                "Stop requested, draining in-flight actions"
            );
            let drained = timeout(self.settings.shutdown_timeout, async {
                while let Some(joined) = tasks.join_next().await {
                    report.harvest(joined);
                }
            })
            .await;
            if drained.is_err() {
                warn!(remaining = tasks.len(), "Drain timed out, interrupting remaining actions");
                interrupt.cancel();
                while let Some(joined) = tasks.join_next().await {
                    report.harvest(joined);
                }
            }
            report.log();
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Stop the loop and drain in-flight actions
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::planner::{ActionKind, ActionRunner, ActionSpec, OverallStatus, PlannerSettings};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use sdk::errors::ActionExecutionError;
    use serde_json::{json, Value};

    /// Fails actions whose payload says so, sleeps for `delay_ms` otherwise
    struct ScriptedRunner;

    #[async_trait]
    impl ActionRunner for ScriptedRunner {
        async fn execute(
            &self,
            action: &PlannedAction,
            payload: Value,
        ) -> Result<Value, ActionExecutionError> {
            if payload["fail"] == json!(true) {
                return Err(ActionExecutionError::Internal {
                    action_id: action.id.clone(),
                    message: "scripted failure".to_string(),
                });
            }
            if let Some(ms) = payload["delay_ms"].as_u64() {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(json!({"done": action.key}))
        }
    }

    fn setup(settings: SchedulerSettings) -> (Arc<ActionPlanner>, Scheduler) {
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let planner = Arc::new(ActionPlanner::new(
            Arc::clone(&store),
            Arc::new(ScriptedRunner),
            PlannerSettings {
                backoff: BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
                ..PlannerSettings::default()
            },
        ));
        let scheduler = Scheduler::new(Arc::clone(&planner), store, settings);
        (planner, scheduler)
    }

    fn spec(key: &str, payload: Value) -> ActionSpec {
        ActionSpec::new(key, ActionKind::tool("tasks.create"), payload)
    }

    #[tokio::test]
    async fn test_run_once_respects_per_owner_concurrency() {
        let (planner, scheduler) = setup(SchedulerSettings {
            per_owner_concurrency: 2,
            ..SchedulerSettings::default()
        });
        planner
            .plan(
                "u1",
                vec![spec("a", json!({})), spec("b", json!({})), spec("c", json!({}))],
            )
            .await
            .unwrap();
        scheduler.enqueue("u1").await.unwrap();

        let first = scheduler.run_once().await.unwrap();
        assert_eq!(first.started, 2);
        assert_eq!(first.completed, 2);
        assert_eq!(scheduler.queued_owners().await.unwrap(), vec!["u1"]);

        let second = scheduler.run_once().await.unwrap();
        assert_eq!(second.completed, 1);
        assert!(scheduler.queued_owners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_fail_siblings() {
        let (planner, scheduler) = setup(SchedulerSettings::default());
        let plan_id = planner
            .plan(
                "u1",
                vec![
                    spec("bad", json!({"fail": true})).with_max_attempts(1),
                    spec("good", json!({})),
                ],
            )
            .await
            .unwrap();
        scheduler.enqueue("u1").await.unwrap();

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);

        let status = planner.get_plan(&plan_id).await.unwrap();
        assert_eq!(status.action_by_key("good").unwrap().status, ActionStatus::Completed);
        assert_eq!(status.action_by_key("bad").unwrap().status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn test_recover_requeues_owners_with_work() {
        let (planner, scheduler) = setup(SchedulerSettings::default());
        planner.plan("u1", vec![spec("a", json!({}))]).await.unwrap();
        assert!(scheduler.queued_owners().await.unwrap().is_empty());

        assert_eq!(scheduler.recover().await.unwrap(), 1);
        assert_eq!(scheduler.queued_owners().await.unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_requeue_during_cycle_survives_dequeue() {
        let (_planner, scheduler) = setup(SchedulerSettings::default());
        scheduler.enqueue("u1").await.unwrap();
        let queue = scheduler.read_queue().await.unwrap();
        let seen = queue[0].1.clone();

        // a workflow enqueues after the cycle found u1 idle
        scheduler.enqueue("u1").await.unwrap();
        assert!(!scheduler
            .dequeue_if_unchanged("u1", seen.as_deref())
            .await
            .unwrap());
        assert_eq!(scheduler.queued_owners().await.unwrap(), vec!["u1"]);

        let current = scheduler.read_queue().await.unwrap()[0].1.clone();
        assert!(scheduler
            .dequeue_if_unchanged("u1", current.as_deref())
            .await
            .unwrap());
        assert!(scheduler.queued_owners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_queue_entry_is_recovered_while_running() {
        let (planner, scheduler) = setup(SchedulerSettings {
            recover_interval: Duration::from_millis(20),
            ..SchedulerSettings::default()
        });
        let scheduler = Arc::new(scheduler);
        let worker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_forever(Duration::from_millis(5)).await })
        };

        // let startup recovery pass before planning
        tokio::time::sleep(Duration::from_millis(20)).await;
        // planned after startup and never enqueued
        let plan_id = planner.plan("u1", vec![spec("a", json!({}))]).await.unwrap();
        let mut completed = false;
        for _ in 0..200 {
            let status = planner.get_plan(&plan_id).await.unwrap();
            if status.actions[0].status == ActionStatus::Completed {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(completed);

        scheduler.shutdown();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_owner_does_not_hold_back_others() {
        let (planner, scheduler) = setup(SchedulerSettings {
            shutdown_timeout: Duration::from_millis(50),
            ..SchedulerSettings::default()
        });
        let scheduler = Arc::new(scheduler);
        let slow_plan = planner
            .plan("a", vec![spec("slow", json!({"delay_ms": 10_000}))])
            .await
            .unwrap();
        let fast_plan = planner
            .plan(
                "b",
                vec![spec("b1", json!({})), spec("b2", json!({})).after(["b1"])],
            )
            .await
            .unwrap();
        scheduler.enqueue("a").await.unwrap();
        scheduler.enqueue("b").await.unwrap();

        let worker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_forever(Duration::from_millis(5)).await })
        };

        let mut finished = false;
        for _ in 0..200 {
            let status = planner.get_plan(&fast_plan).await.unwrap();
            if status.overall_status == OverallStatus::Completed {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(finished);
        assert_eq!(
            planner.get_plan(&slow_plan).await.unwrap().actions[0].status,
            ActionStatus::Running
        );

        scheduler.shutdown();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_survivors() {
        let (planner, scheduler) = setup(SchedulerSettings {
            shutdown_timeout: Duration::from_millis(50),
            ..SchedulerSettings::default()
        });
        let scheduler = Arc::new(scheduler);
        let plan_id = planner
            .plan("u1", vec![spec("slow", json!({"delay_ms": 10_000}))])
            .await
            .unwrap();
        scheduler.enqueue("u1").await.unwrap();

        let worker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_forever(Duration::from_millis(10)).await })
        };

        let id = planner.get_plan(&plan_id).await.unwrap().actions[0].id.clone();
        for _ in 0..200 {
            if planner.get_action(&id).await.unwrap().status == ActionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        scheduler.shutdown();
        worker.await.unwrap().unwrap();

        let action = planner.get_action(&id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Ready);
        assert_eq!(action.attempt_count, 1);
        assert!(action.last_error.unwrap().contains("interrupted"));
    }
}
