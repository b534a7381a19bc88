//! Property tests across cache keys, backoff and planner ordering

use async_trait::async_trait;
use proptest::prelude::*;
use rhythm_engine::backoff::BackoffPolicy;
use rhythm_engine::cache::cache_key;
use rhythm_engine::planner::{
    ActionKind, ActionPlanner, ActionRunner, ActionSpec, OverallStatus, PlannedAction,
    PlannerSettings,
};
use rhythm_engine::store::InMemoryStore;
use sdk::errors::ActionExecutionError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct OrderRunner {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl ActionRunner for OrderRunner {
    async fn execute(
        &self,
        action: &PlannedAction,
        _payload: Value,
    ) -> Result<Value, ActionExecutionError> {
        self.order.lock().unwrap().push(action.key.clone());
        Ok(json!({}))
    }
}

fn object_from(pairs: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    Value::Object(map)
}

proptest! {
    /// Key order and surrounding whitespace never change the cache key
    #[test]
    fn prop_cache_key_ignores_formatting(
        fields in proptest::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9]{0,12}", 1..6),
        pad in 0usize..3,
    ) {
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let mut reversed = pairs.clone();
        reversed.reverse();
        let padded: Vec<(String, String)> = reversed
            .iter()
            .map(|(k, v)| (k.clone(), format!("{}{}{}", " ".repeat(pad), v, "\t".repeat(pad))))
            .collect();

        let canonical = cache_key("task_analysis", &object_from(&pairs), "u1");
        prop_assert_eq!(&canonical, &cache_key("task_analysis", &object_from(&padded), "u1"));
        prop_assert_ne!(&canonical, &cache_key("task_analysis", &object_from(&pairs), "u2"));
        prop_assert_ne!(&canonical, &cache_key("mood_insight", &object_from(&pairs), "u1"));
    }

    /// Delays never shrink as attempts grow and never pass the cap
    #[test]
    fn prop_backoff_monotonic_and_capped(
        base_ms in 1u64..2_000,
        cap_ms in 1u64..120_000,
        attempt in 0u32..64,
    ) {
        let policy = BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
        let delay = policy.delay(attempt);
        prop_assert!(delay <= policy.cap());
        prop_assert!(delay >= policy.base().min(policy.cap()));
        prop_assert!(policy.delay(attempt + 1) >= delay);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever the graph, every action runs once and after all of its
    /// dependencies
    #[test]
    fn prop_planner_runs_dependencies_first(
        edges in proptest::collection::vec(
            proptest::collection::vec(any::<prop::sample::Index>(), 0..3),
            1..10,
        )
    ) {
        let specs: Vec<ActionSpec> = edges
            .iter()
            .enumerate()
            .map(|(i, deps)| {
                let mut dep_keys: Vec<String> = if i == 0 {
                    Vec::new()
                } else {
                    deps.iter().map(|d| format!("k{}", d.index(i))).collect()
                };
                dep_keys.sort();
                dep_keys.dedup();
                ActionSpec::new(format!("k{}", i), ActionKind::tool("t"), json!({})).after(dep_keys)
            })
            .collect();
        let deps_of: HashMap<String, Vec<String>> = specs
            .iter()
            .map(|s| (s.key.clone(), s.depends_on.clone()))
            .collect();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let runner = Arc::new(OrderRunner::default());
        let planner = ActionPlanner::new(
            Arc::new(InMemoryStore::new()),
            Arc::clone(&runner) as Arc<dyn ActionRunner>,
            PlannerSettings::default(),
        );

        let status = runtime.block_on(async {
            let plan_id = planner.plan("u1", specs.clone()).await.unwrap();
            let token = CancellationToken::new();
            loop {
                let ready = planner.ready_actions("u1").await.unwrap();
                if ready.is_empty() {
                    break;
                }
                for action in ready {
                    planner.run_action(&action.id, &token).await.unwrap();
                }
            }
            planner.get_plan(&plan_id).await.unwrap()
        });

        prop_assert_eq!(status.overall_status, OverallStatus::Completed);
        let order = runner.order.lock().unwrap().clone();
        prop_assert_eq!(order.len(), specs.len());
        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();
        for (key, deps) in &deps_of {
            for dep in deps {
                prop_assert!(position[dep.as_str()] < position[key.as_str()]);
            }
        }
    }
}
