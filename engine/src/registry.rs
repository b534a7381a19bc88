//! Service registry
//!
//! Builds the process-local services on first use and wires them together.
//! There are no globals: each registry owns one set of services, and
//! `teardown()` stops background tasks and closes the store.
//!
//! ```text
//! store ─┬─> cache ──────┐
//!        ├─> memory ─────┼─> chains ─> planner ─> scheduler ─> orchestrator
//! model ─┴─> governor ───┘
//! ```

use sdk::errors::EngineError;
use sdk::model::LanguageModel;
use sdk::store::PersistentStore;
use sdk::types::ToolAdapter;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TieredCache;
use crate::chains::{ChainExecutor, ChainSettings};
use crate::config::Config;
use crate::governor::{CallGovernor, GovernorSettings};
use crate::llm;
use crate::memory::MemoryStore;
use crate::orchestrator::Orchestrator;
use crate::planner::{ActionPlanner, Dispatcher, PlannerSettings};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::store::{open_store, OpenedStore};
use crate::tools::ToolRegistry;

/// Counts from one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub memory_records: usize,
    pub expired_rows: u64,
    pub purged_actions: usize,
}

pub struct ServiceRegistry {
    config: Config,
    tools: Arc<dyn ToolAdapter>,
    model_override: Option<Arc<dyn LanguageModel>>,
    store_override: Option<Arc<dyn PersistentStore>>,

    store: OnceCell<OpenedStore>,
    model: OnceCell<Arc<dyn LanguageModel>>,
    governor: OnceCell<Arc<CallGovernor>>,
    cache: OnceCell<Arc<TieredCache>>,
    memory: OnceCell<Arc<MemoryStore>>,
    chains: OnceCell<Arc<ChainExecutor>>,
    planner: OnceCell<Arc<ActionPlanner>>,
    scheduler: OnceCell<Arc<Scheduler>>,
    orchestrator: OnceCell<Arc<Orchestrator>>,

    background: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    /// Registry over `config` with locally acknowledged tools
    pub fn new(config: Config) -> Self {
        Self {
            config,
            tools: Arc::new(ToolRegistry::local()),
            model_override: None,
            store_override: None,
            store: OnceCell::new(),
            model: OnceCell::new(),
            governor: OnceCell::new(),
            cache: OnceCell::new(),
            memory: OnceCell::new(),
            chains: OnceCell::new(),
            planner: OnceCell::new(),
            scheduler: OnceCell::new(),
            orchestrator: OnceCell::new(),
            background: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Use `tools` for tool actions
    pub fn with_tools(mut self, tools: Arc<dyn ToolAdapter>) -> Self {
        self.tools = tools;
        self
    }

    /// Use `model` instead of the configured provider
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model_override = Some(model);
        self
    }

    /// Use `store` instead of the configured backend
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store_override = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn opened_store(&self) -> Result<&OpenedStore, EngineError> {
        self.store
            .get_or_try_init(|| async {
                if let Some(store) = &self.store_override {
                    return Ok(OpenedStore {
                        store: Arc::clone(store),
                        sqlite: None,
                    });
                }
                let opened = open_store(&self.config).await?;
                info!(backend = %opened.store.name(), "Store opened");
                Ok::<_, EngineError>(opened)
            })
            .await
    }

    pub async fn store(&self) -> Result<Arc<dyn PersistentStore>, EngineError> {
        Ok(Arc::clone(&self.opened_store().await?.store))
    }

    pub async fn model(&self) -> Result<Arc<dyn LanguageModel>, EngineError> {
        self.model
            .get_or_try_init(|| async {
                match &self.model_override {
                    Some(model) => Ok(Arc::clone(model)),
                    None => llm::build_provider(&self.config.llm),
                }
            })
            .await
            .map(Arc::clone)
    }

    pub async fn governor(&self) -> Arc<CallGovernor> {
        let governor = self
            .governor
            .get_or_init(|| async {
                Arc::new(CallGovernor::new(GovernorSettings::from(
                    &self.config.governor,
                )))
            })
            .await;
        Arc::clone(governor)
    }

    pub async fn cache(&self) -> Result<Arc<TieredCache>, EngineError> {
        self.cache
            .get_or_try_init(|| async {
                let store = self.store().await?;
                Ok::<_, EngineError>(Arc::new(TieredCache::new(store, &self.config.cache)))
            })
            .await
            .map(Arc::clone)
    }

    pub async fn memory(&self) -> Result<Arc<MemoryStore>, EngineError> {
        self.memory
            .get_or_try_init(|| async {
                let store = self.store().await?;
                Ok::<_, EngineError>(Arc::new(MemoryStore::new(
                    store,
                    self.config.memory.clone(),
                )))
            })
            .await
            .map(Arc::clone)
    }

    pub async fn chains(&self) -> Result<Arc<ChainExecutor>, EngineError> {
        self.chains
            .get_or_try_init(|| async {
                let settings = ChainSettings::from_config(&self.config)?;
                Ok::<_, EngineError>(Arc::new(ChainExecutor::new(
                    self.model().await?,
                    self.governor().await,
                    self.cache().await?,
                    self.memory().await?,
                    settings,
                )))
            })
            .await
            .map(Arc::clone)
    }

    pub async fn planner(&self) -> Result<Arc<ActionPlanner>, EngineError> {
        self.planner
            .get_or_try_init(|| async {
                let dispatcher = Dispatcher::new(
                    self.chains().await?,
                    Arc::clone(&self.tools),
                    self.memory().await?,
                );
                Ok::<_, EngineError>(Arc::new(ActionPlanner::new(
                    self.store().await?,
                    Arc::new(dispatcher),
                    PlannerSettings::from_config(&self.config),
                )))
            })
            .await
            .map(Arc::clone)
    }

    pub async fn scheduler(&self) -> Result<Arc<Scheduler>, EngineError> {
        self.scheduler
            .get_or_try_init(|| async {
                Ok::<_, EngineError>(Arc::new(Scheduler::new(
                    self.planner().await?,
                    self.store().await?,
                    SchedulerSettings::from_config(&self.config),
                )))
            })
            .await
            .map(Arc::clone)
    }

    pub async fn orchestrator(&self) -> Result<Arc<Orchestrator>, EngineError> {
        self.orchestrator
            .get_or_try_init(|| async {
                Ok::<_, EngineError>(Arc::new(Orchestrator::new(
                    self.planner().await?,
                    self.scheduler().await?,
                    self.memory().await?,
                )))
            })
            .await
            .map(Arc::clone)
    }

    /// Start the periodic memory sweep. Calling it again is a no-op.
    pub async fn start_background(&self) -> Result<(), EngineError> {
        let memory = self.memory().await?;
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_none() {
            let interval = Duration::from_secs(self.config.memory.sweep_interval_secs.max(1));
            *sweeper = Some(memory.spawn_sweeper(interval, self.background.child_token()));
            debug!(interval_secs = interval.as_secs(), "Memory sweeper started");
        }
        Ok(())
    }

    /// One maintenance pass: expired memory, expired store rows and
    /// finished plans past retention
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let memory_records = self.memory().await?.sweep().await?;
        let expired_rows = match &self.opened_store().await?.sqlite {
            Some(sqlite) => sqlite.purge_expired().await?,
            None => 0,
        };
        let planner = self.planner().await?;
        let purged_actions = planner
            .purge_finished(planner.settings().retention)
            .await?;

        Ok(SweepReport {
            memory_records,
            expired_rows,
            purged_actions,
        })
    }

    /// Stop background work and close the store
    pub async fn teardown(&self) -> Result<(), EngineError> {
        info!("Tearing down services");

        if let Some(scheduler) = self.scheduler.get() {
            scheduler.shutdown();
        }
        self.background.cancel();

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Memory sweeper ended abnormally");
            }
        }

        if let Some(sqlite) = self.store.get().and_then(|opened| opened.sqlite.as_ref()) {
            sqlite.close().await?;
        }

        info!("Teardown completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use crate::store::InMemoryStore;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config
    }

    #[tokio::test]
    async fn test_services_are_shared() {
        let registry = ServiceRegistry::new(memory_config());
        let a = registry.planner().await.unwrap();
        let b = registry.planner().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let m1 = registry.memory().await.unwrap();
        let m2 = registry.memory().await.unwrap();
        assert!(Arc::ptr_eq(&m1, &m2));
    }

    #[tokio::test]
    async fn test_store_override() {
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let registry = ServiceRegistry::new(Config::default()).with_store(Arc::clone(&store));
        assert!(Arc::ptr_eq(&registry.store().await.unwrap(), &store));
    }

    #[tokio::test]
    async fn test_teardown_stops_sweeper() {
        let registry = ServiceRegistry::new(memory_config());
        registry.start_background().await.unwrap();
        registry.start_background().await.unwrap();
        registry.teardown().await.unwrap();
        assert!(registry.sweeper.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_lazily() {
        let mut config = memory_config();
        config.llm.provider = "carrier-pigeon".to_string();
        let registry = ServiceRegistry::new(config);

        // services that do not need a model still build
        assert!(registry.memory().await.is_ok());
        assert!(matches!(registry.chains().await, Err(EngineError::Config(_))));
    }
}
