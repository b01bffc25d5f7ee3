//! Engine assembly. One `DispatchRuntime` owns the configuration, the
//! registries, the stores, and the three background loops (queue dispatch,
//! scheduler, archive maintenance); everything is reached through this
//! context struct, never through process globals. Built via
//! `RuntimeBuilder`, started with `start`, stopped with `shutdown`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::dispatch::cancel::CancellationRegistry;
use crate::dispatch::coordinator::Coordinator;
use crate::dispatch::history::Archiver;
use crate::dispatch::queue::TaskQueue;
use crate::dispatch::scheduler::Scheduler;
use crate::dispatch::{AdmissionPolicy, Clock, ShutdownSignal, SystemClock};
use crate::models::{CallReport, CallRequest, SiloError, SiloResult};
use crate::persistence::{
    ArchiveStore, MemoryStore, QueuedCallStore, ScheduleStore, run_blocking,
};
use crate::plugins::{ContentPlugin, PluginCatalog};
use crate::registry::{HookRegistry, TargetInvocation, TargetRegistry};
use crate::sqlite::SqliteStore;

enum StoreSelection {
    Memory,
    Sqlite(PathBuf),
}

impl StoreSelection {
    fn materialize(
        &self,
    ) -> (
        Arc<dyn QueuedCallStore>,
        Arc<dyn ScheduleStore>,
        Arc<dyn ArchiveStore>,
    ) {
        match self {
            Self::Memory => {
                let store = Arc::new(MemoryStore::new());
                (Arc::clone(&store) as _, Arc::clone(&store) as _, store)
            }
            Self::Sqlite(path) => {
                let store = Arc::new(SqliteStore::new(path.clone()));
                (Arc::clone(&store) as _, Arc::clone(&store) as _, store)
            }
        }
    }
}

pub struct RuntimeBuilder {
    config: DispatchConfig,
    store: StoreSelection,
    targets: TargetRegistry,
    hooks: HookRegistry,
    plugins: PluginCatalog,
    clock: Arc<dyn Clock>,
    policy: Option<Arc<dyn AdmissionPolicy>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            config: DispatchConfig::default(),
            store: StoreSelection::Memory,
            targets: TargetRegistry::new(),
            hooks: HookRegistry::new(),
            plugins: PluginCatalog::new(),
            clock: Arc::new(SystemClock),
            policy: None,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Keeps queued calls, schedules, and the archive in process memory.
    /// Nothing survives a restart; this is the default.
    pub fn with_memory_store(mut self) -> Self {
        self.store = StoreSelection::Memory;
        self
    }

    pub fn with_sqlite_store(mut self, database_path: impl Into<PathBuf>) -> Self {
        self.store = StoreSelection::Sqlite(database_path.into());
        self
    }

    pub fn register_target<F, Fut>(mut self, key: impl Into<String>, target: F) -> Self
    where
        F: Fn(TargetInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SiloResult<serde_json::Value>> + Send + 'static,
    {
        self.targets.register(key, target);
        self
    }

    pub fn register_hook<F>(mut self, key: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&CallRequest, &CallReport) + Send + Sync + 'static,
    {
        self.hooks.register(key, hook);
        self
    }

    pub fn register_plugin(mut self, plugin: Arc<dyn ContentPlugin>) -> Self {
        self.plugins.register(plugin);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_admission_policy(mut self, policy: Arc<dyn AdmissionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validates the configuration, installs plugin targets, and wires the
    /// engine together. The returned runtime is idle until `start`.
    pub fn build(mut self) -> SiloResult<DispatchRuntime> {
        self.config.validate()?;
        self.plugins.install_targets(&mut self.targets);

        let (queued_store, schedule_store, archive_store) = self.store.materialize();

        let archiver = Archiver::new(
            Arc::clone(&archive_store),
            self.config.archived_call_lifetime,
        );
        let cancellations = Arc::new(CancellationRegistry::new());
        let queue = TaskQueue::new(
            &self.config,
            Arc::clone(&queued_store),
            archiver.clone(),
            cancellations,
        );

        let mut coordinator = Coordinator::new(
            &self.config,
            queue.clone(),
            Arc::new(self.targets),
            Arc::new(self.hooks),
            archiver.clone(),
            Arc::clone(&queued_store),
        );
        if let Some(policy) = self.policy {
            coordinator = coordinator.with_policy(policy);
        }
        let coordinator = Arc::new(coordinator);

        let scheduler = Arc::new(Scheduler::new(
            &self.config,
            Arc::clone(&coordinator),
            Arc::clone(&schedule_store),
            Arc::clone(&self.clock),
        ));

        Ok(DispatchRuntime {
            config: self.config,
            queue,
            coordinator,
            scheduler,
            archiver,
            queued_store,
            schedule_store,
            archive_store,
            shutdown: Arc::new(ShutdownSignal::new()),
            workers: Mutex::new(Vec::new()),
        })
    }
}

pub struct DispatchRuntime {
    config: DispatchConfig,
    queue: TaskQueue,
    coordinator: Arc<Coordinator>,
    scheduler: Arc<Scheduler>,
    archiver: Archiver,
    queued_store: Arc<dyn QueuedCallStore>,
    schedule_store: Arc<dyn ScheduleStore>,
    archive_store: Arc<dyn ArchiveStore>,
    shutdown: Arc<ShutdownSignal>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Seeds the id allocators from the store, revives persisted queued
    /// calls, and spawns the dispatch, scheduler, and maintenance loops.
    pub async fn start(&self) -> SiloResult<()> {
        if !self.lock_workers()?.is_empty() {
            return Err(SiloError::invalid_input("dispatch runtime already started"));
        }

        crate::logging::init_tracing();
        self.seed_id_allocators().await?;

        let revived = self.coordinator.revive_queued_calls().await?;
        if revived > 0 {
            tracing::info!(revived, "revived persisted queued calls");
        }

        let mut workers = Vec::with_capacity(3);

        let queue = self.queue.clone();
        let shutdown = Arc::clone(&self.shutdown);
        workers.push(tokio::spawn(async move { queue.run(shutdown).await }));

        let scheduler = Arc::clone(&self.scheduler);
        let shutdown = Arc::clone(&self.shutdown);
        workers.push(tokio::spawn(async move { scheduler.run(shutdown).await }));

        let archiver = self.archiver.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.maintenance_interval;
        workers.push(tokio::spawn(async move {
            maintenance_loop(archiver, interval, shutdown).await;
        }));

        *self.lock_workers()? = workers;
        Ok(())
    }

    /// Stops the background loops and waits for them to exit. In-flight
    /// call workers are not interrupted; they settle on their own.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(error) = worker.await
                && error.is_panic()
            {
                tracing::error!(message = %error, "engine loop panicked during shutdown");
            }
        }
    }

    async fn seed_id_allocators(&self) -> SiloResult<()> {
        let queued = Arc::clone(&self.queued_store);
        let queued_max = run_blocking(move || queued.max_call_id()).await?;
        let archive = Arc::clone(&self.archive_store);
        let archived_max = run_blocking(move || archive.max_call_id()).await?;
        if let Some(highest) = queued_max.into_iter().chain(archived_max).map(|id| id.0).max() {
            self.coordinator.seed_call_ids(highest);
        }

        let schedules = Arc::clone(&self.schedule_store);
        if let Some(highest) = run_blocking(move || schedules.max_schedule_id()).await? {
            self.scheduler.seed_schedule_ids(highest.0);
        }
        Ok(())
    }

    fn lock_workers(&self) -> SiloResult<std::sync::MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.workers
            .lock()
            .map_err(|_| SiloError::internal("runtime worker list mutex poisoned"))
    }
}

async fn maintenance_loop(archiver: Archiver, interval: Duration, shutdown: Arc<ShutdownSignal>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        if shutdown.is_triggered() {
            break;
        }
        match archiver.purge_archived_calls().await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "reaped expired archived calls"),
            Err(error) => tracing::error!(message = %error, "archive maintenance pass failed"),
        }
    }
}
