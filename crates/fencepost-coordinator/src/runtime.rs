// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for fencepost-coordinator.
//!
//! [`CoordinatorRuntime`] spawns the dispatcher, completion monitor and
//! validator loops for every enabled work kind, plus an optional pool of
//! in-process task executors, inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fencepost_coordinator::runtime::CoordinatorRuntime;
//! use fencepost_core::fence::RedisFenceStore;
//! use fencepost_core::persistence::PostgresPersistence;
//! use fencepost_core::queue::{RedisTaskQueue, RedisTaskQueueConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     fencepost_core::migrations::run_postgres(&pool).await?;
//!
//!     let runtime = CoordinatorRuntime::builder()
//!         .persistence(Arc::new(PostgresPersistence::new(pool)))
//!         .store(Arc::new(RedisFenceStore::connect("redis://127.0.0.1:6379").await?))
//!         .queue(Arc::new(RedisTaskQueue::connect(RedisTaskQueueConfig::default()).await?))
//!         .source(Arc::new(MySource))
//!         .pipeline(Arc::new(MyPipeline))
//!         .executor_concurrency(4)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fencepost_core::{FenceStore, Keyspace, Persistence, TaskQueue, WorkKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backends::Backends;
use crate::batch_worker::{BatchWorker, BatchWorkerConfig};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::executor::{ExecutorConfig, TaskExecutor};
use crate::monitor::{CompletionMonitor, MonitorConfig};
use crate::pipeline::{CountingPipeline, DocumentPipeline, DocumentSource, EmptySource};
use crate::producer::{FetchTask, FetchTaskConfig};
use crate::resource_state::{ResourceStateConfig, ResourceStateMachine};
use crate::validator::{Validator, ValidatorConfig};

/// Builder for creating a [`CoordinatorRuntime`].
pub struct CoordinatorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    store: Option<Arc<dyn FenceStore>>,
    queue: Option<Arc<dyn TaskQueue>>,
    source: Option<Arc<dyn DocumentSource>>,
    pipeline: Option<Arc<dyn DocumentPipeline>>,
    key_prefix: String,
    kinds: Vec<WorkKind>,
    dispatch_interval: Duration,
    monitor_interval: Duration,
    validator_interval: Duration,
    active_signal_ttl: Duration,
    stall_timeout: Duration,
    executor_concurrency: usize,
    resource_state: ResourceStateConfig,
    batch_worker: BatchWorkerConfig,
}

impl Default for CoordinatorRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            store: None,
            queue: None,
            source: None,
            pipeline: None,
            key_prefix: "fencepost".to_string(),
            kinds: vec![WorkKind::Indexing],
            dispatch_interval: Duration::from_secs(15),
            monitor_interval: Duration::from_secs(15),
            validator_interval: Duration::from_secs(60),
            active_signal_ttl: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(3 * 60 * 60),
            executor_concurrency: 0,
            resource_state: ResourceStateConfig::default(),
            batch_worker: BatchWorkerConfig::default(),
        }
    }
}

impl CoordinatorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply intervals, TTLs, key prefix and enabled kinds from [`Config`].
    pub fn with_config(mut self, config: &Config) -> Self {
        self.key_prefix = config.key_prefix.clone();
        self.dispatch_interval = config.dispatch_interval;
        self.monitor_interval = config.monitor_interval;
        self.validator_interval = config.validator_interval;
        self.active_signal_ttl = config.active_signal_ttl;
        self.stall_timeout = config.stall_timeout;
        self.executor_concurrency = config.executor_concurrency;
        self.kinds = if config.permission_sync_enabled {
            vec![WorkKind::Indexing, WorkKind::PermissionSync]
        } else {
            vec![WorkKind::Indexing]
        };
        self
    }

    /// Set the attempts ledger (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the fence store (required).
    pub fn store(mut self, store: Arc<dyn FenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the task queue (required).
    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the document source used by fetch tasks.
    ///
    /// Default: a source with no documents
    pub fn source(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the document pipeline used by batch workers.
    ///
    /// Default: a pipeline that only counts documents
    pub fn pipeline(mut self, pipeline: Arc<dyn DocumentPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Set the key prefix in the fence store.
    ///
    /// Default: `fencepost`
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the work kinds to run loops for.
    ///
    /// Default: indexing only
    pub fn kinds(mut self, kinds: Vec<WorkKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Set the dispatcher poll interval.
    ///
    /// Default: 15 seconds
    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Set the completion monitor poll interval.
    ///
    /// Default: 15 seconds
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Set the validator interval.
    ///
    /// Default: 60 seconds
    pub fn validator_interval(mut self, interval: Duration) -> Self {
        self.validator_interval = interval;
        self
    }

    /// Set the active signal TTL.
    ///
    /// Default: 5 minutes
    pub fn active_signal_ttl(mut self, ttl: Duration) -> Self {
        self.active_signal_ttl = ttl;
        self
    }

    /// Set the stall ceiling.
    ///
    /// Default: 3 hours
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Set the number of in-process task executors.
    ///
    /// Default: 0
    pub fn executor_concurrency(mut self, count: usize) -> Self {
        self.executor_concurrency = count;
        self
    }

    /// Set the resource state machine tuning.
    pub fn resource_state(mut self, config: ResourceStateConfig) -> Self {
        self.resource_state = config;
        self
    }

    /// Set the batch worker tuning. Its active signal TTL is overridden by
    /// [`active_signal_ttl`](Self::active_signal_ttl).
    pub fn batch_worker(mut self, config: BatchWorkerConfig) -> Self {
        self.batch_worker = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<CoordinatorRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        if self.key_prefix.is_empty() {
            anyhow::bail!("key_prefix must not be empty");
        }

        let backends =
            Backends::new(persistence, store, queue).with_keyspace(Keyspace::new(self.key_prefix));

        Ok(CoordinatorRuntimeConfig {
            backends,
            source: self.source.unwrap_or_else(|| Arc::new(EmptySource)),
            pipeline: self.pipeline.unwrap_or_else(|| Arc::new(CountingPipeline)),
            kinds: self.kinds,
            dispatch_interval: self.dispatch_interval,
            monitor_interval: self.monitor_interval,
            validator_interval: self.validator_interval,
            active_signal_ttl: self.active_signal_ttl,
            stall_timeout: self.stall_timeout,
            executor_concurrency: self.executor_concurrency,
            resource_state: self.resource_state,
            batch_worker: self.batch_worker,
        })
    }
}

/// Configuration for a [`CoordinatorRuntime`].
pub struct CoordinatorRuntimeConfig {
    backends: Backends,
    source: Arc<dyn DocumentSource>,
    pipeline: Arc<dyn DocumentPipeline>,
    kinds: Vec<WorkKind>,
    dispatch_interval: Duration,
    monitor_interval: Duration,
    validator_interval: Duration,
    active_signal_ttl: Duration,
    stall_timeout: Duration,
    executor_concurrency: usize,
    resource_state: ResourceStateConfig,
    batch_worker: BatchWorkerConfig,
}

impl CoordinatorRuntimeConfig {
    /// Start the runtime, spawning every background loop.
    pub async fn start(self) -> Result<CoordinatorRuntime> {
        let backends = self.backends;
        let state_machine =
            ResourceStateMachine::new(backends.persistence.clone(), self.resource_state);

        let mut workers: Vec<Worker> = Vec::new();

        for &kind in &self.kinds {
            let dispatcher = Dispatcher::new(
                backends.clone(),
                state_machine.clone(),
                DispatcherConfig {
                    kind,
                    poll_interval: self.dispatch_interval,
                    ..DispatcherConfig::default()
                },
            );
            let shutdown = dispatcher.shutdown_handle();
            let handle = tokio::spawn(async move { dispatcher.run().await });
            workers.push(Worker::new("dispatcher", kind, shutdown, handle));

            let monitor = CompletionMonitor::new(
                backends.clone(),
                state_machine.clone(),
                MonitorConfig {
                    kind,
                    poll_interval: self.monitor_interval,
                },
            );
            let shutdown = monitor.shutdown_handle();
            let handle = tokio::spawn(async move { monitor.run().await });
            workers.push(Worker::new("monitor", kind, shutdown, handle));

            let validator = Validator::new(
                backends.clone(),
                state_machine.clone(),
                ValidatorConfig {
                    kind,
                    interval: self.validator_interval,
                    stall_timeout: self.stall_timeout,
                    active_signal_ttl: self.active_signal_ttl,
                    ..ValidatorConfig::default()
                },
            );
            let shutdown = validator.shutdown_handle();
            let handle = tokio::spawn(async move { validator.run().await });
            workers.push(Worker::new("validator", kind, shutdown, handle));
        }

        if self.executor_concurrency > 0 {
            let fetch = Arc::new(FetchTask::new(
                backends.clone(),
                self.source,
                FetchTaskConfig {
                    active_signal_ttl: self.active_signal_ttl,
                    ..FetchTaskConfig::default()
                },
            ));
            let batch = Arc::new(BatchWorker::new(
                backends.clone(),
                self.pipeline,
                BatchWorkerConfig {
                    active_signal_ttl: self.active_signal_ttl,
                    ..self.batch_worker
                },
            ));
            for _ in 0..self.executor_concurrency {
                let executor = TaskExecutor::new(
                    backends.clone(),
                    fetch.clone(),
                    batch.clone(),
                    ExecutorConfig::default(),
                );
                let shutdown = executor.shutdown_handle();
                let handle = tokio::spawn(async move { executor.run().await });
                workers.push(Worker {
                    name: "executor",
                    kind: None,
                    shutdown,
                    handle,
                });
            }
        }

        info!(
            kinds = ?self.kinds,
            executors = self.executor_concurrency,
            key_prefix = backends.keys.prefix(),
            "CoordinatorRuntime started"
        );

        Ok(CoordinatorRuntime { workers, backends })
    }
}

struct Worker {
    name: &'static str,
    kind: Option<WorkKind>,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn new(name: &'static str, kind: WorkKind, shutdown: Arc<Notify>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            kind: Some(kind),
            shutdown,
            handle,
        }
    }
}

/// A running coordinator embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoordinatorRuntime {
    workers: Vec<Worker>,
    backends: Backends,
}

impl CoordinatorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CoordinatorRuntimeBuilder {
        CoordinatorRuntimeBuilder::new()
    }

    /// Backends shared by every worker.
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Number of spawned background loops.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Check if every background loop is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|w| !w.handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every loop to stop, then waits for them. Executors finish the
    /// task they are running first.
    pub async fn shutdown(self) -> Result<()> {
        info!("CoordinatorRuntime shutting down...");

        for worker in &self.workers {
            worker.shutdown.notify_one();
        }

        let mut panicked = 0;
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                panicked += 1;
                error!(
                    worker = worker.name,
                    kind = ?worker.kind,
                    error = %e,
                    "Worker task panicked"
                );
            }
        }

        if panicked > 0 {
            anyhow::bail!("{panicked} worker task(s) panicked");
        }
        info!("CoordinatorRuntime shutdown complete");
        Ok(())
    }
}
