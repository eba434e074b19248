// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task executor: reserves tasks from the task queue and runs fetch tasks
//! and batch workers. The task's lease is renewed while it runs. Task errors
//! are logged and reported to the queue; they never stop the loop.

use std::sync::Arc;
use std::time::Duration;

use fencepost_core::TaskMessage;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backends::Backends;
use crate::batch_worker::BatchWorker;
use crate::error::{CoordinationError, ErrorKind, Result};
use crate::producer::FetchTask;
use crate::tasks::Task;

/// Configuration for a task executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long one reserve call may block.
    pub reserve_timeout: Duration,
    /// Pause after an empty reserve or a queue error.
    pub idle_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            reserve_timeout: Duration::from_secs(1),
            idle_interval: Duration::from_millis(500),
        }
    }
}

/// Worker loop running fetch and batch tasks.
pub struct TaskExecutor {
    backends: Backends,
    fetch: Arc<FetchTask>,
    batch: Arc<BatchWorker>,
    config: ExecutorConfig,
    shutdown: Arc<Notify>,
}

impl TaskExecutor {
    /// Create a task executor.
    pub fn new(
        backends: Backends,
        fetch: Arc<FetchTask>,
        batch: Arc<BatchWorker>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            backends,
            fetch,
            batch,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown. A task in progress is finished before exiting.
    pub async fn run(&self) {
        info!("Task executor started");

        loop {
            let reserved = tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                reserved = self.backends.queue.reserve(self.config.reserve_timeout) => reserved,
            };

            let idle = match reserved {
                Ok(Some(message)) => {
                    self.execute(message).await;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "Failed to reserve task");
                    true
                }
            };

            if idle {
                tokio::select! {
                    biased;

                    _ = self.shutdown.notified() => break,

                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                }
            }
        }

        info!("Task executor stopped");
    }

    /// Reserve and run at most one task. Returns whether a task was run.
    pub async fn run_once(&self) -> Result<bool> {
        match self
            .backends
            .queue
            .reserve(self.config.reserve_timeout)
            .await?
        {
            Some(message) => {
                self.execute(message).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn execute(&self, message: TaskMessage) {
        let handle = message.handle.clone();
        if let Err(e) = self.backends.queue.start(&handle).await {
            warn!(task = %handle, error = %e, "Failed to mark task started");
        }

        let task = self.run_task(&message);
        tokio::pin!(task);
        let mut renew = tokio::time::interval(self.lease_renew_interval());
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;
        let result = loop {
            tokio::select! {
                result = &mut task => break result,
                _ = renew.tick() => self.renew_lease(&handle).await,
            }
        };

        let success = match result {
            Ok(()) => true,
            Err(CoordinationError::BatchLockLost { .. }) => {
                warn!(task = %handle, "Batch abandoned, leaving task for redelivery");
                return;
            }
            Err(e) => {
                log_task_error(&handle, &message.task_type, &e);
                false
            }
        };

        if let Err(e) = self.backends.queue.complete(&handle, success).await {
            error!(task = %handle, error = %e, "Failed to complete task");
        }
    }

    async fn run_task(&self, message: &TaskMessage) -> Result<()> {
        let handle = &message.handle;
        match Task::decode(message)? {
            Task::Fetch(args) => {
                let outcome = self.fetch.run(handle, &args).await?;
                debug!(task = %handle, outcome = ?outcome, "Fetch task done");
            }
            Task::Batch(args) => {
                let report = self.batch.run(&args).await?;
                debug!(task = %handle, counted = report.counted(), "Batch task done");
            }
        }
        Ok(())
    }

    /// A third of the lease, at least 1ms.
    fn lease_renew_interval(&self) -> Duration {
        (self.backends.queue.lease_duration() / 3).max(Duration::from_millis(1))
    }

    async fn renew_lease(&self, handle: &str) {
        match self.backends.queue.renew_lease(handle).await {
            Ok(true) => debug!(task = %handle, "Task lease renewed"),
            Ok(false) => warn!(task = %handle, "Task lease lost, the task may be redelivered"),
            Err(e) => warn!(task = %handle, error = %e, "Failed to renew task lease"),
        }
    }
}

fn log_task_error(handle: &str, task_type: &str, err: &CoordinationError) {
    let kind = err.kind();
    match (kind, err) {
        (_, CoordinationError::Canceled { .. }) => {
            info!(task = %handle, task_type, error = %err, "Task canceled");
        }
        (_, CoordinationError::AlreadyRunning { .. }) | (ErrorKind::Transient, _) => {
            warn!(task = %handle, task_type, error_kind = %kind, error = %err, "Task failed");
        }
        _ => {
            error!(task = %handle, task_type, error_kind = %kind, error = %err, "Task failed");
        }
    }
}
