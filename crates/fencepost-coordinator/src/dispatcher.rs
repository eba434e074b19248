// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work dispatcher.
//!
//! On every tick the dispatcher evaluates each (resource, active
//! configuration) pair and, when work is due, claims the pair:
//!
//! 1. take the global dispatch lock for the kind (short wait; busy = no-op)
//! 2. bail out if the pair is already fenced or a conflicting operation
//!    (deletion, pruning) is fenced on the resource
//! 3. clear signals left over from a previous run
//! 4. create a NOT_STARTED attempt (an in-flight attempt = no-op)
//! 5. submit the fetch task and persist its handle on the attempt
//! 6. write the fence with the handle
//! 7. release the lock
//!
//! A submit failure after step 4 leaves an attempt without a handle; the
//! validator fails it while holding the same dispatch lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fencepost_core::{CoreError, FenceKind, FencePayload, ResourceKey, WorkKind};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::backends::Backends;
use crate::context::LogContext;
use crate::error::Result;
use crate::fences::ResourceFence;
use crate::lock::HeldLock;
use crate::resource_state::{ResourceStateMachine, needs_work};
use crate::tasks::{FETCH_TASK, FetchTaskArgs};

/// Lock name (before keyspace prefixing) serializing dispatch for `kind`.
pub fn dispatch_lock_name(kind: WorkKind) -> String {
    format!("dispatch:{}", kind.as_str())
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Job kind this dispatcher creates attempts for.
    pub kind: WorkKind,
    /// How often to look for due work.
    pub poll_interval: Duration,
    /// TTL of the dispatch lock.
    pub dispatch_lock_ttl: Duration,
    /// How long to wait for the dispatch lock before giving up.
    pub dispatch_lock_wait: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            kind: WorkKind::Indexing,
            poll_interval: Duration::from_secs(15),
            dispatch_lock_ttl: Duration::from_secs(30),
            dispatch_lock_wait: Duration::from_secs(1),
        }
    }
}

/// Result of one `try_create_task` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new attempt was created and its fetch task submitted.
    Dispatched {
        /// New attempt.
        attempt_id: i64,
        /// Handle of the fetch task.
        task_handle: String,
    },
    /// Another dispatcher held the lock.
    LockBusy,
    /// The key is already fenced.
    AlreadyFenced,
    /// A conflicting operation is fenced on the resource.
    Conflict(FenceKind),
    /// The database already holds an in-flight attempt for the key.
    AttemptActive,
    /// The attempt was created but the task could not be submitted.
    SubmitFailed {
        /// Attempt left without a task handle.
        attempt_id: i64,
    },
}

/// Counters from one `check_for_work` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Pairs evaluated.
    pub evaluated: usize,
    /// Attempts dispatched.
    pub dispatched: usize,
    /// Due pairs that were not dispatched.
    pub skipped: usize,
    /// Pairs whose dispatch raised an error.
    pub failed: usize,
}

/// Background worker that creates attempts for due resources.
pub struct Dispatcher {
    backends: Backends,
    state_machine: ResourceStateMachine,
    config: DispatcherConfig,
    shutdown: Arc<Notify>,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(
        backends: Backends,
        state_machine: ResourceStateMachine,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            backends,
            state_machine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(&self) {
        info!(
            kind = %self.config.kind,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(kind = %self.config.kind, "Dispatcher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check_for_work().await {
                        error!(kind = %self.config.kind, error = %e, "Failed to check for work");
                    }
                }
            }
        }

        info!(kind = %self.config.kind, "Dispatcher stopped");
    }

    /// Dispatch every due (resource, active configuration) pair.
    pub async fn check_for_work(&self) -> Result<DispatchSummary> {
        let kind = self.config.kind;
        let persistence = &self.backends.persistence;
        let configurations = persistence.list_active_configurations().await?;
        let resources = persistence.list_resources().await?;
        let now = Utc::now();
        let mut summary = DispatchSummary::default();

        for resource in &resources {
            for &configuration_id in &configurations {
                summary.evaluated += 1;
                let key = ResourceKey::new(resource.resource_id, configuration_id);
                let ctx = LogContext::for_key(kind, key);

                let latest = persistence.latest_attempt(key, kind).await?;
                if !needs_work(self.state_machine.config(), resource, latest.as_ref(), now) {
                    continue;
                }

                match self.try_create_task(key).await {
                    Ok(DispatchOutcome::Dispatched { attempt_id, .. }) => {
                        summary.dispatched += 1;
                        let ctx = ctx.with_attempt(attempt_id);
                        if let Err(e) = self
                            .state_machine
                            .on_attempt_dispatched(kind, key.resource_id, &ctx)
                            .await
                        {
                            error!(ctx = %ctx, error = %e, "Failed to advance resource state");
                        }
                    }
                    Ok(outcome) => {
                        summary.skipped += 1;
                        debug!(ctx = %ctx, outcome = ?outcome, "Due work not dispatched");
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!(ctx = %ctx, error = %e, error_kind = %e.kind(), "Dispatch failed");
                    }
                }
            }
        }

        if summary.dispatched > 0 || summary.failed > 0 {
            info!(
                kind = %kind,
                evaluated = summary.evaluated,
                dispatched = summary.dispatched,
                skipped = summary.skipped,
                failed = summary.failed,
                "Dispatch pass finished"
            );
        }
        Ok(summary)
    }

    /// Claim `key` and submit its fetch task.
    pub async fn try_create_task(&self, key: ResourceKey) -> Result<DispatchOutcome> {
        let kind = self.config.kind;
        let ctx = LogContext::for_key(kind, key);
        let lock_name = self.backends.keys.lock(&dispatch_lock_name(kind));

        let Some(lock) = HeldLock::acquire(
            self.backends.store.as_ref(),
            &lock_name,
            self.config.dispatch_lock_ttl,
            self.config.dispatch_lock_wait,
        )
        .await?
        else {
            debug!(ctx = %ctx, "Dispatch lock busy");
            return Ok(DispatchOutcome::LockBusy);
        };

        let result = self.create_task_locked(key, &ctx).await;
        lock.release(&ctx).await;
        result
    }

    async fn create_task_locked(
        &self,
        key: ResourceKey,
        ctx: &LogContext,
    ) -> Result<DispatchOutcome> {
        let kind = self.config.kind;
        let fence = ResourceFence::new(&self.backends, kind, key);

        if fence.exists().await? {
            return Ok(DispatchOutcome::AlreadyFenced);
        }
        for &conflict in kind.conflicts() {
            if ResourceFence::of_kind(&self.backends, conflict, key)
                .exists()
                .await?
            {
                return Ok(DispatchOutcome::Conflict(conflict));
            }
        }

        fence.clear_signals().await?;

        let attempt = match self.backends.persistence.create_attempt(key, kind).await {
            Ok(attempt) => attempt,
            Err(CoreError::AttemptAlreadyActive { .. }) => {
                return Ok(DispatchOutcome::AttemptActive);
            }
            Err(e) => return Err(e.into()),
        };
        let attempt_id = attempt.attempt_id;
        let ctx = ctx.clone().with_attempt(attempt_id);

        let args = serde_json::to_value(FetchTaskArgs {
            attempt_id,
            kind,
            key,
        })?;
        let task_handle = match self.backends.queue.submit(FETCH_TASK, args).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(ctx = %ctx, error = %e, "Failed to submit fetch task");
                return Ok(DispatchOutcome::SubmitFailed { attempt_id });
            }
        };

        self.backends
            .persistence
            .set_attempt_task_handle(attempt_id, &task_handle)
            .await?;
        fence
            .set_payload(&FencePayload {
                attempt_id,
                task_handle: Some(task_handle.clone()),
                submitted_at: Utc::now(),
                started_at: None,
            })
            .await?;

        let ctx = ctx.with_task(task_handle.clone());
        info!(ctx = %ctx, "Attempt dispatched");
        Ok(DispatchOutcome::Dispatched {
            attempt_id,
            task_handle,
        })
    }
}
