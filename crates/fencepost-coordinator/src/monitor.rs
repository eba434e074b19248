// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion monitor.
//!
//! Polls in-flight attempts and finalizes those that are done: a completion
//! signal written by a worker wins, otherwise a ledger whose every batch is
//! counted ends the attempt as SUCCEEDED or PARTIALLY_SUCCEEDED. Terminal
//! writes are conditional, so a second tick or a racing validator never
//! finalizes an attempt twice.

use std::sync::Arc;
use std::time::Duration;

use fencepost_core::{AttemptRecord, AttemptStatus, WorkKind};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::backends::Backends;
use crate::context::LogContext;
use crate::error::Result;
use crate::fences::{CompletionSignal, ResourceFence};
use crate::resource_state::ResourceStateMachine;

/// Configuration for the completion monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Job kind to monitor.
    pub kind: WorkKind,
    /// How often to check in-flight attempts.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kind: WorkKind::Indexing,
            poll_interval: Duration::from_secs(15),
        }
    }
}

/// Attempts finalized by one monitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// In-flight attempts examined.
    pub checked: usize,
    /// Finalized as SUCCEEDED.
    pub succeeded: usize,
    /// Finalized as PARTIALLY_SUCCEEDED.
    pub partially_succeeded: usize,
    /// Finalized as FAILED.
    pub failed: usize,
    /// Finalized as CANCELED.
    pub canceled: usize,
}

impl MonitorSummary {
    fn record(&mut self, status: AttemptStatus) {
        match status {
            AttemptStatus::Succeeded => self.succeeded += 1,
            AttemptStatus::PartiallySucceeded => self.partially_succeeded += 1,
            AttemptStatus::Failed => self.failed += 1,
            AttemptStatus::Canceled => self.canceled += 1,
            AttemptStatus::NotStarted | AttemptStatus::InProgress => {}
        }
    }

    /// Attempts finalized in this pass.
    pub fn finalized(&self) -> usize {
        self.succeeded + self.partially_succeeded + self.failed + self.canceled
    }
}

/// Background worker that finalizes finished attempts.
pub struct CompletionMonitor {
    backends: Backends,
    state_machine: ResourceStateMachine,
    config: MonitorConfig,
    shutdown: Arc<Notify>,
}

impl CompletionMonitor {
    /// Create a new completion monitor.
    pub fn new(
        backends: Backends,
        state_machine: ResourceStateMachine,
        config: MonitorConfig,
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

    /// Run the monitor loop until shutdown.
    pub async fn run(&self) {
        info!(
            kind = %self.config.kind,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Completion monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(kind = %self.config.kind, "Completion monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check_completions().await {
                        error!(kind = %self.config.kind, error = %e, "Failed to check completions");
                    }
                }
            }
        }

        info!(kind = %self.config.kind, "Completion monitor stopped");
    }

    /// Finalize every in-flight attempt that is done.
    pub async fn check_completions(&self) -> Result<MonitorSummary> {
        let attempts = self
            .backends
            .persistence
            .list_active_attempts(self.config.kind)
            .await?;
        let mut summary = MonitorSummary::default();

        for attempt in &attempts {
            summary.checked += 1;
            let ctx = LogContext::for_attempt(attempt);
            match self.check_attempt(attempt, &ctx).await {
                Ok(Some(status)) => summary.record(status),
                Ok(None) => {}
                Err(e) => error!(ctx = %ctx, error = %e, "Failed to check attempt completion"),
            }
        }

        if summary.finalized() > 0 {
            info!(
                kind = %self.config.kind,
                succeeded = summary.succeeded,
                partially_succeeded = summary.partially_succeeded,
                failed = summary.failed,
                canceled = summary.canceled,
                "Monitor pass finalized attempts"
            );
        }
        Ok(summary)
    }

    async fn check_attempt(
        &self,
        attempt: &AttemptRecord,
        ctx: &LogContext,
    ) -> Result<Option<AttemptStatus>> {
        let fence = ResourceFence::new(&self.backends, attempt.kind, attempt.key);

        let (status, reason) = match fence.completion(attempt.attempt_id).await? {
            Some(CompletionSignal::Failed { reason }) => (AttemptStatus::Failed, Some(reason)),
            Some(CompletionSignal::Canceled) => (AttemptStatus::Canceled, None),
            None => {
                let Some(ledger) = self
                    .backends
                    .persistence
                    .get_coordination_status(attempt.attempt_id)
                    .await?
                else {
                    return Ok(None);
                };
                if !ledger.is_complete() {
                    debug!(
                        ctx = %ctx,
                        completed_batches = ledger.completed_batches,
                        total_batches = ?ledger.total_batches,
                        "Attempt still running"
                    );
                    return Ok(None);
                }
                if ledger.total_failures == 0 {
                    (AttemptStatus::Succeeded, None)
                } else {
                    (AttemptStatus::PartiallySucceeded, None)
                }
            }
        };

        let finalized = finalize_attempt(
            &self.backends,
            &self.state_machine,
            attempt,
            status,
            reason.as_deref(),
            ctx,
        )
        .await?;
        Ok(finalized.then_some(status))
    }
}

/// Move an attempt to a terminal status and clean up after it.
///
/// Only the caller whose conditional write succeeds clears the ledger row and
/// the fence and advances the resource state machine. Returns whether this
/// call finalized the attempt.
pub(crate) async fn finalize_attempt(
    backends: &Backends,
    state_machine: &ResourceStateMachine,
    attempt: &AttemptRecord,
    status: AttemptStatus,
    reason: Option<&str>,
    ctx: &LogContext,
) -> Result<bool> {
    let persistence = &backends.persistence;
    if !persistence
        .complete_attempt_if_active(attempt.attempt_id, status, reason)
        .await?
    {
        debug!(ctx = %ctx, "Attempt already finalized");
        return Ok(false);
    }

    persistence
        .delete_coordination_status(attempt.attempt_id)
        .await?;
    ResourceFence::new(backends, attempt.kind, attempt.key)
        .reset_if_owned(attempt.attempt_id)
        .await?;
    state_machine
        .on_attempt_finished(attempt, status, ctx)
        .await?;

    match reason {
        Some(reason) => info!(ctx = %ctx, status = %status, reason, "Attempt finalized"),
        None => info!(ctx = %ctx, status = %status, "Attempt finalized"),
    }
    Ok(true)
}
