// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fence and attempt validator (watchdog).
//!
//! Recovers from crashed workers and a flushed fence store. Each pass:
//!
//! 1. fails in-flight attempts that never got a task handle (under the
//!    dispatch lock, so a dispatcher between attempt creation and submit is
//!    never mistaken for a crash)
//! 2. fails attempts whose ledger has not advanced within the stall ceiling
//! 3. fails attempts whose tasks are gone, using a DB → task queue → DB
//!    double-check so a concurrent finish or dispatch is never misread
//! 4. clears fences whose attempt is missing or terminal
//!
//! Passes are rate-limited by a marker key whose TTL equals the interval and
//! serialized across processes by the validator lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fencepost_core::{AttemptRecord, AttemptStatus, WorkKind};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backends::Backends;
use crate::context::LogContext;
use crate::dispatcher::dispatch_lock_name;
use crate::error::{ErrorKind, Result};
use crate::fences::ResourceFence;
use crate::lock::HeldLock;
use crate::monitor::finalize_attempt;
use crate::resource_state::ResourceStateMachine;

/// Substring present in every orphan failure reason.
pub const ORPHAN_REASON: &str = "no associated tasks were found";

/// Configuration for the validator.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Job kind to validate.
    pub kind: WorkKind,
    /// How often to validate; also the TTL of the rate-limit marker.
    pub interval: Duration,
    /// Attempts whose ledger has not advanced for this long are failed.
    pub stall_timeout: Duration,
    /// TTL used when refreshing the active signal of a live attempt.
    pub active_signal_ttl: Duration,
    /// TTL of the validator lock.
    pub validator_lock_ttl: Duration,
    /// TTL of the dispatch lock taken for the inconsistent-attempt scan.
    pub dispatch_lock_ttl: Duration,
    /// How long to wait for the dispatch lock.
    pub dispatch_lock_wait: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            kind: WorkKind::Indexing,
            interval: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(3 * 60 * 60),
            active_signal_ttl: Duration::from_secs(300),
            validator_lock_ttl: Duration::from_secs(5 * 60),
            dispatch_lock_ttl: Duration::from_secs(30),
            dispatch_lock_wait: Duration::from_secs(5),
        }
    }
}

/// What one validation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    /// The pass did not run (rate-limited or another validator holds the lock).
    pub skipped: bool,
    /// Attempts run through the orphan double-check.
    pub checked: usize,
    /// Attempts failed as orphaned.
    pub orphaned: usize,
    /// Attempts failed for lacking a task handle.
    pub inconsistent: usize,
    /// Attempts failed as stalled.
    pub stalled: usize,
    /// Fences cleared because their attempt was missing or terminal.
    pub stale_fences_cleared: usize,
}

impl ValidationSummary {
    /// Attempts failed plus fences cleared.
    pub fn recovered(&self) -> usize {
        self.orphaned + self.inconsistent + self.stalled + self.stale_fences_cleared
    }
}

/// Background watchdog for fences and in-flight attempts.
pub struct Validator {
    backends: Backends,
    state_machine: ResourceStateMachine,
    config: ValidatorConfig,
    shutdown: Arc<Notify>,
}

impl Validator {
    /// Create a new validator.
    pub fn new(
        backends: Backends,
        state_machine: ResourceStateMachine,
        config: ValidatorConfig,
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

    /// Key of the "already ran recently" marker.
    pub fn rate_limit_key(&self) -> String {
        self.backends
            .keys
            .marker(&format!("validator:{}", self.config.kind.as_str()))
    }

    /// Run the validator loop until shutdown.
    pub async fn run(&self) {
        info!(
            kind = %self.config.kind,
            interval_secs = self.config.interval.as_secs(),
            stall_timeout_secs = self.config.stall_timeout.as_secs(),
            "Validator started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(kind = %self.config.kind, "Validator received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.validate().await {
                        error!(kind = %self.config.kind, error = %e, "Validation pass failed");
                    }
                }
            }
        }

        info!(kind = %self.config.kind, "Validator stopped");
    }

    /// Run one validation pass unless one ran within the last interval.
    pub async fn validate(&self) -> Result<ValidationSummary> {
        let kind = self.config.kind;
        let ctx = LogContext {
            kind: Some(kind),
            ..LogContext::default()
        };
        let store = self.backends.store.as_ref();
        let marker = self.rate_limit_key();

        if store.get_signal(&marker).await?.is_some() {
            debug!(ctx = %ctx, "Validator ran recently, skipping");
            return Ok(ValidationSummary {
                skipped: true,
                ..ValidationSummary::default()
            });
        }

        let lock_name = self.backends.keys.lock(&format!("validator:{}", kind.as_str()));
        let Some(lock) = HeldLock::acquire(
            store,
            &lock_name,
            self.config.validator_lock_ttl,
            Duration::ZERO,
        )
        .await?
        else {
            debug!(ctx = %ctx, "Another validator is running, skipping");
            return Ok(ValidationSummary {
                skipped: true,
                ..ValidationSummary::default()
            });
        };

        let result = match store
            .set_signal(&marker, "1", Some(self.config.interval))
            .await
        {
            Ok(()) => self.validate_locked(&ctx).await,
            Err(e) => Err(e.into()),
        };
        lock.release(&ctx).await;

        if let Ok(summary) = &result
            && summary.recovered() > 0
        {
            info!(
                ctx = %ctx,
                checked = summary.checked,
                orphaned = summary.orphaned,
                inconsistent = summary.inconsistent,
                stalled = summary.stalled,
                stale_fences_cleared = summary.stale_fences_cleared,
                "Validation pass recovered work"
            );
        }
        result
    }

    async fn validate_locked(&self, ctx: &LogContext) -> Result<ValidationSummary> {
        let mut summary = ValidationSummary::default();

        summary.inconsistent = self.fail_inconsistent_attempts(ctx).await?;

        let attempts = self
            .backends
            .persistence
            .list_active_attempts(self.config.kind)
            .await?;
        for attempt in &attempts {
            let Some(handle) = attempt.task_handle.as_deref() else {
                continue;
            };
            let attempt_ctx = LogContext::for_attempt(attempt);

            match self.fail_if_stalled(attempt, &attempt_ctx).await {
                Ok(true) => {
                    summary.stalled += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(ctx = %attempt_ctx, error = %e, "Stall check failed");
                    continue;
                }
            }

            summary.checked += 1;
            match self.fail_if_orphaned(attempt, handle, &attempt_ctx).await {
                Ok(true) => summary.orphaned += 1,
                Ok(false) => {}
                Err(e) => error!(ctx = %attempt_ctx, error = %e, "Orphan check failed"),
            }
        }

        summary.stale_fences_cleared = self.clear_stale_fences(ctx).await?;
        Ok(summary)
    }

    /// Fail in-flight attempts without a task handle, holding the dispatch lock.
    async fn fail_inconsistent_attempts(&self, ctx: &LogContext) -> Result<usize> {
        let lock_name = self
            .backends
            .keys
            .lock(&dispatch_lock_name(self.config.kind));
        let Some(lock) = HeldLock::acquire(
            self.backends.store.as_ref(),
            &lock_name,
            self.config.dispatch_lock_ttl,
            self.config.dispatch_lock_wait,
        )
        .await?
        else {
            debug!(ctx = %ctx, "Dispatch lock busy, skipping inconsistent-attempt scan");
            return Ok(0);
        };

        let result = self.fail_inconsistent_locked().await;
        lock.release(ctx).await;
        result
    }

    async fn fail_inconsistent_locked(&self) -> Result<usize> {
        let attempts = self
            .backends
            .persistence
            .list_active_attempts(self.config.kind)
            .await?;
        let mut failed = 0;
        for attempt in attempts.iter().filter(|a| a.task_handle.is_none()) {
            let ctx = LogContext::for_attempt(attempt);
            warn!(ctx = %ctx, status = %attempt.status, "Attempt has no task handle");
            let reason = "Attempt was never dispatched: no task handle was recorded";
            if finalize_attempt(
                &self.backends,
                &self.state_machine,
                attempt,
                AttemptStatus::Failed,
                Some(reason),
                &ctx,
            )
            .await?
            {
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn fail_if_stalled(&self, attempt: &AttemptRecord, ctx: &LogContext) -> Result<bool> {
        let Some(ledger) = self
            .backends
            .persistence
            .get_coordination_status(attempt.attempt_id)
            .await?
        else {
            return Ok(false);
        };

        let idle = Utc::now() - ledger.last_progress_at;
        let ceiling = chrono::Duration::from_std(self.config.stall_timeout)
            .unwrap_or(chrono::Duration::MAX);
        if idle <= ceiling {
            return Ok(false);
        }

        let reason = format!(
            "Attempt stalled: no batch completed for {}s (completed {} of {})",
            idle.num_seconds(),
            ledger.completed_batches,
            ledger
                .total_batches
                .map_or_else(|| "?".to_string(), |t| t.to_string()),
        );
        warn!(ctx = %ctx, error_kind = %ErrorKind::Stalled, reason = %reason, "Failing stalled attempt");
        finalize_attempt(
            &self.backends,
            &self.state_machine,
            attempt,
            AttemptStatus::Failed,
            Some(&reason),
            ctx,
        )
        .await
    }

    async fn any_queued(&self, handles: &[String]) -> Result<bool> {
        for h in handles {
            if self.backends.queue.is_queued(h).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// DB read → task queue check → DB re-read.
    async fn fail_if_orphaned(
        &self,
        attempt: &AttemptRecord,
        handle: &str,
        ctx: &LogContext,
    ) -> Result<bool> {
        let fence = ResourceFence::new(&self.backends, attempt.kind, attempt.key);
        let queue = &self.backends.queue;

        let mut handles = vec![handle.to_string()];
        handles.extend(fence.taskset().await?);

        // Pending, reserved, pending again: a task being reserved, or a lapsed
        // lease being requeued, is seen by one of the three reads.
        let mut found = self.any_queued(&handles).await?;
        if !found {
            let reserved = queue.reserved_handles().await?;
            found = handles.iter().any(|h| reserved.contains(h));
        }
        if !found {
            found = self.any_queued(&handles).await?;
        }
        if found {
            fence.set_active(self.config.active_signal_ttl).await?;
            return Ok(false);
        }

        if fence.is_active().await? {
            debug!(ctx = %ctx, "No task found but attempt is still marked active");
            return Ok(false);
        }

        let reread = self
            .backends
            .persistence
            .get_attempt(attempt.attempt_id)
            .await?;
        if reread.as_ref() != Some(attempt) {
            debug!(ctx = %ctx, "Attempt changed during orphan check");
            return Ok(false);
        }

        let state = queue.state(handle).await?;
        let reason = format!(
            "Attempt was orphaned: {ORPHAN_REASON} (task {handle} is {state}, {} batch tasks tracked)",
            handles.len() - 1
        );
        warn!(ctx = %ctx, error_kind = %ErrorKind::Orphaned, task_state = %state, "Failing orphaned attempt");
        finalize_attempt(
            &self.backends,
            &self.state_machine,
            attempt,
            AttemptStatus::Failed,
            Some(&reason),
            ctx,
        )
        .await
    }

    /// Clear fences whose attempt is missing or terminal.
    async fn clear_stale_fences(&self, ctx: &LogContext) -> Result<usize> {
        let kind = self.config.kind;
        let keys = &self.backends.keys;
        let fence_keys = self
            .backends
            .store
            .list_fences(&keys.fence_prefix(kind.fence_kind()))
            .await?;

        let mut cleared = 0;
        for fence_key in fence_keys {
            let Some(key) = keys.parse_fence_key(kind.fence_kind(), &fence_key) else {
                warn!(ctx = %ctx, fence = %fence_key, "Unparseable fence key");
                continue;
            };
            let fence = ResourceFence::new(&self.backends, kind, key);
            let Some(payload) = fence.payload().await? else {
                continue;
            };
            if payload.task_handle.is_none() {
                continue;
            }

            let attempt = self
                .backends
                .persistence
                .get_attempt(payload.attempt_id)
                .await?;
            if attempt.is_some_and(|a| a.is_active()) {
                continue;
            }
            if fence.reset_if_owned(payload.attempt_id).await? {
                let fence_ctx = LogContext::for_key(kind, key).with_attempt(payload.attempt_id);
                info!(ctx = %fence_ctx, "Cleared stale fence");
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
