// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch worker.
//!
//! Claims one batch with a per-batch lock, runs it through the
//! [`DocumentPipeline`] and then, under a short per-attempt ledger lock,
//! counts the batch once and reconciles document errors. Too many document
//! failures trip a circuit breaker that aborts the whole attempt.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fencepost_core::{BatchProgress, CoordinationStatus};
use tracing::{debug, error, info, warn};

use crate::backends::Backends;
use crate::context::LogContext;
use crate::error::{CoordinationError, Result};
use crate::fences::{CompletionSignal, ResourceFence};
use crate::lock::HeldLock;
use crate::pipeline::{BatchOutcome, Checkpoint, DocumentBatch, DocumentPipeline};
use crate::tasks::BatchTaskArgs;

/// Configuration for batch workers.
#[derive(Debug, Clone)]
pub struct BatchWorkerConfig {
    /// TTL of the per-batch lock; renewed at every checkpoint.
    pub batch_lock_ttl: Duration,
    /// TTL of the per-attempt ledger lock.
    pub ledger_lock_ttl: Duration,
    /// How long to wait for the ledger lock.
    pub ledger_lock_wait: Duration,
    /// TTL of the active signal refreshed at every checkpoint.
    pub active_signal_ttl: Duration,
    /// Failure count that must be exceeded before the breaker can trip.
    pub max_failures: i64,
    /// Failures per processed document that must be exceeded as well.
    pub max_failure_ratio: f64,
}

impl Default for BatchWorkerConfig {
    fn default() -> Self {
        Self {
            batch_lock_ttl: Duration::from_secs(5 * 60),
            ledger_lock_ttl: Duration::from_secs(30),
            ledger_lock_wait: Duration::from_secs(10),
            active_signal_ttl: Duration::from_secs(300),
            max_failures: 3,
            max_failure_ratio: 0.10,
        }
    }
}

impl BatchWorkerConfig {
    /// Whether cumulative counters trip the circuit breaker.
    pub fn threshold_breached(&self, status: &CoordinationStatus) -> bool {
        let ratio = status.total_failures as f64 / status.total_docs_indexed.max(1) as f64;
        status.total_failures > self.max_failures && ratio > self.max_failure_ratio
    }
}

/// Result of a batch that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// Attempt the batch belongs to.
    pub attempt_id: i64,
    /// Batch number.
    pub batch_num: i64,
    /// Ledger after this batch, or None if it was not counted (redelivery or
    /// the attempt already finished).
    pub status: Option<CoordinationStatus>,
}

impl BatchReport {
    /// Whether this run advanced the ledger.
    pub fn counted(&self) -> bool {
        self.status.is_some()
    }
}

/// Checkpoint that renews the batch lock, refreshes the active signal and
/// checks the stop signal of its own attempt.
struct BatchCheckpoint<'a> {
    lock: &'a HeldLock<'a>,
    fence: &'a ResourceFence<'a>,
    attempt_id: i64,
    active_signal_ttl: Duration,
    ctx: &'a LogContext,
    stopped: AtomicBool,
    lock_lost: AtomicBool,
}

impl BatchCheckpoint<'_> {
    /// A stop was requested for the attempt.
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The batch lock expired under us; another worker may own the batch now.
    fn lock_lost(&self) -> bool {
        self.lock_lost.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Checkpoint for BatchCheckpoint<'_> {
    async fn should_stop(&self) -> bool {
        if self.stopped() || self.lock_lost() {
            return true;
        }

        match self.lock.reacquire().await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    ctx = %self.ctx,
                    "Batch lock expired before renewal, abandoning batch; check the batch lock TTL"
                );
                self.lock_lost.store(true, Ordering::SeqCst);
                return true;
            }
            Err(e) => warn!(ctx = %self.ctx, error = %e, "Failed to renew batch lock"),
        }

        if let Err(e) = self.fence.set_active(self.active_signal_ttl).await {
            warn!(ctx = %self.ctx, error = %e, "Failed to refresh active signal");
        }

        match self.fence.should_stop(self.attempt_id).await {
            Ok(true) => {
                info!(ctx = %self.ctx, "Stop signal observed");
                self.stopped.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(ctx = %self.ctx, error = %e, "Failed to read stop signal");
                false
            }
        }
    }
}

/// Runs batch tasks.
pub struct BatchWorker {
    backends: Backends,
    pipeline: Arc<dyn DocumentPipeline>,
    config: BatchWorkerConfig,
}

impl BatchWorker {
    /// Create a batch worker.
    pub fn new(
        backends: Backends,
        pipeline: Arc<dyn DocumentPipeline>,
        config: BatchWorkerConfig,
    ) -> Self {
        Self {
            backends,
            pipeline,
            config,
        }
    }

    /// Process one batch.
    ///
    /// Fails with [`CoordinationError::AlreadyRunning`] when another worker
    /// holds the batch, [`CoordinationError::BatchLockLost`] when the batch
    /// lock expired mid-run, [`CoordinationError::Canceled`] when a stop was
    /// observed and [`CoordinationError::ThresholdBreach`] when this batch
    /// pushed the attempt over the failure threshold.
    ///
    /// Completion and stop signals are only written while the attempt is
    /// still active, so a late batch never touches a newer attempt.
    pub async fn run(&self, args: &BatchTaskArgs) -> Result<BatchReport> {
        let ctx = LogContext::for_key(args.kind, args.key)
            .with_attempt(args.attempt_id)
            .with_batch(args.batch_num);
        let lock_name = self
            .backends
            .keys
            .lock(&format!("batch:{}:{}", args.attempt_id, args.batch_num));

        let Some(lock) = HeldLock::acquire(
            self.backends.store.as_ref(),
            &lock_name,
            self.config.batch_lock_ttl,
            Duration::ZERO,
        )
        .await?
        else {
            warn!(ctx = %ctx, "Batch is already running elsewhere");
            return Err(CoordinationError::AlreadyRunning {
                attempt_id: args.attempt_id,
                batch_num: args.batch_num,
            });
        };

        let result = self.run_locked(&lock, args, &ctx).await;
        lock.release(&ctx).await;
        result
    }

    async fn run_locked(
        &self,
        lock: &HeldLock<'_>,
        args: &BatchTaskArgs,
        ctx: &LogContext,
    ) -> Result<BatchReport> {
        let skipped = BatchReport {
            attempt_id: args.attempt_id,
            batch_num: args.batch_num,
            status: None,
        };

        if !self.attempt_active(args.attempt_id).await? {
            info!(ctx = %ctx, "Attempt already finished, skipping batch");
            return Ok(skipped);
        }

        let fence = ResourceFence::new(&self.backends, args.kind, args.key);
        let checkpoint = BatchCheckpoint {
            lock,
            fence: &fence,
            attempt_id: args.attempt_id,
            active_signal_ttl: self.config.active_signal_ttl,
            ctx,
            stopped: AtomicBool::new(false),
            lock_lost: AtomicBool::new(false),
        };

        let batch = DocumentBatch {
            batch_num: args.batch_num,
            documents: args.documents.clone(),
        };

        let outcome = if checkpoint.should_stop().await {
            BatchOutcome::default()
        } else {
            match self.pipeline.process(&batch, &checkpoint).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(ctx = %ctx, error = %e, "Batch processing failed");
                    if checkpoint.lock_lost() {
                        return Err(self.lock_lost(args));
                    }
                    if self.attempt_active(args.attempt_id).await? {
                        fence
                            .set_completion(
                                args.attempt_id,
                                &CompletionSignal::Failed {
                                    reason: format!("Batch {} failed: {}", args.batch_num, e),
                                },
                            )
                            .await?;
                    } else {
                        info!(ctx = %ctx, "Attempt finished meanwhile, not signaling failure");
                    }
                    return Err(e.into());
                }
            }
        };

        if checkpoint.lock_lost() {
            return Err(self.lock_lost(args));
        }

        if checkpoint.stopped() {
            if fence.completion(args.attempt_id).await?.is_none()
                && self.attempt_active(args.attempt_id).await?
            {
                fence
                    .set_completion(args.attempt_id, &CompletionSignal::Canceled)
                    .await?;
            }
            return Err(CoordinationError::Canceled {
                attempt_id: args.attempt_id,
            });
        }

        let Some(status) = self.update_ledger(&batch, &outcome, args, ctx).await? else {
            debug!(ctx = %ctx, "Batch already counted");
            return Ok(skipped);
        };

        if !outcome.failures.is_empty() && self.config.threshold_breached(&status) {
            let reason = outcome
                .failures
                .iter()
                .rev()
                .find_map(|f| f.cause.clone())
                .unwrap_or_else(|| {
                    format!(
                        "Connector run failed with '{}' errors after '{}' batches.",
                        status.total_failures, status.completed_batches
                    )
                });
            error!(
                ctx = %ctx,
                total_failures = status.total_failures,
                total_docs = status.total_docs_indexed,
                "Failure threshold exceeded, aborting attempt"
            );
            if self.attempt_active(args.attempt_id).await? {
                fence
                    .set_completion(
                        args.attempt_id,
                        &CompletionSignal::Failed {
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                fence.request_stop(args.attempt_id).await?;
            }
            return Err(CoordinationError::ThresholdBreach(reason));
        }

        fence.set_active(self.config.active_signal_ttl).await?;
        info!(
            ctx = %ctx,
            docs = outcome.total_docs,
            failures = outcome.failures.len(),
            completed_batches = status.completed_batches,
            "Batch finished"
        );
        Ok(BatchReport {
            attempt_id: args.attempt_id,
            batch_num: args.batch_num,
            status: Some(status),
        })
    }

    async fn attempt_active(&self, attempt_id: i64) -> Result<bool> {
        let attempt = self.backends.persistence.get_attempt(attempt_id).await?;
        Ok(attempt.is_some_and(|a| a.is_active()))
    }

    fn lock_lost(&self, args: &BatchTaskArgs) -> CoordinationError {
        CoordinationError::BatchLockLost {
            attempt_id: args.attempt_id,
            batch_num: args.batch_num,
        }
    }

    /// Count the batch and reconcile document errors under the ledger lock.
    async fn update_ledger(
        &self,
        batch: &DocumentBatch,
        outcome: &BatchOutcome,
        args: &BatchTaskArgs,
        ctx: &LogContext,
    ) -> Result<Option<CoordinationStatus>> {
        let lock_name = self
            .backends
            .keys
            .lock(&format!("ledger:{}", args.attempt_id));
        let Some(lock) = HeldLock::acquire(
            self.backends.store.as_ref(),
            &lock_name,
            self.config.ledger_lock_ttl,
            self.config.ledger_lock_wait,
        )
        .await?
        else {
            return Err(CoordinationError::LockTimeout { name: lock_name });
        };

        let result = self.record(batch, outcome, args).await;
        lock.release(ctx).await;
        result
    }

    async fn record(
        &self,
        batch: &DocumentBatch,
        outcome: &BatchOutcome,
        args: &BatchTaskArgs,
    ) -> Result<Option<CoordinationStatus>> {
        let persistence = &self.backends.persistence;
        let progress = BatchProgress {
            docs_indexed: outcome.total_docs,
            new_docs: outcome.new_docs,
            chunks: outcome.total_chunks,
            failures: outcome.failures.len() as i64,
        };
        let Some(status) = persistence
            .record_batch_progress(args.attempt_id, args.batch_num, &progress)
            .await?
        else {
            return Ok(None);
        };

        let failed: HashSet<&str> = outcome
            .failures
            .iter()
            .filter_map(|f| f.document_id.as_deref())
            .collect();
        let succeeded: Vec<String> = batch
            .documents
            .iter()
            .filter(|d| !failed.contains(d.id.as_str()))
            .map(|d| d.id.clone())
            .collect();
        if !succeeded.is_empty() {
            persistence
                .resolve_document_errors(args.key, &succeeded)
                .await?;
        }
        if !outcome.failures.is_empty() {
            persistence
                .record_document_errors(args.attempt_id, args.key, &outcome.failures)
                .await?;
        }
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn status(docs: i64, failures: i64) -> CoordinationStatus {
        CoordinationStatus {
            attempt_id: 1,
            completed_batches: 1,
            total_batches: None,
            total_docs_indexed: docs,
            new_docs_indexed: docs,
            total_chunks: docs,
            total_failures: failures,
            last_progress_at: Utc::now(),
        }
    }

    #[test]
    fn test_threshold() {
        let config = BatchWorkerConfig::default();
        assert!(config.threshold_breached(&status(30, 4)));
        assert!(!config.threshold_breached(&status(30, 3)));
        assert!(!config.threshold_breached(&status(100, 10)));
        assert!(config.threshold_breached(&status(0, 4)));
    }
}
