// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetch (producer) task.
//!
//! The dispatcher submits the task before it writes the fence, so the task
//! first waits until the fence carries its own handle. It then marks the
//! attempt in progress, pulls pages from the [`DocumentSource`], submits one
//! batch task per page and finally records the total batch count so the
//! completion monitor can tell when the attempt is done.
//!
//! A redelivered fetch task resumes from the taskset: pages whose batch was
//! already submitted are skipped, so every batch number maps to one task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fencepost_core::{CoreError, FencePayload};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backends::Backends;
use crate::context::LogContext;
use crate::error::{CoordinationError, Result};
use crate::fences::{CompletionSignal, ResourceFence};
use crate::pipeline::DocumentSource;
use crate::tasks::{BATCH_TASK, BatchTaskArgs, FetchTaskArgs};

/// Configuration for the fetch task.
#[derive(Debug, Clone)]
pub struct FetchTaskConfig {
    /// How long to wait for the dispatcher to finish writing the fence.
    pub fence_ready_timeout: Duration,
    /// Poll interval while waiting for the fence.
    pub fence_poll_interval: Duration,
    /// TTL of the active signal refreshed while enumerating.
    pub active_signal_ttl: Duration,
}

impl Default for FetchTaskConfig {
    fn default() -> Self {
        Self {
            fence_ready_timeout: Duration::from_secs(60),
            fence_poll_interval: Duration::from_millis(500),
            active_signal_ttl: Duration::from_secs(300),
        }
    }
}

/// How a fetch task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every batch was submitted.
    Enumerated {
        /// Number of batch tasks submitted.
        total_batches: i64,
    },
    /// The attempt was already terminal; nothing was done.
    AlreadyFinished,
    /// A stop signal was observed before enumeration finished.
    Canceled,
}

/// Runs fetch tasks.
pub struct FetchTask {
    backends: Backends,
    source: Arc<dyn DocumentSource>,
    config: FetchTaskConfig,
}

impl FetchTask {
    /// Create a fetch task runner.
    pub fn new(backends: Backends, source: Arc<dyn DocumentSource>, config: FetchTaskConfig) -> Self {
        Self {
            backends,
            source,
            config,
        }
    }

    /// Run the fetch task with handle `task_handle`.
    pub async fn run(&self, task_handle: &str, args: &FetchTaskArgs) -> Result<FetchOutcome> {
        let ctx = LogContext::for_key(args.kind, args.key)
            .with_attempt(args.attempt_id)
            .with_task(task_handle);
        let fence = ResourceFence::new(&self.backends, args.kind, args.key);

        let mut payload = self.wait_for_fence(&fence, task_handle, args, &ctx).await?;

        let persistence = &self.backends.persistence;
        let attempt = persistence
            .get_attempt(args.attempt_id)
            .await?
            .ok_or(CoreError::AttemptNotFound {
                attempt_id: args.attempt_id,
            })?;
        if !persistence.mark_attempt_in_progress(args.attempt_id).await? {
            info!(ctx = %ctx, "Attempt already finished, skipping fetch");
            return Ok(FetchOutcome::AlreadyFinished);
        }

        payload.started_at = Some(Utc::now());
        fence.set_payload(&payload).await?;
        fence.set_active(self.config.active_signal_ttl).await?;
        info!(ctx = %ctx, "Fetch task started");

        let mut handles = fence.taskset().await?;
        if !handles.is_empty() {
            info!(ctx = %ctx, already_submitted = handles.len(), "Resuming redelivered fetch task");
        }
        let mut batch_num: i64 = 0;
        let mut page: i64 = 0;
        loop {
            if fence.should_stop(args.attempt_id).await? {
                if fence.completion(args.attempt_id).await?.is_none()
                    && self.attempt_active(args.attempt_id).await?
                {
                    fence
                        .set_completion(args.attempt_id, &CompletionSignal::Canceled)
                        .await?;
                }
                info!(ctx = %ctx, batches_submitted = batch_num, "Fetch task stopped");
                return Ok(FetchOutcome::Canceled);
            }

            let documents = match self.source.fetch_page(&attempt, page).await {
                Ok(Some(documents)) => documents,
                Ok(None) => break,
                Err(e) => {
                    if self.attempt_active(args.attempt_id).await? {
                        fence
                            .set_completion(
                                args.attempt_id,
                                &CompletionSignal::Failed {
                                    reason: format!("Document source failed: {e}"),
                                },
                            )
                            .await?;
                    }
                    return Err(e.into());
                }
            };
            page += 1;
            if documents.is_empty() {
                continue;
            }
            if usize::try_from(batch_num).is_ok_and(|n| n < handles.len()) {
                debug!(ctx = %ctx, batch = batch_num, "Batch already submitted");
                batch_num += 1;
                continue;
            }

            let args = serde_json::to_value(BatchTaskArgs {
                attempt_id: args.attempt_id,
                kind: args.kind,
                key: args.key,
                batch_num,
                documents,
            })?;
            let handle = self.backends.queue.submit(BATCH_TASK, args).await?;
            debug!(ctx = %ctx, batch = batch_num, batch_task = %handle, "Batch submitted");
            handles.push(handle);
            fence.set_taskset(&handles).await?;
            fence.set_active(self.config.active_signal_ttl).await?;
            batch_num += 1;
        }

        if !persistence
            .set_total_batches(args.attempt_id, batch_num)
            .await?
        {
            warn!(ctx = %ctx, total_batches = batch_num, "Could not record total batches");
        }
        info!(ctx = %ctx, total_batches = batch_num, "Fetch task finished");
        Ok(FetchOutcome::Enumerated {
            total_batches: batch_num,
        })
    }

    async fn attempt_active(&self, attempt_id: i64) -> Result<bool> {
        let attempt = self.backends.persistence.get_attempt(attempt_id).await?;
        Ok(attempt.is_some_and(|a| a.is_active()))
    }

    async fn wait_for_fence(
        &self,
        fence: &ResourceFence<'_>,
        task_handle: &str,
        args: &FetchTaskArgs,
        ctx: &LogContext,
    ) -> Result<FencePayload> {
        let started = Instant::now();
        loop {
            if let Some(payload) = fence.payload().await?
                && payload.attempt_id == args.attempt_id
                && payload.task_handle.as_deref() == Some(task_handle)
            {
                return Ok(payload);
            }

            let waited = started.elapsed();
            if waited >= self.config.fence_ready_timeout {
                warn!(ctx = %ctx, waited_secs = waited.as_secs(), "Fence never became ready");
                return Err(CoordinationError::FenceNotReady {
                    attempt_id: args.attempt_id,
                    waited_secs: waited.as_secs(),
                });
            }
            tokio::time::sleep(self.config.fence_poll_interval).await;
        }
    }
}
