// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the validator: orphaned, inconsistent and stalled
//! attempts, stale fences and rate limiting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use fencepost_core::persistence::Persistence;
use fencepost_core::queue::MockTaskQueue;
use fencepost_core::{
    AttemptStatus, FencePayload, FenceStore, ResourceKey, Signal, StoreError, TaskMessage,
    TaskQueue, TaskState, WorkKind,
};

use fencepost_coordinator::backends::Backends;
use fencepost_coordinator::dispatcher::{DispatchOutcome, dispatch_lock_name};
use fencepost_coordinator::pipeline::CountingPipeline;
use fencepost_coordinator::validator::{
    ORPHAN_REASON, ValidationSummary, Validator, ValidatorConfig,
};

async fn dispatched(h: &Harness, resource_id: i64) -> (ResourceKey, i64, String) {
    let key = h.register_key(resource_id).await;
    let DispatchOutcome::Dispatched {
        attempt_id,
        task_handle,
    } = h.dispatcher().try_create_task(key).await.unwrap()
    else {
        panic!("dispatch failed");
    };
    (key, attempt_id, task_handle)
}

/// Queue that starts an attempt while the validator is looking at the
/// reservation set, as a fetch task picked up at that moment would.
struct StartsAttemptOnLookup {
    inner: Arc<MockTaskQueue>,
    persistence: Arc<dyn Persistence>,
    attempt_id: i64,
}

#[async_trait]
impl TaskQueue for StartsAttemptOnLookup {
    async fn submit(
        &self,
        task_type: &str,
        args: serde_json::Value,
    ) -> Result<String, StoreError> {
        self.inner.submit(task_type, args).await
    }

    async fn state(&self, handle: &str) -> Result<TaskState, StoreError> {
        self.inner.state(handle).await
    }

    async fn is_queued(&self, handle: &str) -> Result<bool, StoreError> {
        self.inner.is_queued(handle).await
    }

    async fn reserved_handles(&self) -> Result<Vec<String>, StoreError> {
        self.persistence
            .mark_attempt_in_progress(self.attempt_id)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        self.inner.reserved_handles().await
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<TaskMessage>, StoreError> {
        self.inner.reserve(timeout).await
    }

    fn lease_duration(&self) -> Duration {
        self.inner.lease_duration()
    }

    async fn renew_lease(&self, handle: &str) -> Result<bool, StoreError> {
        self.inner.renew_lease(handle).await
    }

    async fn start(&self, handle: &str) -> Result<(), StoreError> {
        self.inner.start(handle).await
    }

    async fn complete(&self, handle: &str, success: bool) -> Result<(), StoreError> {
        self.inner.complete(handle, success).await
    }
}

/// Run another pass as if the rate-limit interval had elapsed.
async fn validate_again(h: &Harness, validator: &Validator) -> ValidationSummary {
    h.store
        .clear_signal(&validator.rate_limit_key())
        .await
        .unwrap();
    validator.validate().await.unwrap()
}

#[tokio::test]
async fn test_lost_fetch_task_is_failed_as_orphaned() {
    let h = Harness::new().await;
    let (key, attempt_id, handle) = dispatched(&h, 1).await;
    h.queue.drop_task(&handle).await;

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.orphaned, 1);
    assert_eq!(summary.recovered(), 1);

    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    let reason = attempt.failure_reason.unwrap();
    assert!(reason.contains(ORPHAN_REASON), "reason: {reason}");
    assert!(reason.contains(&handle), "reason: {reason}");

    // The key is free for the next dispatch.
    assert!(!h.fence(key).exists().await.unwrap());
    assert!(matches!(
        h.dispatcher().try_create_task(key).await.unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));
}

#[tokio::test]
async fn test_queued_task_is_not_orphaned() {
    let h = Harness::new().await;
    let (key, attempt_id, _) = dispatched(&h, 1).await;

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.orphaned, 0);

    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert!(attempt.is_active());
    // Finding the task refreshes liveness.
    assert!(h.fence(key).is_active().await.unwrap());
}

#[tokio::test]
async fn test_reserved_task_is_not_orphaned() {
    let h = Harness::new().await;
    let (_, attempt_id, handle) = dispatched(&h, 1).await;

    let reserved = h.queue.reserve(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(reserved.handle, handle);

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.orphaned, 0);
    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert!(attempt.is_active());
}

#[tokio::test]
async fn test_pending_batch_tasks_keep_attempt_alive() {
    let h = Harness::new().await;
    let (key, attempt_id, _) = dispatched(&h, 1).await;
    let executor = h.executor(
        Arc::new(PagedSource::new(vec![docs("a", 2), docs("b", 2)])),
        Arc::new(CountingPipeline),
    );

    // Run only the fetch task; its handle is now terminal.
    assert!(executor.run_once().await.unwrap());
    let batches = h.fence(key).taskset().await.unwrap();
    assert_eq!(batches.len(), 2);
    h.store
        .clear_signal(&h.signal_key(Signal::Active, key))
        .await
        .unwrap();

    let validator = h.validator();
    assert_eq!(validator.validate().await.unwrap().orphaned, 0);

    // Batch tasks lost as well: the attempt is orphaned once liveness lapses.
    for batch in &batches {
        h.queue.drop_task(batch).await;
    }
    h.store
        .clear_signal(&h.signal_key(Signal::Active, key))
        .await
        .unwrap();
    let summary = validate_again(&h, &validator).await;
    assert_eq!(summary.orphaned, 1);

    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert!(
        attempt
            .failure_reason
            .unwrap()
            .contains("2 batch tasks tracked")
    );
}

#[tokio::test]
async fn test_active_signal_protects_attempt_without_tasks() {
    let h = Harness::new().await;
    let (key, attempt_id, handle) = dispatched(&h, 1).await;
    h.queue.drop_task(&handle).await;
    h.fence(key).set_active(Duration::from_secs(300)).await.unwrap();

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.orphaned, 0);
    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert!(attempt.is_active());
}

#[tokio::test]
async fn test_expired_active_signal_no_longer_protects() {
    let h = Harness::new().await;
    let (key, attempt_id, handle) = dispatched(&h, 1).await;
    h.queue.drop_task(&handle).await;
    h.fence(key).set_active(Duration::from_millis(20)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.validator().validate().await.unwrap().orphaned, 1);
    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
}

#[tokio::test]
async fn test_attempt_without_handle_is_failed() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    h.queue.fail_next_submit();
    let DispatchOutcome::SubmitFailed { attempt_id } =
        h.dispatcher().try_create_task(key).await.unwrap()
    else {
        panic!("expected submit failure");
    };

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.inconsistent, 1);

    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert!(attempt.failure_reason.unwrap().contains("no task handle"));
}

#[tokio::test]
async fn test_inconsistent_scan_waits_for_dispatch_lock() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let attempt = h
        .persistence()
        .create_attempt(key, WorkKind::Indexing)
        .await
        .unwrap();

    // A dispatcher mid-claim holds the lock; its attempt has no handle yet.
    let lock = h.backends.keys.lock(&dispatch_lock_name(WorkKind::Indexing));
    h.store
        .acquire_lock(&lock, Duration::from_secs(30), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let validator = h.validator_with(ValidatorConfig {
        dispatch_lock_wait: Duration::from_millis(50),
        ..ValidatorConfig::default()
    });
    let summary = validator.validate().await.unwrap();
    assert_eq!(summary.inconsistent, 0);

    let stored = h
        .persistence()
        .get_attempt(attempt.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_active());
}

#[tokio::test]
async fn test_stalled_attempt_is_failed() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let attempt = h.started_attempt(key).await;
    h.fence(key).set_active(Duration::from_secs(300)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let validator = h.validator_with(ValidatorConfig {
        stall_timeout: Duration::ZERO,
        ..ValidatorConfig::default()
    });
    let summary = validator.validate().await.unwrap();
    assert_eq!(summary.stalled, 1);
    assert_eq!(summary.orphaned, 0);

    let stored = h
        .persistence()
        .get_attempt(attempt.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, AttemptStatus::Failed);
    let reason = stored.failure_reason.unwrap();
    assert!(reason.starts_with("Attempt stalled"), "reason: {reason}");
    assert!(reason.contains("completed 0 of ?"), "reason: {reason}");
    assert!(!h.fence(key).exists().await.unwrap());
}

#[tokio::test]
async fn test_progressing_attempt_is_not_stalled() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let attempt = h.started_attempt(key).await;
    h.fence(key).set_active(Duration::from_secs(300)).await.unwrap();

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.stalled, 0);
    let stored = h
        .persistence()
        .get_attempt(attempt.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_active());
}

#[tokio::test]
async fn test_stale_fence_is_cleared() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let attempt = h.started_attempt(key).await;
    // Finalized without cleaning up, as after a crash mid-finalize.
    h.persistence()
        .complete_attempt_if_active(attempt.attempt_id, AttemptStatus::Succeeded, None)
        .await
        .unwrap();
    h.fence(key).request_stop(attempt.attempt_id).await.unwrap();

    // A fence for an attempt that never existed.
    let ghost = h.register_key(2).await;
    h.fence(ghost)
        .set_payload(&FencePayload {
            attempt_id: 424242,
            task_handle: Some("ghost-task".to_string()),
            submitted_at: Utc::now(),
            started_at: None,
        })
        .await
        .unwrap();

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.stale_fences_cleared, 2);
    assert!(!h.fence(key).exists().await.unwrap());
    assert!(!h.fence(key).should_stop(attempt.attempt_id).await.unwrap());
    assert!(!h.fence(ghost).exists().await.unwrap());
}

#[tokio::test]
async fn test_fence_without_handle_is_not_stale() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    h.fence(key)
        .set_payload(&FencePayload {
            attempt_id: 7,
            task_handle: None,
            submitted_at: Utc::now(),
            started_at: None,
        })
        .await
        .unwrap();

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.stale_fences_cleared, 0);
    assert!(h.fence(key).exists().await.unwrap());
}

#[tokio::test]
async fn test_validator_is_rate_limited() {
    let h = Harness::new().await;
    let (key, _, handle) = dispatched(&h, 1).await;
    let validator = h.validator();

    let first = validator.validate().await.unwrap();
    assert!(!first.skipped);
    assert_eq!(first.orphaned, 0);

    h.queue.drop_task(&handle).await;
    h.store
        .clear_signal(&h.signal_key(Signal::Active, key))
        .await
        .unwrap();

    let second = validator.validate().await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.orphaned, 0);

    let third = validate_again(&h, &validator).await;
    assert!(!third.skipped);
    assert_eq!(third.orphaned, 1);
}

#[tokio::test]
async fn test_concurrent_validator_is_skipped() {
    let h = Harness::new().await;
    let lock = h.backends.keys.lock("validator:indexing");
    h.store
        .acquire_lock(&lock, Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let summary = h.validator().validate().await.unwrap();
    assert!(summary.skipped);
}

#[tokio::test]
async fn test_attempt_that_moved_on_during_the_check_is_not_orphaned() {
    let h = Harness::new().await;
    let (_, attempt_id, handle) = dispatched(&h, 1).await;
    h.queue.drop_task(&handle).await;

    let queue = Arc::new(StartsAttemptOnLookup {
        inner: h.queue.clone(),
        persistence: h.backends.persistence.clone(),
        attempt_id,
    });
    let backends = Backends::new(h.backends.persistence.clone(), h.store.clone(), queue);
    let validator = Validator::new(backends, h.state_machine.clone(), ValidatorConfig::default());

    let summary = validator.validate().await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.orphaned, 0);

    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::InProgress);
    assert!(attempt.failure_reason.is_none());
}

#[tokio::test]
async fn test_crashed_worker_task_is_redelivered_not_orphaned() {
    let h = Harness::with_task_lease(Duration::from_millis(30)).await;
    let (key, attempt_id, handle) = dispatched(&h, 1).await;

    // A worker reserves the fetch task and dies without renewing its lease.
    let reserved = h.queue.reserve(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(reserved.handle, handle);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let summary = h.validator().validate().await.unwrap();
    assert_eq!(summary.orphaned, 0);
    assert!(h.queue.is_queued(&handle).await.unwrap());

    // Lost again for good: with no lease and no queue entry it is orphaned.
    h.queue.drop_task(&handle).await;
    h.store
        .clear_signal(&h.signal_key(Signal::Active, key))
        .await
        .unwrap();
    let validator = h.validator();
    assert_eq!(validate_again(&h, &validator).await.orphaned, 1);
    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
}
