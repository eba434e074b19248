// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the work dispatcher.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use fencepost_core::{
    AttemptStatus, FenceKind, FencePayload, FenceStore, ResourceStatus, Signal, WorkKind,
};

use fencepost_coordinator::dispatcher::{DispatchOutcome, dispatch_lock_name};
use fencepost_coordinator::fences::ResourceFence;
use fencepost_coordinator::tasks::{FETCH_TASK, FetchTaskArgs};

fn other_payload(attempt_id: i64) -> FencePayload {
    FencePayload {
        attempt_id,
        task_handle: Some("deletion-task".to_string()),
        submitted_at: Utc::now(),
        started_at: None,
    }
}

#[tokio::test]
async fn test_dispatch_creates_attempt_fence_and_task() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;

    // Leftovers from a previous run must not leak into the new attempt.
    h.store
        .set_signal(&h.signal_key(Signal::Stop, key), "0", None)
        .await
        .unwrap();

    let outcome = h.dispatcher().try_create_task(key).await.unwrap();
    let DispatchOutcome::Dispatched {
        attempt_id,
        task_handle,
    } = outcome
    else {
        panic!("expected dispatch, got {outcome:?}");
    };

    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::NotStarted);
    assert_eq!(attempt.task_handle.as_deref(), Some(task_handle.as_str()));

    let payload = h.fence(key).payload().await.unwrap().unwrap();
    assert_eq!(payload.attempt_id, attempt_id);
    assert_eq!(payload.task_handle.as_deref(), Some(task_handle.as_str()));
    assert!(payload.started_at.is_none());
    assert!(!h.fence(key).should_stop(attempt_id).await.unwrap());
    assert!(
        h.store
            .get_signal(&h.signal_key(Signal::Stop, key))
            .await
            .unwrap()
            .is_none()
    );

    let submitted = h.queue.submitted_of_type(FETCH_TASK).await;
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].handle, task_handle);
    let args: FetchTaskArgs = serde_json::from_value(submitted[0].args.clone()).unwrap();
    assert_eq!(args.attempt_id, attempt_id);
    assert_eq!(args.key, key);
    assert_eq!(args.kind, WorkKind::Indexing);
}

#[tokio::test]
async fn test_fenced_key_is_not_dispatched_twice() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let dispatcher = h.dispatcher();

    assert!(matches!(
        dispatcher.try_create_task(key).await.unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));
    assert_eq!(
        dispatcher.try_create_task(key).await.unwrap(),
        DispatchOutcome::AlreadyFenced
    );

    // Fence lost but the attempt is still in flight: the database refuses.
    h.fence(key).reset().await.unwrap();
    assert_eq!(
        dispatcher.try_create_task(key).await.unwrap(),
        DispatchOutcome::AttemptActive
    );
    assert_eq!(h.queue.submitted_of_type(FETCH_TASK).await.len(), 1);
}

#[tokio::test]
async fn test_conflicting_fence_blocks_dispatch() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;

    ResourceFence::of_kind(&h.backends, FenceKind::Pruning, key)
        .set_payload(&other_payload(99))
        .await
        .unwrap();

    assert_eq!(
        h.dispatcher().try_create_task(key).await.unwrap(),
        DispatchOutcome::Conflict(FenceKind::Pruning)
    );
    assert!(
        h.persistence()
            .latest_attempt(key, WorkKind::Indexing)
            .await
            .unwrap()
            .is_none()
    );

    // Pruning does not block permission sync; deletion does.
    assert!(matches!(
        h.dispatcher_for(WorkKind::PermissionSync)
            .try_create_task(key)
            .await
            .unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));

    let other = h.register_key(2).await;
    ResourceFence::of_kind(&h.backends, FenceKind::Deletion, other)
        .set_payload(&other_payload(100))
        .await
        .unwrap();
    assert_eq!(
        h.dispatcher_for(WorkKind::PermissionSync)
            .try_create_task(other)
            .await
            .unwrap(),
        DispatchOutcome::Conflict(FenceKind::Deletion)
    );
}

#[tokio::test]
async fn test_busy_dispatch_lock_is_a_no_op() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;

    let lock_name = h.backends.keys.lock(&dispatch_lock_name(WorkKind::Indexing));
    let token = h
        .store
        .acquire_lock(&lock_name, Duration::from_secs(30), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        h.dispatcher().try_create_task(key).await.unwrap(),
        DispatchOutcome::LockBusy
    );
    assert!(h.queue.submitted().await.is_empty());

    assert!(h.store.release_lock(&token).await.unwrap());
    assert!(matches!(
        h.dispatcher().try_create_task(key).await.unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));
}

#[tokio::test]
async fn test_submit_failure_leaves_unfenced_attempt_without_handle() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;

    h.queue.fail_next_submit();
    let outcome = h.dispatcher().try_create_task(key).await.unwrap();
    let DispatchOutcome::SubmitFailed { attempt_id } = outcome else {
        panic!("expected submit failure, got {outcome:?}");
    };

    let attempt = h.persistence().get_attempt(attempt_id).await.unwrap().unwrap();
    assert!(attempt.task_handle.is_none());
    assert!(attempt.is_active());
    assert!(!h.fence(key).exists().await.unwrap());

    // The dispatch lock was released.
    let lock_name = h.backends.keys.lock(&dispatch_lock_name(WorkKind::Indexing));
    assert!(
        h.store
            .acquire_lock(&lock_name, Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_concurrent_dispatchers_create_one_attempt() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let first = h.dispatcher();
    let second = h.dispatcher();

    let (a, b) = futures::join!(first.try_create_task(key), second.try_create_task(key));
    let outcomes = [a.unwrap(), b.unwrap()];

    let dispatched = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Dispatched { .. }))
        .count();
    assert_eq!(dispatched, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.iter().all(|o| matches!(
        o,
        DispatchOutcome::Dispatched { .. }
            | DispatchOutcome::AlreadyFenced
            | DispatchOutcome::LockBusy
    )));
    assert_eq!(h.queue.submitted_of_type(FETCH_TASK).await.len(), 1);
    assert_eq!(
        h.persistence()
            .list_active_attempts(WorkKind::Indexing)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_check_for_work_dispatches_due_resources_once() {
    let h = Harness::new().await;
    h.register_key(1).await;
    h.register_key(2).await;
    let dispatcher = h.dispatcher();

    let summary = dispatcher.check_for_work().await.unwrap();
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.failed, 0);

    let resource = h.persistence().get_resource(1).await.unwrap().unwrap();
    assert_eq!(resource.status, ResourceStatus::InitialIndexing);

    // In-flight attempts are not due again.
    let summary = dispatcher.check_for_work().await.unwrap();
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(h.queue.submitted_of_type(FETCH_TASK).await.len(), 2);
}

#[tokio::test]
async fn test_inactive_configuration_is_not_dispatched() {
    let h = Harness::new().await;
    h.register_key(1).await;
    h.persistence().register_configuration(1, false).await.unwrap();

    let summary = h.dispatcher().check_for_work().await.unwrap();
    assert_eq!(summary.evaluated, 0);
    assert!(h.queue.submitted().await.is_empty());
}

#[tokio::test]
async fn test_dispatch_clears_stale_signals() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;

    for signal in [Signal::Completion, Signal::Taskset] {
        h.store
            .set_signal(&h.signal_key(signal, key), "[\"old\"]", None)
            .await
            .unwrap();
    }

    h.dispatcher().try_create_task(key).await.unwrap();

    assert!(
        h.store
            .get_signal(&h.signal_key(Signal::Completion, key))
            .await
            .unwrap()
            .is_none()
    );
    assert!(h.fence(key).taskset().await.unwrap().is_empty());
}
