// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the fetch task that enumerates batches.

mod common;

use std::sync::Arc;

use common::*;
use fencepost_core::{AttemptStatus, ResourceKey, WorkKind};

use fencepost_coordinator::dispatcher::DispatchOutcome;
use fencepost_coordinator::error::CoordinationError;
use fencepost_coordinator::fences::CompletionSignal;
use fencepost_coordinator::pipeline::EmptySource;
use fencepost_coordinator::producer::FetchOutcome;
use fencepost_coordinator::tasks::{BATCH_TASK, BatchTaskArgs, FetchTaskArgs};

/// Dispatch `key` and return the fetch task handle and its arguments.
async fn dispatch(h: &Harness, key: ResourceKey) -> (String, FetchTaskArgs) {
    let DispatchOutcome::Dispatched {
        attempt_id,
        task_handle,
    } = h.dispatcher().try_create_task(key).await.unwrap()
    else {
        panic!("dispatch failed");
    };
    (
        task_handle,
        FetchTaskArgs {
            attempt_id,
            kind: WorkKind::Indexing,
            key,
        },
    )
}

#[tokio::test]
async fn test_fetch_submits_one_batch_per_non_empty_page() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let (handle, args) = dispatch(&h, key).await;

    let source = PagedSource::new(vec![docs("a", 3), Vec::new(), docs("b", 2)]);
    let outcome = h
        .fetch_task(Arc::new(source))
        .run(&handle, &args)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Enumerated { total_batches: 2 });

    let attempt = h
        .persistence()
        .get_attempt(args.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::InProgress);
    assert!(attempt.started_at.is_some());

    let ledger = h
        .persistence()
        .get_coordination_status(args.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ledger.total_batches, Some(2));

    let batches = h.queue.submitted_of_type(BATCH_TASK).await;
    assert_eq!(batches.len(), 2);
    let second: BatchTaskArgs = serde_json::from_value(batches[1].args.clone()).unwrap();
    assert_eq!(second.batch_num, 1);
    assert_eq!(second.documents, docs("b", 2));

    let taskset = h.fence(key).taskset().await.unwrap();
    assert_eq!(
        taskset,
        batches.iter().map(|b| b.handle.clone()).collect::<Vec<_>>()
    );

    let payload = h.fence(key).payload().await.unwrap().unwrap();
    assert!(payload.started_at.is_some());
    assert!(h.fence(key).is_active().await.unwrap());
}

#[tokio::test]
async fn test_fetch_with_nothing_to_index_records_zero_batches() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let (handle, args) = dispatch(&h, key).await;

    let outcome = h
        .fetch_task(Arc::new(EmptySource))
        .run(&handle, &args)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Enumerated { total_batches: 0 });

    let ledger = h
        .persistence()
        .get_coordination_status(args.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert!(ledger.is_complete());
}

#[tokio::test]
async fn test_fetch_times_out_without_matching_fence() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let (_, args) = dispatch(&h, key).await;

    // A redelivered task whose handle no longer matches the fence.
    let err = h
        .fetch_task(Arc::new(EmptySource))
        .run("some-other-task", &args)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::FenceNotReady { .. }));

    let attempt = h
        .persistence()
        .get_attempt(args.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::NotStarted);
}

#[tokio::test]
async fn test_fetch_for_finished_attempt_does_nothing() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let (handle, args) = dispatch(&h, key).await;
    h.persistence()
        .complete_attempt_if_active(args.attempt_id, AttemptStatus::Failed, Some("orphaned"))
        .await
        .unwrap();

    let outcome = h
        .fetch_task(Arc::new(PagedSource::new(vec![docs("a", 3)])))
        .run(&handle, &args)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::AlreadyFinished);
    assert!(h.queue.submitted_of_type(BATCH_TASK).await.is_empty());
}

#[tokio::test]
async fn test_fetch_stops_on_request() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let (handle, args) = dispatch(&h, key).await;
    h.fence(key).request_stop(args.attempt_id).await.unwrap();

    let outcome = h
        .fetch_task(Arc::new(PagedSource::new(vec![docs("a", 3)])))
        .run(&handle, &args)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Canceled);
    assert_eq!(
        h.fence(key).completion(args.attempt_id).await.unwrap(),
        Some(CompletionSignal::Canceled)
    );
    assert!(h.queue.submitted_of_type(BATCH_TASK).await.is_empty());
}

#[tokio::test]
async fn test_source_failure_fails_attempt() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let (handle, args) = dispatch(&h, key).await;

    let source = PagedSource::new(vec![docs("a", 3), docs("b", 3)]).failing_at(1);
    let err = h
        .fetch_task(Arc::new(source))
        .run(&handle, &args)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Pipeline(_)));

    assert_eq!(
        h.fence(key).completion(args.attempt_id).await.unwrap(),
        Some(CompletionSignal::Failed {
            reason: "Document source failed: connector credentials expired".to_string()
        })
    );
    // Batches already submitted stay tracked for the validator.
    assert_eq!(h.fence(key).taskset().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_redelivered_fetch_resumes_after_submitted_batches() {
    let h = Harness::new().await;
    let key = h.register_key(1).await;
    let (handle, args) = dispatch(&h, key).await;

    // The first delivery got as far as one batch before its worker died.
    h.fetch_task(Arc::new(PagedSource::new(vec![docs("a", 3)])))
        .run(&handle, &args)
        .await
        .unwrap();

    let source = PagedSource::new(vec![docs("a", 3), Vec::new(), docs("b", 2)]);
    let outcome = h
        .fetch_task(Arc::new(source))
        .run(&handle, &args)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Enumerated { total_batches: 2 });

    let batches = h.queue.submitted_of_type(BATCH_TASK).await;
    assert_eq!(batches.len(), 2);
    let resumed: BatchTaskArgs = serde_json::from_value(batches[1].args.clone()).unwrap();
    assert_eq!(resumed.batch_num, 1);
    assert_eq!(resumed.documents, docs("b", 2));
    assert_eq!(
        h.fence(key).taskset().await.unwrap(),
        batches.iter().map(|b| b.handle.clone()).collect::<Vec<_>>()
    );

    let ledger = h
        .persistence()
        .get_coordination_status(args.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ledger.total_batches, Some(2));
}
