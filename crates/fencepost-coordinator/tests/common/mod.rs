// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fencepost-coordinator integration tests.
//!
//! Every test gets a fresh in-memory SQLite ledger, an in-memory fence store
//! and a mock task queue, wired together as [`Backends`]. The scripted
//! source and pipeline below stand in for connectors and the indexing
//! pipeline.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fencepost_core::fence::MemoryFenceStore;
use fencepost_core::persistence::{Persistence, SqlitePersistence};
use fencepost_core::queue::MockTaskQueue;
use fencepost_core::{
    AttemptRecord, DocumentFailure, FenceKind, FencePayload, ResourceKey, Signal, WorkKind,
};
use serde_json::json;
use tokio::sync::Notify;

use fencepost_coordinator::backends::Backends;
use fencepost_coordinator::batch_worker::{BatchWorker, BatchWorkerConfig};
use fencepost_coordinator::dispatcher::{Dispatcher, DispatcherConfig};
use fencepost_coordinator::executor::{ExecutorConfig, TaskExecutor};
use fencepost_coordinator::fences::ResourceFence;
use fencepost_coordinator::monitor::{CompletionMonitor, MonitorConfig};
use fencepost_coordinator::pipeline::{
    BatchOutcome, Checkpoint, Document, DocumentBatch, DocumentPipeline, DocumentSource,
    PipelineError,
};
use fencepost_coordinator::producer::{FetchTask, FetchTaskConfig};
use fencepost_coordinator::resource_state::{ResourceStateConfig, ResourceStateMachine};
use fencepost_coordinator::tasks::BatchTaskArgs;
use fencepost_coordinator::validator::{Validator, ValidatorConfig};

/// Backends plus typed handles to the in-memory implementations.
pub struct Harness {
    pub backends: Backends,
    pub store: Arc<MemoryFenceStore>,
    pub queue: Arc<MockTaskQueue>,
    pub state_machine: ResourceStateMachine,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_resource_state(ResourceStateConfig::default()).await
    }

    pub async fn with_resource_state(config: ResourceStateConfig) -> Self {
        Self::with_parts(config, MockTaskQueue::new()).await
    }

    /// Harness over a queue whose reservations last `lease`.
    pub async fn with_task_lease(lease: Duration) -> Self {
        Self::with_parts(ResourceStateConfig::default(), MockTaskQueue::with_lease(lease)).await
    }

    async fn with_parts(config: ResourceStateConfig, queue: MockTaskQueue) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to open in-memory SQLite"),
        );
        let store = Arc::new(MemoryFenceStore::new());
        let queue = Arc::new(queue);
        let backends = Backends::new(persistence.clone(), store.clone(), queue.clone());
        let state_machine = ResourceStateMachine::new(persistence, config);
        Self {
            backends,
            store,
            queue,
            state_machine,
        }
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.backends.persistence.as_ref()
    }

    pub fn fence(&self, key: ResourceKey) -> ResourceFence<'_> {
        ResourceFence::new(&self.backends, WorkKind::Indexing, key)
    }

    pub fn signal_key(&self, signal: Signal, key: ResourceKey) -> String {
        self.backends.keys.signal(signal, FenceKind::Indexing, &key)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher_for(WorkKind::Indexing)
    }

    pub fn dispatcher_for(&self, kind: WorkKind) -> Dispatcher {
        Dispatcher::new(
            self.backends.clone(),
            self.state_machine.clone(),
            DispatcherConfig {
                kind,
                dispatch_lock_wait: Duration::from_millis(200),
                ..DispatcherConfig::default()
            },
        )
    }

    pub fn monitor(&self) -> CompletionMonitor {
        CompletionMonitor::new(
            self.backends.clone(),
            self.state_machine.clone(),
            MonitorConfig::default(),
        )
    }

    pub fn validator(&self) -> Validator {
        self.validator_with(ValidatorConfig::default())
    }

    pub fn validator_with(&self, config: ValidatorConfig) -> Validator {
        Validator::new(self.backends.clone(), self.state_machine.clone(), config)
    }

    pub fn fetch_task(&self, source: Arc<dyn DocumentSource>) -> FetchTask {
        FetchTask::new(
            self.backends.clone(),
            source,
            FetchTaskConfig {
                fence_ready_timeout: Duration::from_millis(200),
                fence_poll_interval: Duration::from_millis(10),
                ..FetchTaskConfig::default()
            },
        )
    }

    pub fn batch_worker(&self, pipeline: Arc<dyn DocumentPipeline>) -> BatchWorker {
        self.batch_worker_with(
            pipeline,
            BatchWorkerConfig {
                ledger_lock_wait: Duration::from_millis(200),
                ..BatchWorkerConfig::default()
            },
        )
    }

    pub fn batch_worker_with(
        &self,
        pipeline: Arc<dyn DocumentPipeline>,
        config: BatchWorkerConfig,
    ) -> BatchWorker {
        BatchWorker::new(self.backends.clone(), pipeline, config)
    }

    pub fn executor(
        &self,
        source: Arc<dyn DocumentSource>,
        pipeline: Arc<dyn DocumentPipeline>,
    ) -> TaskExecutor {
        TaskExecutor::new(
            self.backends.clone(),
            Arc::new(self.fetch_task(source)),
            Arc::new(self.batch_worker(pipeline)),
            ExecutorConfig {
                reserve_timeout: Duration::ZERO,
                ..ExecutorConfig::default()
            },
        )
    }

    /// Register a resource with an hourly refresh and an active configuration 1.
    pub async fn register_key(&self, resource_id: i64) -> ResourceKey {
        self.persistence()
            .register_resource(resource_id, Some(3600))
            .await
            .expect("Failed to register resource");
        self.persistence()
            .register_configuration(1, true)
            .await
            .expect("Failed to register configuration");
        ResourceKey::new(resource_id, 1)
    }

    /// An IN_PROGRESS attempt with a handle and a fence, as the fetch task leaves it.
    pub async fn started_attempt(&self, key: ResourceKey) -> AttemptRecord {
        let p = self.persistence();
        let attempt = p.create_attempt(key, WorkKind::Indexing).await.unwrap();
        let handle = format!("fetch-{}", attempt.attempt_id);
        p.set_attempt_task_handle(attempt.attempt_id, &handle)
            .await
            .unwrap();
        assert!(p.mark_attempt_in_progress(attempt.attempt_id).await.unwrap());
        self.fence(key)
            .set_payload(&FencePayload {
                attempt_id: attempt.attempt_id,
                task_handle: Some(handle),
                submitted_at: Utc::now(),
                started_at: Some(Utc::now()),
            })
            .await
            .unwrap();
        p.get_attempt(attempt.attempt_id).await.unwrap().unwrap()
    }

    /// Drain the queue through `executor`, returning the number of tasks run.
    pub async fn drain(&self, executor: &TaskExecutor) -> usize {
        let mut ran = 0;
        while executor.run_once().await.unwrap() {
            ran += 1;
            assert!(ran < 100, "queue never drained");
        }
        ran
    }
}

/// `count` documents with ids `{prefix}-0`, `{prefix}-1`, ...
pub fn docs(prefix: &str, count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| Document {
            id: format!("{prefix}-{i}"),
            content: json!({ "text": format!("document {i}") }),
        })
        .collect()
}

pub fn batch_args(attempt: &AttemptRecord, batch_num: i64, documents: Vec<Document>) -> BatchTaskArgs {
    BatchTaskArgs {
        attempt_id: attempt.attempt_id,
        kind: attempt.kind,
        key: attempt.key,
        batch_num,
        documents,
    }
}

/// Source serving fixed pages, optionally failing at one page.
#[derive(Default)]
pub struct PagedSource {
    pages: Vec<Vec<Document>>,
    fail_at: Option<i64>,
}

impl PagedSource {
    pub fn new(pages: Vec<Vec<Document>>) -> Self {
        Self {
            pages,
            fail_at: None,
        }
    }

    pub fn failing_at(mut self, page: i64) -> Self {
        self.fail_at = Some(page);
        self
    }
}

#[async_trait]
impl DocumentSource for PagedSource {
    async fn fetch_page(
        &self,
        _attempt: &AttemptRecord,
        page: i64,
    ) -> Result<Option<Vec<Document>>, PipelineError> {
        if self.fail_at == Some(page) {
            return Err(PipelineError::new("connector credentials expired"));
        }
        Ok(usize::try_from(page)
            .ok()
            .and_then(|p| self.pages.get(p))
            .cloned())
    }
}

/// Pipeline that fails chosen documents or whole batches.
#[derive(Default)]
pub struct ScriptedPipeline {
    failing_docs: HashSet<String>,
    cause: Option<String>,
    failing_batches: HashMap<i64, String>,
    pause: Option<Duration>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report these documents as failed.
    pub fn failing_docs<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_docs.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Attach `cause` to every document failure.
    pub fn with_cause(mut self, cause: &str) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Sleep for `pause` before the first checkpoint.
    pub fn pausing(mut self, pause: Duration) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Raise `message` when processing `batch_num`.
    pub fn failing_batch(mut self, batch_num: i64, message: &str) -> Self {
        self.failing_batches.insert(batch_num, message.to_string());
        self
    }
}

#[async_trait]
impl DocumentPipeline for ScriptedPipeline {
    async fn process(
        &self,
        batch: &DocumentBatch,
        checkpoint: &dyn Checkpoint,
    ) -> Result<BatchOutcome, PipelineError> {
        if let Some(pause) = self.pause {
            tokio::time::sleep(pause).await;
        }
        if checkpoint.should_stop().await {
            return Ok(BatchOutcome::default());
        }
        if let Some(message) = self.failing_batches.get(&batch.batch_num) {
            return Err(PipelineError::new(message.clone()));
        }

        let failures: Vec<DocumentFailure> = batch
            .documents
            .iter()
            .filter(|d| self.failing_docs.contains(&d.id))
            .map(|d| DocumentFailure {
                document_id: Some(d.id.clone()),
                message: format!("failed to embed {}", d.id),
                cause: self.cause.clone(),
            })
            .collect();
        let total_docs = batch.documents.len() as i64;
        let indexed = total_docs - failures.len() as i64;
        Ok(BatchOutcome {
            total_docs,
            new_docs: indexed,
            total_chunks: indexed * 2,
            failures,
        })
    }
}

/// Pipeline that parks inside `process` until released, then fails or
/// counts the batch.
#[derive(Default)]
pub struct GatedPipeline {
    entered: Notify,
    release: Notify,
    error: Option<String>,
}

impl GatedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `message` once released.
    pub fn failing_with(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    /// Wait until a worker is inside `process`.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the parked worker continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl DocumentPipeline for GatedPipeline {
    async fn process(
        &self,
        batch: &DocumentBatch,
        _checkpoint: &dyn Checkpoint,
    ) -> Result<BatchOutcome, PipelineError> {
        self.entered.notify_one();
        self.release.notified().await;
        if let Some(message) = &self.error {
            return Err(PipelineError::new(message.clone()));
        }
        let total_docs = batch.documents.len() as i64;
        Ok(BatchOutcome {
            total_docs,
            new_docs: total_docs,
            total_chunks: total_docs,
            failures: Vec::new(),
        })
    }
}
