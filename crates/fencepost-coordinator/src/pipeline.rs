// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boundary to the document pipeline and the document source.
//!
//! Parsing, chunking, embedding and connector crawling live outside this
//! crate. The coordinator only needs to pull pages of documents for an
//! attempt and hand each batch to a pipeline that reports counters back.

use async_trait::async_trait;
use fencepost_core::{AttemptRecord, DocumentFailure};
use serde::{Deserialize, Serialize};

/// A document to index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Source-assigned document id.
    pub id: String,
    /// Opaque content handed to the pipeline.
    pub content: serde_json::Value,
}

/// One batch of documents for an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBatch {
    /// Zero-based batch number within the attempt.
    pub batch_num: i64,
    /// Documents in the batch.
    pub documents: Vec<Document>,
}

/// Counters reported by the pipeline for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Documents processed (successful or not).
    pub total_docs: i64,
    /// Documents new to the index.
    pub new_docs: i64,
    /// Chunks written.
    pub total_chunks: i64,
    /// Per-document failures.
    pub failures: Vec<DocumentFailure>,
}

/// Pipeline or source failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PipelineError {
    /// Failure message.
    pub message: String,
}

impl PipelineError {
    /// Create a pipeline error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Cooperative cancellation point handed to the pipeline.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Renew the worker's claim and report whether it must stop.
    async fn should_stop(&self) -> bool;
}

/// Processes one batch of documents.
#[async_trait]
pub trait DocumentPipeline: Send + Sync {
    /// Index `batch`, calling `checkpoint.should_stop()` between major steps.
    async fn process(
        &self,
        batch: &DocumentBatch,
        checkpoint: &dyn Checkpoint,
    ) -> Result<BatchOutcome, PipelineError>;
}

/// Enumerates the documents an attempt must index.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Page `page` (zero-based) of documents, or None when exhausted.
    async fn fetch_page(
        &self,
        attempt: &AttemptRecord,
        page: i64,
    ) -> Result<Option<Vec<Document>>, PipelineError>;
}

/// Source with nothing to index.
///
/// Used by the bundled binary, where connectors plug in their own source.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySource;

#[async_trait]
impl DocumentSource for EmptySource {
    async fn fetch_page(
        &self,
        _attempt: &AttemptRecord,
        _page: i64,
    ) -> Result<Option<Vec<Document>>, PipelineError> {
        Ok(None)
    }
}

/// Pipeline that accepts every document without writing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountingPipeline;

#[async_trait]
impl DocumentPipeline for CountingPipeline {
    async fn process(
        &self,
        batch: &DocumentBatch,
        checkpoint: &dyn Checkpoint,
    ) -> Result<BatchOutcome, PipelineError> {
        if checkpoint.should_stop().await {
            return Ok(BatchOutcome::default());
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
