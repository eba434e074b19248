// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log context passed explicitly to everything that logs on behalf of an attempt.

use std::fmt;

use fencepost_core::{AttemptRecord, ResourceKey, WorkKind};

/// Identifies the work a log line is about.
///
/// Rendered as a single `ctx` field, e.g.
/// `kind=indexing key=4/1 attempt=17 task=fp-3 batch=2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    /// Job kind.
    pub kind: Option<WorkKind>,
    /// Resource key.
    pub key: Option<ResourceKey>,
    /// Attempt id.
    pub attempt_id: Option<i64>,
    /// Task handle.
    pub task_handle: Option<String>,
    /// Batch number.
    pub batch_num: Option<i64>,
}

impl LogContext {
    /// Context for a resource key.
    pub fn for_key(kind: WorkKind, key: ResourceKey) -> Self {
        Self {
            kind: Some(kind),
            key: Some(key),
            ..Self::default()
        }
    }

    /// Context for an existing attempt.
    pub fn for_attempt(attempt: &AttemptRecord) -> Self {
        Self {
            kind: Some(attempt.kind),
            key: Some(attempt.key),
            attempt_id: Some(attempt.attempt_id),
            task_handle: attempt.task_handle.clone(),
            batch_num: None,
        }
    }

    /// Add the attempt id.
    pub fn with_attempt(mut self, attempt_id: i64) -> Self {
        self.attempt_id = Some(attempt_id);
        self
    }

    /// Add the task handle.
    pub fn with_task(mut self, handle: impl Into<String>) -> Self {
        self.task_handle = Some(handle.into());
        self
    }

    /// Add the batch number.
    pub fn with_batch(mut self, batch_num: i64) -> Self {
        self.batch_num = Some(batch_num);
        self
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::with_capacity(5);
        if let Some(kind) = self.kind {
            fields.push(format!("kind={kind}"));
        }
        if let Some(key) = self.key {
            fields.push(format!("key={key}"));
        }
        if let Some(attempt_id) = self.attempt_id {
            fields.push(format!("attempt={attempt_id}"));
        }
        if let Some(handle) = &self.task_handle {
            fields.push(format!("task={handle}"));
        }
        if let Some(batch_num) = self.batch_num {
            fields.push(format!("batch={batch_num}"));
        }
        f.write_str(&fields.join(" "))
    }
}
