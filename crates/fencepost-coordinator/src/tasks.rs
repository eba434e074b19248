// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task payloads exchanged through the task queue.

use fencepost_core::{ResourceKey, TaskMessage, WorkKind};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};
use crate::pipeline::Document;

/// Task type of the fetch (producer) task.
pub const FETCH_TASK: &str = "fencepost.fetch";

/// Task type of a batch task.
pub const BATCH_TASK: &str = "fencepost.batch";

/// Arguments of a fetch task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchTaskArgs {
    /// Attempt to run.
    pub attempt_id: i64,
    /// Job kind.
    pub kind: WorkKind,
    /// Resource key.
    pub key: ResourceKey,
}

/// Arguments of a batch task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTaskArgs {
    /// Attempt the batch belongs to.
    pub attempt_id: i64,
    /// Job kind.
    pub kind: WorkKind,
    /// Resource key.
    pub key: ResourceKey,
    /// Zero-based batch number.
    pub batch_num: i64,
    /// Documents to process.
    pub documents: Vec<Document>,
}

/// A decoded task.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Enumerate batches for an attempt.
    Fetch(FetchTaskArgs),
    /// Process one batch.
    Batch(BatchTaskArgs),
}

impl Task {
    /// Decode a reserved task message.
    pub fn decode(message: &TaskMessage) -> Result<Self> {
        match message.task_type.as_str() {
            FETCH_TASK => Ok(Task::Fetch(serde_json::from_value(message.args.clone())?)),
            BATCH_TASK => Ok(Task::Batch(serde_json::from_value(message.args.clone())?)),
            other => Err(CoordinationError::InvalidTask(format!(
                "unknown task type '{other}'"
            ))),
        }
    }
}
