// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task-execution service adapter.
//!
//! The coordinator submits tasks and introspects the pending queue and the
//! reservation set; executors reserve, start and complete tasks.
//!
//! A reservation is a lease. The executor running the task renews it; a lease
//! that lapses (the worker crashed) puts the task back in the pending queue.
//! Delivery is therefore at-least-once and every task body must tolerate
//! redelivery.

pub mod mock;
pub mod redis;

pub use self::mock::MockTaskQueue;
pub use self::redis::{RedisTaskQueue, RedisTaskQueueConfig};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// State of a submitted task as seen by the task-execution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued or reserved, not yet started.
    Pending,
    /// A worker has started it.
    Active,
    /// Finished (successfully or not).
    Terminal,
    /// The service has no record of the handle.
    Unknown,
}

impl TaskState {
    /// Stable string stored by the Redis backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Terminal => "terminal",
            Self::Unknown => "unknown",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "active" => Self::Active,
            "terminal" => Self::Terminal,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reserved task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Handle returned by `submit`.
    pub handle: String,
    /// Task type used by executors to route the task.
    pub task_type: String,
    /// JSON arguments.
    pub args: serde_json::Value,
}

/// External task-execution service.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task and return its handle.
    async fn submit(&self, task_type: &str, args: serde_json::Value)
    -> Result<String, StoreError>;

    /// Current state of a task.
    async fn state(&self, handle: &str) -> Result<TaskState, StoreError>;

    /// Whether the task is still waiting in the pending queue.
    async fn is_queued(&self, handle: &str) -> Result<bool, StoreError>;

    /// Handles of tasks reserved by workers whose lease is still live.
    ///
    /// Expired leases are requeued first, so a task is reported either here
    /// or by [`TaskQueue::is_queued`], never by neither while it exists.
    async fn reserved_handles(&self) -> Result<Vec<String>, StoreError>;

    /// Lease the next pending task, waiting up to `timeout`.
    async fn reserve(&self, timeout: Duration) -> Result<Option<TaskMessage>, StoreError>;

    /// How long a reservation lasts without renewal.
    fn lease_duration(&self) -> Duration;

    /// Extend the lease of a reserved task. Returns false if it was lost.
    async fn renew_lease(&self, handle: &str) -> Result<bool, StoreError>;

    /// Mark a reserved task as started.
    async fn start(&self, handle: &str) -> Result<(), StoreError>;

    /// Drop a task's lease (and any requeued copy) and mark it terminal.
    async fn complete(&self, handle: &str, success: bool) -> Result<(), StoreError>;
}
