// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types shared by the ledger, the fence store and the coordinator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Unit of work being coordinated: one resource under one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Monitored resource (e.g. a connector-credential pair).
    pub resource_id: i64,
    /// Configuration the resource is processed under (e.g. search settings).
    pub configuration_id: i64,
}

impl ResourceKey {
    /// Create a new resource key.
    pub fn new(resource_id: i64, configuration_id: i64) -> Self {
        Self {
            resource_id,
            configuration_id,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.configuration_id)
    }
}

/// Kind of background job an attempt represents.
///
/// Permission sync runs the same fencing protocol as indexing, under its own
/// fences and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Document indexing.
    Indexing,
    /// Document permission sync.
    PermissionSync,
}

impl WorkKind {
    /// Stable string used in the database and in store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indexing => "indexing",
            Self::PermissionSync => "permission_sync",
        }
    }

    /// Fence kind claimed by attempts of this kind.
    pub fn fence_kind(&self) -> FenceKind {
        match self {
            Self::Indexing => FenceKind::Indexing,
            Self::PermissionSync => FenceKind::PermissionSync,
        }
    }

    /// Fences that block new work of this kind on the same resource.
    pub fn conflicts(&self) -> &'static [FenceKind] {
        match self {
            Self::Indexing => &[FenceKind::Deletion, FenceKind::Pruning],
            Self::PermissionSync => &[FenceKind::Deletion],
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexing" => Ok(Self::Indexing),
            "permission_sync" => Ok(Self::PermissionSync),
            other => Err(CoreError::invalid("kind", other)),
        }
    }
}

/// Kinds of fences kept in the fence store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceKind {
    /// Indexing in flight for a resource key.
    Indexing,
    /// Permission sync in flight for a resource key.
    PermissionSync,
    /// Resource is being deleted.
    Deletion,
    /// Resource is being pruned.
    Pruning,
}

impl FenceKind {
    /// Stable string used in store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indexing => "indexing",
            Self::PermissionSync => "permission_sync",
            Self::Deletion => "deletion",
            Self::Pruning => "pruning",
        }
    }

    /// Whether this fence covers the whole resource rather than one configuration.
    pub fn is_resource_scoped(&self) -> bool {
        matches!(self, Self::Deletion | Self::Pruning)
    }

    /// Scope string identifying the fenced object.
    pub fn scope(&self, key: &ResourceKey) -> String {
        if self.is_resource_scoped() {
            key.resource_id.to_string()
        } else {
            key.to_string()
        }
    }
}

/// Attempt lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Created by the dispatcher, not yet picked up.
    NotStarted,
    /// The fetch task has started.
    InProgress,
    /// Every batch finished with zero failures.
    Succeeded,
    /// Every batch finished, some documents failed.
    PartiallySucceeded,
    /// The attempt failed (orphaned, stalled, aborted, or a batch raised).
    Failed,
    /// The attempt was stopped on request.
    Canceled,
}

impl AttemptStatus {
    /// Statuses that count as "in flight".
    pub const ACTIVE: [AttemptStatus; 2] = [AttemptStatus::NotStarted, AttemptStatus::InProgress];

    /// Stable string used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether the attempt has reached a final status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::InProgress)
    }

    /// Whether the attempt indexed its documents (fully or partially).
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallySucceeded)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "partially_succeeded" => Ok(Self::PartiallySucceeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(CoreError::invalid("status", other)),
        }
    }
}

/// Coarse resource lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Registered, never dispatched.
    Scheduled,
    /// First attempt dispatched, no successful run yet.
    InitialIndexing,
    /// At least one successful run.
    Active,
}

impl ResourceStatus {
    /// Stable string used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InitialIndexing => "initial_indexing",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "initial_indexing" => Ok(Self::InitialIndexing),
            "active" => Ok(Self::Active),
            other => Err(CoreError::invalid("resource_status", other)),
        }
    }
}

/// One execution of a job for a resource key.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// Database primary key.
    pub attempt_id: i64,
    /// Job kind.
    pub kind: WorkKind,
    /// Resource key the attempt runs for.
    pub key: ResourceKey,
    /// Current status.
    pub status: AttemptStatus,
    /// Handle of the task submitted to the task queue (None until dispatched).
    pub task_handle: Option<String>,
    /// When the attempt was created.
    pub created_at: DateTime<Utc>,
    /// When the fetch task started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Human-readable failure reason.
    pub failure_reason: Option<String>,
}

impl AttemptRecord {
    /// Whether the attempt is still in flight.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Cumulative progress counters for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CoordinationStatus {
    /// Attempt these counters belong to.
    pub attempt_id: i64,
    /// Batches fully processed.
    pub completed_batches: i64,
    /// Total batches, known once the producer has enumerated them all.
    pub total_batches: Option<i64>,
    /// Documents processed across all batches.
    pub total_docs_indexed: i64,
    /// Documents that were new to the index.
    pub new_docs_indexed: i64,
    /// Chunks written across all batches.
    pub total_chunks: i64,
    /// Document failures across all batches.
    pub total_failures: i64,
    /// Last time completed_batches advanced (creation time before that).
    pub last_progress_at: DateTime<Utc>,
}

impl CoordinationStatus {
    /// Whether every enumerated batch has been processed.
    pub fn is_complete(&self) -> bool {
        matches!(self.total_batches, Some(total) if self.completed_batches >= total)
    }
}

/// Counter deltas reported by one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProgress {
    /// Documents processed in the batch.
    pub docs_indexed: i64,
    /// Documents new to the index.
    pub new_docs: i64,
    /// Chunks written.
    pub chunks: i64,
    /// Document failures.
    pub failures: i64,
}

/// A monitored resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    /// Resource identifier.
    pub resource_id: i64,
    /// Coarse lifecycle status.
    pub status: ResourceStatus,
    /// Set after repeated consecutive failed attempts.
    pub in_repeated_error_state: bool,
    /// How often to re-run once active (None = never refresh).
    pub refresh_interval_secs: Option<i64>,
    /// When the last successful attempt finished.
    pub last_successful_at: Option<DateTime<Utc>>,
    /// When the resource was registered.
    pub created_at: DateTime<Utc>,
}

/// A document that failed inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFailure {
    /// Failed document, if the failure is attributable to one.
    pub document_id: Option<String>,
    /// Failure message.
    pub message: String,
    /// Underlying cause, if the pipeline captured one.
    pub cause: Option<String>,
}

/// A persisted document failure.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentErrorRecord {
    /// Database primary key.
    pub id: i64,
    /// Attempt that recorded the failure.
    pub attempt_id: i64,
    /// Resource key the document belongs to.
    pub key: ResourceKey,
    /// Failed document.
    pub document_id: Option<String>,
    /// Failure message.
    pub message: String,
    /// Whether a later batch indexed the document successfully.
    pub is_resolved: bool,
    /// When the failure was recorded.
    pub created_at: DateTime<Utc>,
}
