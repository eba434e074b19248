// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fencepost-coordinator.
//!
//! Callers switch on [`CoordinationError::kind`] rather than on concrete
//! variants when deciding whether to retry, fail an attempt or give up.

use fencepost_core::{CoreError, StoreError};
use thiserror::Error;

use crate::pipeline::PipelineError;

/// Coarse classification of a coordination failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Infrastructure hiccup (database, Redis, lock busy). Safe to retry.
    Transient,
    /// The attempt lost its task; the validator fails it.
    Orphaned,
    /// Too many document failures; the attempt was aborted.
    ThresholdBreach,
    /// No progress for longer than the stall ceiling.
    Stalled,
    /// Not retryable: duplicate delivery, cancellation, setup or pipeline failure.
    Fatal,
}

impl ErrorKind {
    /// Stable string for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Orphaned => "orphaned",
            Self::ThresholdBreach => "threshold_breach",
            Self::Stalled => "stalled",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinationError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Ledger persistence failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Fence store or task queue failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another worker holds the batch lock (duplicate delivery).
    #[error("batch {batch_num} of attempt {attempt_id} is already running")]
    AlreadyRunning {
        /// Attempt the batch belongs to.
        attempt_id: i64,
        /// Batch number.
        batch_num: i64,
    },

    /// The batch lock expired mid-run; the batch was abandoned uncounted.
    #[error("lost the lock on batch {batch_num} of attempt {attempt_id}")]
    BatchLockLost {
        /// Attempt the batch belongs to.
        attempt_id: i64,
        /// Batch number.
        batch_num: i64,
    },

    /// A stop signal was observed.
    #[error("attempt {attempt_id} was canceled")]
    Canceled {
        /// Canceled attempt.
        attempt_id: i64,
    },

    /// The failure-threshold circuit breaker tripped.
    #[error("{0}")]
    ThresholdBreach(String),

    /// The fence never carried this task's handle.
    #[error("fence for attempt {attempt_id} was not ready after {waited_secs}s")]
    FenceNotReady {
        /// Attempt the fetch task was started for.
        attempt_id: i64,
        /// How long the task waited.
        waited_secs: u64,
    },

    /// A lock could not be taken within its wait.
    #[error("timed out acquiring lock {name}")]
    LockTimeout {
        /// Lock name.
        name: String,
    },

    /// The document pipeline or source failed.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A reserved task carried an unknown type or malformed arguments.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl CoordinationError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) | Self::LockTimeout { .. } | Self::BatchLockLost { .. } => {
                ErrorKind::Transient
            }
            Self::Core(CoreError::DatabaseError { .. }) => ErrorKind::Transient,
            Self::ThresholdBreach(_) => ErrorKind::ThresholdBreach,
            Self::AlreadyRunning { .. }
            | Self::Canceled { .. }
            | Self::FenceNotReady { .. }
            | Self::Config(_)
            | Self::Core(_)
            | Self::Json(_)
            | Self::Pipeline(_)
            | Self::InvalidTask(_)
            | Self::Other(_) => ErrorKind::Fatal,
        }
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result type using CoordinationError.
pub type Result<T> = std::result::Result<T, CoordinationError>;
