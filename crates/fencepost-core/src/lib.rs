// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fencepost Core - coordination primitives
//!
//! This crate holds the shared state that independent worker processes use to
//! agree on which resource is being processed, whether that work is still
//! alive, and when a multi-batch job has finished.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   fencepost-coordinator                       │
//! │   dispatcher · fetch task · batch worker · validator · monitor│
//! └──────────────────────────────────────────────────────────────┘
//!        │                      │                         │
//!        ▼                      ▼                         ▼
//! ┌──────────────┐   ┌──────────────────────┐   ┌──────────────────┐
//! │ Persistence  │   │     FenceStore       │   │    TaskQueue     │
//! │ attempts,    │   │ fences, signals,     │   │ pending queue,   │
//! │ ledger, docs │   │ locks                │   │ reservation set  │
//! └──────────────┘   └──────────────────────┘   └──────────────────┘
//!        │                      │                         │
//!        ▼                      ▼                         ▼
//!  PostgreSQL/SQLite          Redis / memory           Redis / mock
//! ```
//!
//! # Durability
//!
//! | State | Store | Survives restart |
//! |-------|-------|------------------|
//! | Attempts, coordination ledger, document errors | [`persistence`] | yes |
//! | Fences, active/stop/completion signals, locks | [`fence`] | no (recovered by the validator) |
//! | Pending and reserved tasks | [`queue`] | depends on the backend |
//!
//! # Invariants
//!
//! - At most one in-flight attempt exists per (kind, resource, configuration);
//!   the database enforces it with a partial unique index.
//! - An attempt becomes terminal exactly once: every terminal write is
//!   conditional on the attempt still being in flight.
//! - `completed_batches` never decreases, never exceeds a known
//!   `total_batches`, and counts each batch number once.

#![deny(missing_docs)]

/// Error types for persistence and the key-value store.
pub mod error;

/// Fence store: fences, signals and locks.
pub mod fence;

/// Embedded database migrations.
pub mod migrations;

/// Attempts ledger persistence (PostgreSQL and SQLite).
pub mod persistence;

/// Task-execution service adapters.
pub mod queue;

/// Domain types.
pub mod types;

pub use error::{CoreError, StoreError};
pub use fence::{FencePayload, FenceStore, Keyspace, LockToken, Signal};
pub use persistence::Persistence;
pub use queue::{TaskMessage, TaskQueue, TaskState};
pub use types::{
    AttemptRecord, AttemptStatus, BatchProgress, CoordinationStatus, DocumentErrorRecord,
    DocumentFailure, FenceKind, ResourceKey, ResourceRecord, ResourceStatus, WorkKind,
};
