// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fencepost Coordinator - distributed indexing coordination
//!
//! Independent worker processes use this crate to agree on which
//! (resource, configuration) pair is being indexed, to notice when that work
//! has been orphaned by a crash, and to decide when a multi-batch attempt has
//! succeeded, partially succeeded, failed or stalled. There is no central
//! coordinator: every component talks only to the ledger database and the
//! fence store, and every tick is safe to run concurrently from many
//! processes.
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────┐  submit fetch   ┌────────────┐  submit batches  ┌──────────────┐
//!   │ Dispatcher │ ──────────────► │ Fetch task │ ───────────────► │ Batch worker │
//!   └────────────┘                 └────────────┘                  └──────────────┘
//!         │ fence + attempt              │ total_batches                  │ ledger
//!         ▼                              ▼                                ▼
//!   ┌──────────────────────────────────────────────────────────────────────────┐
//!   │        fence store (fences, signals, locks)  ·  ledger database          │
//!   └──────────────────────────────────────────────────────────────────────────┘
//!         ▲                              ▲
//!         │ orphan / stall / stale       │ completion
//!   ┌────────────┐                 ┌────────────┐       ┌──────────────────────┐
//!   │ Validator  │                 │  Monitor   │ ────► │ Resource state       │
//!   └────────────┘                 └────────────┘       │ machine              │
//!                                                       └──────────────────────┘
//! ```
//!
//! # Attempt lifecycle
//!
//! ```text
//!   NOT_STARTED ──fetch task starts──► IN_PROGRESS ──all batches counted──► SUCCEEDED
//!        │                                  │                              PARTIALLY_SUCCEEDED
//!        │                                  ├──completion signal──────────► FAILED / CANCELED
//!        └────── validator (no handle, orphaned, stalled) ────────────────► FAILED
//! ```
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the `FENCEPOST_*` environment
//! variables read by the binary.

#![deny(missing_docs)]

/// Shared handles to the ledger, the fence store and the task queue.
pub mod backends;

/// Batch worker: processes one batch and reports it to the ledger.
pub mod batch_worker;

/// Configuration loaded from environment variables.
pub mod config;

/// Log context carried through every coordinator operation.
pub mod context;

/// Work dispatcher.
pub mod dispatcher;

/// Error types for coordinator operations.
pub mod error;

/// Task executor loop.
pub mod executor;

/// Typed fence and signal access.
pub mod fences;

/// Held-lock guard.
pub mod lock;

/// Completion monitor.
pub mod monitor;

/// Document pipeline and source interfaces.
pub mod pipeline;

/// Fetch (producer) task.
pub mod producer;

/// Resource lifecycle state machine.
pub mod resource_state;

/// Embeddable runtime.
pub mod runtime;

/// Task payloads.
pub mod tasks;

/// Fence and attempt validator (watchdog).
pub mod validator;

pub use backends::Backends;
pub use config::Config;
pub use context::LogContext;
pub use error::{CoordinationError, ErrorKind};
