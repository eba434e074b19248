// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handles to the ledger, the fence store and the task queue.

use std::sync::Arc;

use fencepost_core::{FenceStore, Keyspace, Persistence, TaskQueue};

/// Everything a coordinator component talks to.
///
/// Cloning is cheap; every component holds its own copy.
#[derive(Clone)]
pub struct Backends {
    /// Attempts ledger.
    pub persistence: Arc<dyn Persistence>,
    /// Fences, signals and locks.
    pub store: Arc<dyn FenceStore>,
    /// Task-execution service.
    pub queue: Arc<dyn TaskQueue>,
    /// Key layout in the fence store.
    pub keys: Keyspace,
}

impl Backends {
    /// Bundle backends under the default keyspace.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        store: Arc<dyn FenceStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            persistence,
            store,
            queue,
            keys: Keyspace::default(),
        }
    }

    /// Use a custom keyspace.
    pub fn with_keyspace(mut self, keys: Keyspace) -> Self {
        self.keys = keys;
        self
    }
}
