// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fence store: ephemeral fences, signals and short-lived locks.
//!
//! A fence marks a resource key as claimed by an in-flight attempt. Signals
//! (active, stop, completion) hang off the same scope. Locks are
//! timeout-bound mutual-exclusion tokens that must be renewed during long
//! critical sections.
//!
//! The store itself is key-agnostic; [`Keyspace`] builds every key the
//! coordinator uses so both backends share one layout:
//!
//! ```text
//! {prefix}:fence:{kind}:{scope}
//! {prefix}:signal:{signal}:{kind}:{scope}
//! {prefix}:lock:{name}
//! {prefix}:marker:{name}
//! ```

pub mod memory;
pub mod redis;

pub use self::memory::MemoryFenceStore;
pub use self::redis::RedisFenceStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{FenceKind, ResourceKey};

/// Value stored under a fence key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencePayload {
    /// Attempt that owns the fence.
    pub attempt_id: i64,
    /// Handle of the task submitted for the attempt.
    pub task_handle: Option<String>,
    /// When the dispatcher wrote the fence.
    pub submitted_at: DateTime<Utc>,
    /// When the fetch task started (None until then).
    pub started_at: Option<DateTime<Utc>>,
}

/// Proof of lock ownership returned by [`FenceStore::acquire_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    /// Full lock key.
    pub name: String,
    /// Random value identifying this holder.
    pub token: String,
}

impl LockToken {
    pub(crate) fn generate(name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Auxiliary per-fence signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Short-TTL liveness marker refreshed by running tasks.
    Active,
    /// Cooperative cancellation request.
    Stop,
    /// Terminal error or canceled marker written by workers for the monitor.
    Completion,
    /// JSON list of batch task handles submitted for the attempt.
    Taskset,
}

impl Signal {
    /// Every signal kind.
    pub const ALL: [Signal; 4] = [
        Signal::Active,
        Signal::Stop,
        Signal::Completion,
        Signal::Taskset,
    ];

    /// Stable string used in keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stop => "stop",
            Self::Completion => "completion",
            Self::Taskset => "taskset",
        }
    }
}

/// Builds fence, signal and lock keys under a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("fencepost")
    }
}

impl Keyspace {
    /// Create a keyspace rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Fence key for `kind` on `key`.
    pub fn fence(&self, kind: FenceKind, key: &ResourceKey) -> String {
        format!("{}{}", self.fence_prefix(kind), kind.scope(key))
    }

    /// Prefix shared by every fence of `kind`.
    pub fn fence_prefix(&self, kind: FenceKind) -> String {
        format!("{}:fence:{}:", self.prefix, kind.as_str())
    }

    /// Signal key for `kind` on `key`.
    pub fn signal(&self, signal: Signal, kind: FenceKind, key: &ResourceKey) -> String {
        format!(
            "{}:signal:{}:{}:{}",
            self.prefix,
            signal.as_str(),
            kind.as_str(),
            kind.scope(key)
        )
    }

    /// Lock key for `name`.
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    /// Free-standing marker key for `name` (rate limits and similar).
    pub fn marker(&self, name: &str) -> String {
        format!("{}:marker:{}", self.prefix, name)
    }

    /// Recover the resource key from a per-configuration fence key.
    ///
    /// Returns None for resource-scoped kinds and for keys outside this keyspace.
    pub fn parse_fence_key(&self, kind: FenceKind, fence_key: &str) -> Option<ResourceKey> {
        let scope = fence_key.strip_prefix(&self.fence_prefix(kind))?;
        let (resource, configuration) = scope.split_once('/')?;
        Some(ResourceKey::new(
            resource.parse().ok()?,
            configuration.parse().ok()?,
        ))
    }
}

/// Distributed key-value store backing fences, signals and locks.
#[async_trait]
pub trait FenceStore: Send + Sync {
    /// Write a fence. Overwrites unconditionally; callers hold a lock first.
    async fn set_fence(&self, key: &str, payload: &FencePayload) -> Result<(), StoreError>;

    /// Read a fence.
    async fn get_fence(&self, key: &str) -> Result<Option<FencePayload>, StoreError>;

    /// Remove a fence. Missing fences are not an error.
    async fn clear_fence(&self, key: &str) -> Result<(), StoreError>;

    /// Keys of every fence starting with `prefix`.
    async fn list_fences(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Try to take a lock for `ttl`, retrying for at most `wait`.
    ///
    /// Returns None if another holder kept the lock for the whole wait.
    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockToken>, StoreError>;

    /// Extend a held lock to `ttl` from now. Returns false if no longer owned.
    async fn renew_lock(&self, token: &LockToken, ttl: Duration) -> Result<bool, StoreError>;

    /// Release a held lock. Returns false if no longer owned.
    async fn release_lock(&self, token: &LockToken) -> Result<bool, StoreError>;

    /// Set a signal, optionally expiring after `ttl`.
    async fn set_signal(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Read a signal.
    async fn get_signal(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove a signal.
    async fn clear_signal(&self, key: &str) -> Result<(), StoreError>;

    /// Refresh a liveness signal.
    async fn set_active_signal(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.set_signal(key, "1", Some(ttl)).await
    }

    /// Whether a liveness signal is still set.
    async fn is_active(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get_signal(key).await?.is_some())
    }
}
