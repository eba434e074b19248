// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed view over one fence and its signals.

use std::time::Duration;

use fencepost_core::{FenceKind, FencePayload, ResourceKey, Signal, WorkKind};
use serde::{Deserialize, Serialize};

use crate::backends::Backends;
use crate::error::Result;

/// Terminal outcome written by workers for the completion monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionSignal {
    /// The attempt must be failed with `reason`.
    Failed {
        /// Human-readable reason stored on the attempt.
        reason: String,
    },
    /// The attempt stopped on request.
    Canceled,
}

/// Completion signal as stored, tagged with the attempt that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopedCompletion {
    attempt_id: i64,
    #[serde(flatten)]
    signal: CompletionSignal,
}

/// A fence for one (kind, resource key) plus its active, stop, completion and
/// taskset signals.
pub struct ResourceFence<'a> {
    backends: &'a Backends,
    kind: FenceKind,
    key: ResourceKey,
}

impl<'a> ResourceFence<'a> {
    /// Fence claimed by attempts of `kind` on `key`.
    pub fn new(backends: &'a Backends, kind: WorkKind, key: ResourceKey) -> Self {
        Self::of_kind(backends, kind.fence_kind(), key)
    }

    /// Fence of an arbitrary kind (used for conflict checks).
    pub fn of_kind(backends: &'a Backends, kind: FenceKind, key: ResourceKey) -> Self {
        Self {
            backends,
            kind,
            key,
        }
    }

    /// Full fence key.
    pub fn fence_key(&self) -> String {
        self.backends.keys.fence(self.kind, &self.key)
    }

    fn signal_key(&self, signal: Signal) -> String {
        self.backends.keys.signal(signal, self.kind, &self.key)
    }

    /// Current payload, if the fence exists.
    pub async fn payload(&self) -> Result<Option<FencePayload>> {
        Ok(self.backends.store.get_fence(&self.fence_key()).await?)
    }

    /// Whether the fence exists.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.payload().await?.is_some())
    }

    /// Write the payload.
    pub async fn set_payload(&self, payload: &FencePayload) -> Result<()> {
        Ok(self.backends.store.set_fence(&self.fence_key(), payload).await?)
    }

    /// Refresh the active signal.
    pub async fn set_active(&self, ttl: Duration) -> Result<()> {
        Ok(self
            .backends
            .store
            .set_active_signal(&self.signal_key(Signal::Active), ttl)
            .await?)
    }

    /// Whether the active signal has not expired yet.
    pub async fn is_active(&self) -> Result<bool> {
        Ok(self
            .backends
            .store
            .is_active(&self.signal_key(Signal::Active))
            .await?)
    }

    /// Ask every worker of `attempt_id` to stop.
    pub async fn request_stop(&self, attempt_id: i64) -> Result<()> {
        Ok(self
            .backends
            .store
            .set_signal(&self.signal_key(Signal::Stop), &attempt_id.to_string(), None)
            .await?)
    }

    /// Whether a stop was requested for `attempt_id`.
    ///
    /// A stop left behind by another attempt on the same key is ignored.
    pub async fn should_stop(&self, attempt_id: i64) -> Result<bool> {
        let raw = self
            .backends
            .store
            .get_signal(&self.signal_key(Signal::Stop))
            .await?;
        Ok(raw.and_then(|raw| raw.parse::<i64>().ok()) == Some(attempt_id))
    }

    /// Record the terminal outcome of `attempt_id` for the monitor.
    pub async fn set_completion(&self, attempt_id: i64, signal: &CompletionSignal) -> Result<()> {
        let value = serde_json::to_string(&ScopedCompletion {
            attempt_id,
            signal: signal.clone(),
        })?;
        Ok(self
            .backends
            .store
            .set_signal(&self.signal_key(Signal::Completion), &value, None)
            .await?)
    }

    /// Recorded terminal outcome of `attempt_id`, if any.
    ///
    /// Outcomes written for another attempt, or values that do not parse, are
    /// ignored.
    pub async fn completion(&self, attempt_id: i64) -> Result<Option<CompletionSignal>> {
        let raw = self
            .backends
            .store
            .get_signal(&self.signal_key(Signal::Completion))
            .await?;
        Ok(raw
            .and_then(|raw| serde_json::from_str::<ScopedCompletion>(&raw).ok())
            .filter(|scoped| scoped.attempt_id == attempt_id)
            .map(|scoped| scoped.signal))
    }

    /// Handles of the batch tasks submitted so far.
    pub async fn taskset(&self) -> Result<Vec<String>> {
        let raw = self
            .backends
            .store
            .get_signal(&self.signal_key(Signal::Taskset))
            .await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the taskset. Only the fetch task writes it.
    pub async fn set_taskset(&self, handles: &[String]) -> Result<()> {
        let value = serde_json::to_string(handles)?;
        Ok(self
            .backends
            .store
            .set_signal(&self.signal_key(Signal::Taskset), &value, None)
            .await?)
    }

    /// Clear every signal but keep the fence.
    pub async fn clear_signals(&self) -> Result<()> {
        for signal in Signal::ALL {
            self.backends
                .store
                .clear_signal(&self.signal_key(signal))
                .await?;
        }
        Ok(())
    }

    /// Clear the fence and every signal.
    pub async fn reset(&self) -> Result<()> {
        self.backends.store.clear_fence(&self.fence_key()).await?;
        self.clear_signals().await
    }

    /// Reset only if the fence still belongs to `attempt_id` (or is already gone).
    ///
    /// Returns false when a newer attempt owns the fence.
    pub async fn reset_if_owned(&self, attempt_id: i64) -> Result<bool> {
        match self.payload().await? {
            Some(payload) if payload.attempt_id != attempt_id => Ok(false),
            _ => {
                self.reset().await?;
                Ok(true)
            }
        }
    }
}
