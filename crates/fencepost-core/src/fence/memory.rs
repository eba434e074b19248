// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory fence store.
//!
//! Same semantics as the Redis store for a single process: expiries use
//! `tokio::time::Instant`, so tests running with a paused clock can expire
//! signals and locks with `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{FencePayload, FenceStore, LockToken};
use crate::error::StoreError;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Fence store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryFenceStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryFenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every key, as if the backing store had been flushed.
    pub async fn flush(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
    }

    async fn remove(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    async fn try_lock(&self, token: &LockToken, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(&token.name).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        entries.insert(
            token.name.clone(),
            Entry {
                value: token.token.clone(),
                expires_at: Some(now + ttl),
            },
        );
        true
    }
}

#[async_trait]
impl FenceStore for MemoryFenceStore {
    async fn set_fence(&self, key: &str, payload: &FencePayload) -> Result<(), StoreError> {
        let value = serde_json::to_string(payload)?;
        self.put(key, value, None).await;
        Ok(())
    }

    async fn get_fence(&self, key: &str) -> Result<Option<FencePayload>, StoreError> {
        match self.get(key).await {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn clear_fence(&self, key: &str) -> Result<(), StoreError> {
        self.remove(key).await;
        Ok(())
    }

    async fn list_fences(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        let token = LockToken::generate(name);
        let deadline = Instant::now() + wait;

        loop {
            if self.try_lock(&token, ttl).await {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn renew_lock(&self, token: &LockToken, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&token.name) {
            Some(entry) if entry.is_live(now) && entry.value == token.token => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, token: &LockToken) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let owned = entries
            .get(&token.name)
            .is_some_and(|e| e.is_live(now) && e.value == token.token);
        if owned {
            entries.remove(&token.name);
        }
        Ok(owned)
    }

    async fn set_signal(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.put(key, value.to_string(), ttl).await;
        Ok(())
    }

    async fn get_signal(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(key).await)
    }

    async fn clear_signal(&self, key: &str) -> Result<(), StoreError> {
        self.remove(key).await;
        Ok(())
    }
}
