// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Held-lock guard over [`FenceStore`] locks.
//!
//! Releasing is explicit and async, so callers follow
//! `let result = work().await; lock.release(&ctx).await; result`.

use std::time::Duration;

use fencepost_core::{FenceStore, LockToken};
use tracing::{debug, error};

use crate::context::LogContext;
use crate::error::Result;

/// A lock held by this process.
pub struct HeldLock<'a> {
    store: &'a dyn FenceStore,
    token: LockToken,
    ttl: Duration,
}

impl<'a> HeldLock<'a> {
    /// Try to take `name` (a full lock key) for `ttl`, waiting at most `wait`.
    ///
    /// Returns None if another holder kept it for the whole wait.
    pub async fn acquire(
        store: &'a dyn FenceStore,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<HeldLock<'a>>> {
        let token = store.acquire_lock(name, ttl, wait).await?;
        Ok(token.map(|token| HeldLock { store, token, ttl }))
    }

    /// Lock key.
    pub fn name(&self) -> &str {
        &self.token.name
    }

    /// Extend the lock by another TTL. Returns false if it was lost.
    pub async fn reacquire(&self) -> Result<bool> {
        Ok(self.store.renew_lock(&self.token, self.ttl).await?)
    }

    /// Release the lock. A lock that is no longer owned is logged, never raised.
    pub async fn release(self, ctx: &LogContext) {
        match self.store.release_lock(&self.token).await {
            Ok(true) => debug!(ctx = %ctx, lock = %self.token.name, "Lock released"),
            Ok(false) => error!(
                ctx = %ctx,
                lock = %self.token.name,
                "Lock was not owned on release"
            ),
            Err(e) => error!(
                ctx = %ctx,
                lock = %self.token.name,
                error = %e,
                "Failed to release lock"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fencepost_core::fence::MemoryFenceStore;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_exclusive_until_release() {
        let store = MemoryFenceStore::new();
        let ctx = LogContext::default();
        let ttl = Duration::from_secs(10);

        let held = HeldLock::acquire(&store, "fp:lock:a", ttl, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.name(), "fp:lock:a");

        let second = HeldLock::acquire(&store, "fp:lock:a", ttl, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(second.is_none());

        held.release(&ctx).await;
        assert!(
            HeldLock::acquire(&store, "fp:lock:a", ttl, Duration::ZERO)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_after_expiry_fails() {
        let store = MemoryFenceStore::new();
        let held = HeldLock::acquire(&store, "fp:lock:b", Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert!(held.reacquire().await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!held.reacquire().await.unwrap());

        // Logged, not raised.
        held.release(&LogContext::default()).await;
    }
}
