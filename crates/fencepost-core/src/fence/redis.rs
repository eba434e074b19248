// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed fence store.
//!
//! Locks use `SET NX PX` with a random token; renewal and release are Lua
//! compare-and-extend / compare-and-delete scripts so a holder whose lock
//! expired can never touch a lock taken over by someone else.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use tracing::debug;

use super::{FencePayload, FenceStore, LockToken};
use crate::error::StoreError;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Delay between lock acquisition retries.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Number of keys requested per SCAN round trip.
const SCAN_COUNT: usize = 200;

/// Open a multiplexed connection to `url`.
pub async fn connect(url: &str) -> Result<MultiplexedConnection, StoreError> {
    let client = Client::open(url).map_err(|e| StoreError::ConnectionFailed {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| StoreError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

/// Fence store over a shared Redis instance.
#[derive(Clone)]
pub struct RedisFenceStore {
    conn: MultiplexedConnection,
    renew_script: Script,
    release_script: Script,
}

impl RedisFenceStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(connect(url).await?))
    }

    /// Wrap an existing connection.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    async fn try_lock(&self, token: &LockToken, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(&token.name)
            .arg(&token.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl FenceStore for RedisFenceStore {
    async fn set_fence(&self, key: &str, payload: &FencePayload) -> Result<(), StoreError> {
        let value = serde_json::to_string(payload)?;
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_fence(&self, key: &str) -> Result<Option<FencePayload>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn clear_fence(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_fences(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        let token = LockToken::generate(name);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if self.try_lock(&token, ttl).await? {
                return Ok(Some(token));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(lock = %name, "Lock busy, giving up");
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn renew_lock(&self, token: &LockToken, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew_script
            .key(&token.name)
            .arg(&token.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lock(&self, token: &LockToken) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_script
            .key(&token.name)
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn set_signal(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_signal(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn clear_signal(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}
