// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed task queue.
//!
//! Layout:
//! - `{prefix}:queue:pending`: list of handles waiting for a worker
//! - `{prefix}:queue:leases`: sorted set of reserved handles scored by lease
//!   deadline (Redis server time, milliseconds)
//! - `{prefix}:task:{handle}`: JSON task message
//! - `{prefix}:task_state:{handle}`: task state
//!
//! Reservation pops a handle from pending and leases it in one Lua script, so
//! a task is always visible in exactly one of the two structures until it
//! completes. Leases that were not renewed in time go back to the pending
//! queue the next time anyone reserves or lists reservations.

use std::time::Duration;

use ::redis::Script;
use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{TaskMessage, TaskQueue, TaskState};
use crate::error::StoreError;
use crate::fence::redis::connect;

/// Requeues expired leases and leaves the server time in `now`.
///
/// KEYS: pending, leases. ARGV[2]: task state key prefix.
const REQUEUE_EXPIRED: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, handle in ipairs(expired) do
    redis.call('ZREM', KEYS[2], handle)
    redis.call('RPUSH', KEYS[1], handle)
    redis.call('SET', ARGV[2] .. handle, 'pending')
end
"#;

/// ARGV[1]: lease in milliseconds.
const RESERVE_TAIL: &str = r#"
local handle = redis.call('RPOP', KEYS[1])
if not handle then
    return false
end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), handle)
return handle
"#;

const LIVE_TAIL: &str = r#"
return redis.call('ZRANGEBYSCORE', KEYS[2], '(' .. now, '+inf')
"#;

/// KEYS: leases. ARGV: handle, lease in milliseconds.
const RENEW_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', KEYS[1], now + tonumber(ARGV[2]), ARGV[1])
return 1
"#;

/// Configuration for the Redis task queue.
#[derive(Debug, Clone)]
pub struct RedisTaskQueueConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix for namespacing
    pub key_prefix: String,
    /// How long terminal task states are kept
    pub terminal_state_ttl: Duration,
    /// Poll interval while waiting for a task in `reserve`
    pub poll_interval: Duration,
    /// How long a reservation survives without renewal
    pub lease_duration: Duration,
}

impl Default for RedisTaskQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "fencepost".to_string(),
            terminal_state_ttl: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_millis(200),
            lease_duration: Duration::from_secs(120),
        }
    }
}

impl RedisTaskQueueConfig {
    /// Create config with custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Task queue over a Redis list and a lease set.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: MultiplexedConnection,
    config: RedisTaskQueueConfig,
    reserve_script: Script,
    live_script: Script,
    renew_script: Script,
}

impl RedisTaskQueue {
    /// Connect using `config`.
    pub async fn connect(config: RedisTaskQueueConfig) -> Result<Self, StoreError> {
        let conn = connect(&config.url).await?;
        Ok(Self {
            conn,
            config,
            reserve_script: Script::new(&format!("{REQUEUE_EXPIRED}{RESERVE_TAIL}")),
            live_script: Script::new(&format!("{REQUEUE_EXPIRED}{LIVE_TAIL}")),
            renew_script: Script::new(RENEW_SCRIPT),
        })
    }

    fn pending_key(&self) -> String {
        format!("{}:queue:pending", self.config.key_prefix)
    }

    fn leases_key(&self) -> String {
        format!("{}:queue:leases", self.config.key_prefix)
    }

    fn state_prefix(&self) -> String {
        format!("{}:task_state:", self.config.key_prefix)
    }

    fn lease_millis(&self) -> u64 {
        (self.config.lease_duration.as_millis() as u64).max(1)
    }

    fn task_key(&self, handle: &str) -> String {
        format!("{}:task:{}", self.config.key_prefix, handle)
    }

    fn state_key(&self, handle: &str) -> String {
        format!("{}{}", self.state_prefix(), handle)
    }

    async fn try_reserve(&self) -> Result<Option<TaskMessage>, StoreError> {
        let mut conn = self.conn.clone();
        let handle: Option<String> = self
            .reserve_script
            .key(self.pending_key())
            .key(self.leases_key())
            .arg(self.lease_millis())
            .arg(self.state_prefix())
            .invoke_async(&mut conn)
            .await?;

        let Some(handle) = handle else {
            return Ok(None);
        };

        let body: Option<String> = ::redis::cmd("GET")
            .arg(self.task_key(&handle))
            .query_async(&mut conn)
            .await?;

        match body {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => {
                // Body expired or was removed; drop the dangling handle.
                warn!(handle = %handle, "Reserved task has no body, discarding");
                let _: i64 = ::redis::cmd("ZREM")
                    .arg(self.leases_key())
                    .arg(&handle)
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn submit(
        &self,
        task_type: &str,
        args: serde_json::Value,
    ) -> Result<String, StoreError> {
        let handle = uuid::Uuid::new_v4().to_string();
        let message = TaskMessage {
            handle: handle.clone(),
            task_type: task_type.to_string(),
            args,
        };
        let body = serde_json::to_string(&message)?;

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.task_key(&handle))
            .arg(body)
            .ignore()
            .cmd("SET")
            .arg(self.state_key(&handle))
            .arg(TaskState::Pending.as_str())
            .ignore()
            .cmd("LPUSH")
            .arg(self.pending_key())
            .arg(&handle)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(handle)
    }

    async fn state(&self, handle: &str) -> Result<TaskState, StoreError> {
        let mut conn = self.conn.clone();
        let state: Option<String> = ::redis::cmd("GET")
            .arg(self.state_key(handle))
            .query_async(&mut conn)
            .await?;
        Ok(state.map_or(TaskState::Unknown, |s| TaskState::parse(&s)))
    }

    async fn is_queued(&self, handle: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let position: Option<i64> = ::redis::cmd("LPOS")
            .arg(self.pending_key())
            .arg(handle)
            .query_async(&mut conn)
            .await?;
        Ok(position.is_some())
    }

    async fn reserved_handles(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let handles: Vec<String> = self
            .live_script
            .key(self.pending_key())
            .key(self.leases_key())
            .arg(self.lease_millis())
            .arg(self.state_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(handles)
    }

    fn lease_duration(&self) -> Duration {
        self.config.lease_duration
    }

    async fn renew_lease(&self, handle: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew_script
            .key(self.leases_key())
            .arg(handle)
            .arg(self.lease_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<TaskMessage>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_reserve().await? {
                return Ok(Some(message));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn start(&self, handle: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(self.state_key(handle))
            .arg(TaskState::Active.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete(&self, handle: &str, success: bool) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let ttl_secs = self.config.terminal_state_ttl.as_secs().max(1);
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.leases_key())
            .arg(handle)
            .ignore()
            // Requeued after its lease lapsed while this worker still ran it.
            .cmd("LREM")
            .arg(self.pending_key())
            .arg(0)
            .arg(handle)
            .ignore()
            .cmd("DEL")
            .arg(self.task_key(handle))
            .ignore()
            .cmd("SET")
            .arg(self.state_key(handle))
            .arg(TaskState::Terminal.as_str())
            .arg("EX")
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if !success {
            debug!(handle = %handle, "Task completed unsuccessfully");
        }
        Ok(())
    }
}
