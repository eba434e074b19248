// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL (`sqlite:` URLs select the embedded backend)
    pub database_url: String,
    /// Redis URL for the fence store and task queue
    pub redis_url: String,
    /// Namespace prefix for every Redis key
    pub key_prefix: String,
    /// Dispatcher tick
    pub dispatch_interval: Duration,
    /// Completion monitor tick
    pub monitor_interval: Duration,
    /// Validator tick, also the TTL of its rate-limit signal
    pub validator_interval: Duration,
    /// TTL of the per-fence active signal
    pub active_signal_ttl: Duration,
    /// Attempts without progress for this long are failed as stalled
    pub stall_timeout: Duration,
    /// Task reservations not renewed for this long are requeued
    pub task_lease: Duration,
    /// Run the permission-sync dispatcher, monitor and validator as well
    pub permission_sync_enabled: bool,
    /// Number of in-process task executors (0 = coordinator only)
    pub executor_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FENCEPOST_DATABASE_URL`
    ///
    /// Optional (with defaults):
    /// - `FENCEPOST_REDIS_URL` (redis://127.0.0.1:6379)
    /// - `FENCEPOST_KEY_PREFIX` (fencepost)
    /// - `FENCEPOST_DISPATCH_INTERVAL_SECS` (15)
    /// - `FENCEPOST_MONITOR_INTERVAL_SECS` (15)
    /// - `FENCEPOST_VALIDATOR_INTERVAL_SECS` (60)
    /// - `FENCEPOST_ACTIVE_SIGNAL_TTL_SECS` (300)
    /// - `FENCEPOST_STALL_TIMEOUT_SECS` (10800)
    /// - `FENCEPOST_TASK_LEASE_SECS` (120)
    /// - `FENCEPOST_PERMISSION_SYNC_ENABLED` (false)
    /// - `FENCEPOST_EXECUTOR_CONCURRENCY` (0)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FENCEPOST_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FENCEPOST_DATABASE_URL"))?;

        let redis_url = std::env::var("FENCEPOST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let key_prefix =
            std::env::var("FENCEPOST_KEY_PREFIX").unwrap_or_else(|_| "fencepost".to_string());
        if key_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "FENCEPOST_KEY_PREFIX",
                "must not be empty",
            ));
        }

        let permission_sync_enabled = std::env::var("FENCEPOST_PERMISSION_SYNC_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let executor_concurrency: usize = std::env::var("FENCEPOST_EXECUTOR_CONCURRENCY")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FENCEPOST_EXECUTOR_CONCURRENCY",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            database_url,
            redis_url,
            key_prefix,
            dispatch_interval: secs_var("FENCEPOST_DISPATCH_INTERVAL_SECS", 15)?,
            monitor_interval: secs_var("FENCEPOST_MONITOR_INTERVAL_SECS", 15)?,
            validator_interval: secs_var("FENCEPOST_VALIDATOR_INTERVAL_SECS", 60)?,
            active_signal_ttl: secs_var("FENCEPOST_ACTIVE_SIGNAL_TTL_SECS", 300)?,
            stall_timeout: secs_var("FENCEPOST_STALL_TIMEOUT_SECS", 3 * 60 * 60)?,
            task_lease: secs_var("FENCEPOST_TASK_LEASE_SECS", 120)?,
            permission_sync_enabled,
            executor_concurrency,
        })
    }
}

/// Parse a positive number of seconds from `var`, falling back to `default`.
fn secs_var(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a positive number of seconds"))?,
        Err(_) => default,
    };
    if secs == 0 {
        return Err(ConfigError::Invalid(var, "must be a positive number of seconds"));
    }
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
