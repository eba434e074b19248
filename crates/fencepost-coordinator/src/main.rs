// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fencepost Coordinator
//!
//! Runs the background loops that coordinate indexing work:
//! - Dispatcher (creates attempts and submits fetch tasks)
//! - Completion monitor (finalizes finished attempts)
//! - Validator (fails orphaned and stalled attempts, clears stale fences)
//! - Optional in-process task executors

use std::sync::Arc;

use fencepost_core::Persistence;
use fencepost_core::fence::RedisFenceStore;
use fencepost_core::persistence::{PostgresPersistence, SqlitePersistence};
use fencepost_core::queue::{RedisTaskQueue, RedisTaskQueueConfig};
use tracing::{info, warn};

use fencepost_coordinator::config::Config;
use fencepost_coordinator::runtime::CoordinatorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fencepost_coordinator=info,fencepost_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        redis_url = %config.redis_url,
        key_prefix = %config.key_prefix,
        permission_sync = config.permission_sync_enabled,
        executors = config.executor_concurrency,
        "Starting Fencepost Coordinator"
    );

    let persistence = connect_persistence(&config.database_url).await?;
    info!("Database ready");

    let store = RedisFenceStore::connect(&config.redis_url).await?;
    let queue = RedisTaskQueue::connect(RedisTaskQueueConfig {
        key_prefix: config.key_prefix.clone(),
        lease_duration: config.task_lease,
        ..RedisTaskQueueConfig::with_url(&config.redis_url)
    })
    .await?;
    info!("Connected to Redis");

    let runtime = CoordinatorRuntime::builder()
        .with_config(&config)
        .persistence(persistence)
        .store(Arc::new(store))
        .queue(Arc::new(queue))
        .build()?
        .start()
        .await?;

    info!("Coordinator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Fencepost Coordinator shut down");

    Ok(())
}

/// Connect to PostgreSQL, or to SQLite for `sqlite:` URLs, and run migrations.
async fn connect_persistence(database_url: &str) -> anyhow::Result<Arc<dyn Persistence>> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        let persistence = SqlitePersistence::from_path(path).await?;
        return Ok(Arc::new(persistence));
    }

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    fencepost_core::migrations::run_postgres(&pool).await?;
    Ok(Arc::new(PostgresPersistence::new(pool)))
}
