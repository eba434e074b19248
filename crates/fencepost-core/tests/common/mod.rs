// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fencepost-core integration tests.
//!
//! SQLite tests always run against a fresh in-memory database. PostgreSQL
//! tests run only when TEST_FENCEPOST_DATABASE_URL is set.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};

use fencepost_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use fencepost_core::types::ResourceKey;
use sqlx::PgPool;

/// Fresh, migrated in-memory SQLite persistence.
pub async fn sqlite() -> SqlitePersistence {
    SqlitePersistence::in_memory()
        .await
        .expect("Failed to open in-memory SQLite")
}

/// Migrated PostgreSQL persistence, if TEST_FENCEPOST_DATABASE_URL is set.
pub async fn postgres() -> Option<PostgresPersistence> {
    let database_url = std::env::var("TEST_FENCEPOST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    fencepost_core::migrations::run_postgres(&pool).await.ok()?;
    Some(PostgresPersistence::new(pool))
}

/// Resource ids unique across one test binary run so Postgres tests do not collide.
pub fn unique_resource_id() -> i64 {
    static NEXT: AtomicI64 = AtomicI64::new(0);
    let base = chrono::Utc::now().timestamp_micros();
    base + NEXT.fetch_add(1, Ordering::SeqCst)
}

/// Register a resource and an active configuration, returning their key.
pub async fn register_key(persistence: &dyn Persistence, resource_id: i64) -> ResourceKey {
    persistence
        .register_resource(resource_id, Some(3600))
        .await
        .expect("Failed to register resource");
    persistence
        .register_configuration(1, true)
        .await
        .expect("Failed to register configuration");
    ResourceKey::new(resource_id, 1)
}

/// Skip test if PostgreSQL is not available.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_FENCEPOST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_FENCEPOST_DATABASE_URL not set");
            return;
        }
    };
}

/// Redis URL for store and queue tests, if TEST_FENCEPOST_REDIS_URL is set.
pub fn redis_url() -> Option<String> {
    std::env::var("TEST_FENCEPOST_REDIS_URL").ok()
}

/// Key prefix unique to one test so parallel runs do not share keys.
pub fn unique_prefix(name: &str) -> String {
    format!("fp-test-{}-{}", name, uuid::Uuid::new_v4())
}

/// Skip test if Redis is not available.
#[macro_export]
macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("TEST_FENCEPOST_REDIS_URL").is_err() {
            eprintln!("Skipping test: TEST_FENCEPOST_REDIS_URL not set");
            return;
        }
    };
}
