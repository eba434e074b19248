// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for the attempts ledger.
//!
//! Each operation is a free function over a [`PgPool`]; [`PostgresPersistence`]
//! delegates to them so callers that only hold a pool can use them directly.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CoreError;
use crate::types::{
    AttemptRecord, AttemptStatus, BatchProgress, CoordinationStatus, DocumentErrorRecord,
    DocumentFailure, ResourceKey, ResourceRecord, ResourceStatus, WorkKind,
};

use super::{
    AttemptRow, DocumentErrorRow, Persistence, ResourceRow, attempts_from_rows, failure_message,
    map_create_attempt_error,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Resource Operations
// ============================================================================

/// Register a resource in SCHEDULED state.
pub async fn register_resource(
    pool: &PgPool,
    resource_id: i64,
    refresh_interval_secs: Option<i64>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO resources (resource_id, status, refresh_interval_secs, created_at)
        VALUES ($1, 'scheduled', $2, $3)
        ON CONFLICT (resource_id) DO NOTHING
        "#,
    )
    .bind(resource_id)
    .bind(refresh_interval_secs)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a resource by ID.
pub async fn get_resource(
    pool: &PgPool,
    resource_id: i64,
) -> Result<Option<ResourceRecord>, CoreError> {
    let row = sqlx::query_as::<_, ResourceRow>(
        r#"
        SELECT resource_id, status, in_repeated_error_state, refresh_interval_secs,
               last_successful_at, created_at
        FROM resources
        WHERE resource_id = $1
        "#,
    )
    .bind(resource_id)
    .fetch_optional(pool)
    .await?;

    row.map(ResourceRecord::try_from).transpose()
}

/// List every resource.
pub async fn list_resources(pool: &PgPool) -> Result<Vec<ResourceRecord>, CoreError> {
    let rows = sqlx::query_as::<_, ResourceRow>(
        r#"
        SELECT resource_id, status, in_repeated_error_state, refresh_interval_secs,
               last_successful_at, created_at
        FROM resources
        ORDER BY resource_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ResourceRecord::try_from).collect()
}

/// Persist resource lifecycle fields.
pub async fn save_resource_state(
    pool: &PgPool,
    resource_id: i64,
    status: ResourceStatus,
    in_repeated_error_state: bool,
    last_successful_at: Option<DateTime<Utc>>,
) -> Result<(), CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE resources
        SET status = $2, in_repeated_error_state = $3, last_successful_at = $4
        WHERE resource_id = $1
        "#,
    )
    .bind(resource_id)
    .bind(status.as_str())
    .bind(in_repeated_error_state)
    .bind(last_successful_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::ResourceNotFound { resource_id });
    }

    Ok(())
}

/// Delete a resource (attempts cascade).
pub async fn delete_resource(pool: &PgPool, resource_id: i64) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM resources WHERE resource_id = $1")
        .bind(resource_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert or update a configuration.
pub async fn register_configuration(
    pool: &PgPool,
    configuration_id: i64,
    is_active: bool,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO configurations (configuration_id, is_active, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (configuration_id) DO UPDATE SET is_active = EXCLUDED.is_active
        "#,
    )
    .bind(configuration_id)
    .bind(is_active)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// IDs of active configurations.
pub async fn list_active_configurations(pool: &PgPool) -> Result<Vec<i64>, CoreError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT configuration_id FROM configurations WHERE is_active ORDER BY configuration_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

// ============================================================================
// Attempt Operations
// ============================================================================

/// Create an attempt and its ledger row.
pub async fn create_attempt(
    pool: &PgPool,
    key: ResourceKey,
    kind: WorkKind,
) -> Result<AttemptRecord, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, AttemptRow>(
        r#"
        INSERT INTO attempts (kind, resource_id, configuration_id, status, created_at)
        VALUES ($1, $2, $3, 'not_started', $4)
        RETURNING attempt_id, kind, resource_id, configuration_id, status, task_handle,
                  created_at, started_at, finished_at, failure_reason
        "#,
    )
    .bind(kind.as_str())
    .bind(key.resource_id)
    .bind(key.configuration_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| map_create_attempt_error(e, key, kind))?;

    sqlx::query(
        r#"
        INSERT INTO coordination_status (attempt_id, last_progress_at)
        VALUES ($1, $2)
        "#,
    )
    .bind(row.attempt_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    AttemptRecord::try_from(row)
}

/// Get an attempt by ID.
pub async fn get_attempt(pool: &PgPool, attempt_id: i64) -> Result<Option<AttemptRecord>, CoreError> {
    let row = sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
               created_at, started_at, finished_at, failure_reason
        FROM attempts
        WHERE attempt_id = $1
        "#,
    )
    .bind(attempt_id)
    .fetch_optional(pool)
    .await?;

    row.map(AttemptRecord::try_from).transpose()
}

/// Persist the task handle returned by the task queue.
pub async fn set_attempt_task_handle(
    pool: &PgPool,
    attempt_id: i64,
    task_handle: &str,
) -> Result<(), CoreError> {
    let result = sqlx::query("UPDATE attempts SET task_handle = $2 WHERE attempt_id = $1")
        .bind(attempt_id)
        .bind(task_handle)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::AttemptNotFound { attempt_id });
    }

    Ok(())
}

/// Move an in-flight attempt to IN_PROGRESS.
pub async fn mark_attempt_in_progress(pool: &PgPool, attempt_id: i64) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE attempts
        SET status = 'in_progress', started_at = COALESCE(started_at, $2)
        WHERE attempt_id = $1
          AND status IN ('not_started', 'in_progress')
        "#,
    )
    .bind(attempt_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Write a terminal status if the attempt is still in flight.
pub async fn complete_attempt_if_active(
    pool: &PgPool,
    attempt_id: i64,
    status: AttemptStatus,
    failure_reason: Option<&str>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE attempts
        SET status = $2,
            finished_at = $3,
            failure_reason = COALESCE($4, failure_reason)
        WHERE attempt_id = $1
          AND status IN ('not_started', 'in_progress')
        "#,
    )
    .bind(attempt_id)
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(failure_reason)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// In-flight attempts of a kind, oldest first.
pub async fn list_active_attempts(
    pool: &PgPool,
    kind: WorkKind,
) -> Result<Vec<AttemptRecord>, CoreError> {
    let rows = sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
               created_at, started_at, finished_at, failure_reason
        FROM attempts
        WHERE kind = $1
          AND status IN ('not_started', 'in_progress')
        ORDER BY attempt_id
        "#,
    )
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;

    attempts_from_rows(rows)
}

/// Most recently created attempt for a key.
pub async fn latest_attempt(
    pool: &PgPool,
    key: ResourceKey,
    kind: WorkKind,
) -> Result<Option<AttemptRecord>, CoreError> {
    let row = sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
               created_at, started_at, finished_at, failure_reason
        FROM attempts
        WHERE kind = $1 AND resource_id = $2 AND configuration_id = $3
        ORDER BY attempt_id DESC
        LIMIT 1
        "#,
    )
    .bind(kind.as_str())
    .bind(key.resource_id)
    .bind(key.configuration_id)
    .fetch_optional(pool)
    .await?;

    row.map(AttemptRecord::try_from).transpose()
}

/// Most recent terminal attempts for a key, newest first.
pub async fn list_recent_completed_attempts(
    pool: &PgPool,
    key: ResourceKey,
    kind: WorkKind,
    limit: i64,
) -> Result<Vec<AttemptRecord>, CoreError> {
    let rows = sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
               created_at, started_at, finished_at, failure_reason
        FROM attempts
        WHERE kind = $1 AND resource_id = $2 AND configuration_id = $3
          AND status NOT IN ('not_started', 'in_progress')
        ORDER BY attempt_id DESC
        LIMIT $4
        "#,
    )
    .bind(kind.as_str())
    .bind(key.resource_id)
    .bind(key.configuration_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    attempts_from_rows(rows)
}

// ============================================================================
// Coordination Ledger Operations
// ============================================================================

/// Get the ledger row for an attempt.
pub async fn get_coordination_status(
    pool: &PgPool,
    attempt_id: i64,
) -> Result<Option<CoordinationStatus>, CoreError> {
    let status = sqlx::query_as::<_, CoordinationStatus>(
        r#"
        SELECT attempt_id, completed_batches, total_batches, total_docs_indexed,
               new_docs_indexed, total_chunks, total_failures, last_progress_at
        FROM coordination_status
        WHERE attempt_id = $1
        "#,
    )
    .bind(attempt_id)
    .fetch_optional(pool)
    .await?;

    Ok(status)
}

/// Count one batch and accumulate its counters, once per (attempt, batch).
pub async fn record_batch_progress(
    pool: &PgPool,
    attempt_id: i64,
    batch_num: i64,
    progress: &BatchProgress,
) -> Result<Option<CoordinationStatus>, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO coordination_batches (attempt_id, batch_num, completed_at)
        SELECT $1, $2, $3
        WHERE EXISTS (SELECT 1 FROM coordination_status WHERE attempt_id = $1)
        ON CONFLICT (attempt_id, batch_num) DO NOTHING
        "#,
    )
    .bind(attempt_id)
    .bind(batch_num)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    let status = sqlx::query_as::<_, CoordinationStatus>(
        r#"
        UPDATE coordination_status
        SET completed_batches = completed_batches + 1,
            total_docs_indexed = total_docs_indexed + $2,
            new_docs_indexed = new_docs_indexed + $3,
            total_chunks = total_chunks + $4,
            total_failures = total_failures + $5,
            last_progress_at = $6
        WHERE attempt_id = $1
          AND (total_batches IS NULL OR completed_batches < total_batches)
        RETURNING attempt_id, completed_batches, total_batches, total_docs_indexed,
                  new_docs_indexed, total_chunks, total_failures, last_progress_at
        "#,
    )
    .bind(attempt_id)
    .bind(progress.docs_indexed)
    .bind(progress.new_docs)
    .bind(progress.chunks)
    .bind(progress.failures)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    match status {
        Some(status) => {
            tx.commit().await?;
            Ok(Some(status))
        }
        None => {
            tx.rollback().await?;
            Ok(None)
        }
    }
}

/// Record the total batch count.
pub async fn set_total_batches(
    pool: &PgPool,
    attempt_id: i64,
    total_batches: i64,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE coordination_status
        SET total_batches = $2
        WHERE attempt_id = $1
          AND completed_batches <= $2
        "#,
    )
    .bind(attempt_id)
    .bind(total_batches)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete the ledger row and its per-batch rows.
pub async fn delete_coordination_status(pool: &PgPool, attempt_id: i64) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM coordination_batches WHERE attempt_id = $1")
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM coordination_status WHERE attempt_id = $1")
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Document Error Operations
// ============================================================================

/// Record per-document failures for an attempt.
pub async fn record_document_errors(
    pool: &PgPool,
    attempt_id: i64,
    key: ResourceKey,
    failures: &[DocumentFailure],
) -> Result<(), CoreError> {
    if failures.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;

    for failure in failures {
        sqlx::query(
            r#"
            INSERT INTO document_errors
                (attempt_id, resource_id, configuration_id, document_id, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt_id)
        .bind(key.resource_id)
        .bind(key.configuration_id)
        .bind(failure.document_id.as_deref())
        .bind(failure_message(failure))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Resolve errors for documents that have since been indexed.
pub async fn resolve_document_errors(
    pool: &PgPool,
    key: ResourceKey,
    document_ids: &[String],
) -> Result<u64, CoreError> {
    if document_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        UPDATE document_errors
        SET is_resolved = TRUE
        WHERE resource_id = $1 AND configuration_id = $2
          AND NOT is_resolved
          AND document_id = ANY($3)
        "#,
    )
    .bind(key.resource_id)
    .bind(key.configuration_id)
    .bind(document_ids)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Unresolved document errors for a key, oldest first.
pub async fn list_unresolved_document_errors(
    pool: &PgPool,
    key: ResourceKey,
) -> Result<Vec<DocumentErrorRecord>, CoreError> {
    let rows = sqlx::query_as::<_, DocumentErrorRow>(
        r#"
        SELECT id, attempt_id, resource_id, configuration_id, document_id, message,
               is_resolved, created_at
        FROM document_errors
        WHERE resource_id = $1 AND configuration_id = $2 AND NOT is_resolved
        ORDER BY id
        "#,
    )
    .bind(key.resource_id)
    .bind(key.configuration_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(DocumentErrorRecord::from).collect())
}

// ============================================================================
// Persistence Implementation
// ============================================================================

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn register_resource(
        &self,
        resource_id: i64,
        refresh_interval_secs: Option<i64>,
    ) -> Result<(), CoreError> {
        register_resource(&self.pool, resource_id, refresh_interval_secs).await
    }

    async fn get_resource(&self, resource_id: i64) -> Result<Option<ResourceRecord>, CoreError> {
        get_resource(&self.pool, resource_id).await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceRecord>, CoreError> {
        list_resources(&self.pool).await
    }

    async fn save_resource_state(
        &self,
        resource_id: i64,
        status: ResourceStatus,
        in_repeated_error_state: bool,
        last_successful_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        save_resource_state(
            &self.pool,
            resource_id,
            status,
            in_repeated_error_state,
            last_successful_at,
        )
        .await
    }

    async fn delete_resource(&self, resource_id: i64) -> Result<bool, CoreError> {
        delete_resource(&self.pool, resource_id).await
    }

    async fn register_configuration(
        &self,
        configuration_id: i64,
        is_active: bool,
    ) -> Result<(), CoreError> {
        register_configuration(&self.pool, configuration_id, is_active).await
    }

    async fn list_active_configurations(&self) -> Result<Vec<i64>, CoreError> {
        list_active_configurations(&self.pool).await
    }

    async fn create_attempt(
        &self,
        key: ResourceKey,
        kind: WorkKind,
    ) -> Result<AttemptRecord, CoreError> {
        create_attempt(&self.pool, key, kind).await
    }

    async fn get_attempt(&self, attempt_id: i64) -> Result<Option<AttemptRecord>, CoreError> {
        get_attempt(&self.pool, attempt_id).await
    }

    async fn set_attempt_task_handle(
        &self,
        attempt_id: i64,
        task_handle: &str,
    ) -> Result<(), CoreError> {
        set_attempt_task_handle(&self.pool, attempt_id, task_handle).await
    }

    async fn mark_attempt_in_progress(&self, attempt_id: i64) -> Result<bool, CoreError> {
        mark_attempt_in_progress(&self.pool, attempt_id).await
    }

    async fn complete_attempt_if_active(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, CoreError> {
        complete_attempt_if_active(&self.pool, attempt_id, status, failure_reason).await
    }

    async fn list_active_attempts(&self, kind: WorkKind) -> Result<Vec<AttemptRecord>, CoreError> {
        list_active_attempts(&self.pool, kind).await
    }

    async fn latest_attempt(
        &self,
        key: ResourceKey,
        kind: WorkKind,
    ) -> Result<Option<AttemptRecord>, CoreError> {
        latest_attempt(&self.pool, key, kind).await
    }

    async fn list_recent_completed_attempts(
        &self,
        key: ResourceKey,
        kind: WorkKind,
        limit: i64,
    ) -> Result<Vec<AttemptRecord>, CoreError> {
        list_recent_completed_attempts(&self.pool, key, kind, limit).await
    }

    async fn get_coordination_status(
        &self,
        attempt_id: i64,
    ) -> Result<Option<CoordinationStatus>, CoreError> {
        get_coordination_status(&self.pool, attempt_id).await
    }

    async fn record_batch_progress(
        &self,
        attempt_id: i64,
        batch_num: i64,
        progress: &BatchProgress,
    ) -> Result<Option<CoordinationStatus>, CoreError> {
        record_batch_progress(&self.pool, attempt_id, batch_num, progress).await
    }

    async fn set_total_batches(
        &self,
        attempt_id: i64,
        total_batches: i64,
    ) -> Result<bool, CoreError> {
        set_total_batches(&self.pool, attempt_id, total_batches).await
    }

    async fn delete_coordination_status(&self, attempt_id: i64) -> Result<(), CoreError> {
        delete_coordination_status(&self.pool, attempt_id).await
    }

    async fn record_document_errors(
        &self,
        attempt_id: i64,
        key: ResourceKey,
        failures: &[DocumentFailure],
    ) -> Result<(), CoreError> {
        record_document_errors(&self.pool, attempt_id, key, failures).await
    }

    async fn resolve_document_errors(
        &self,
        key: ResourceKey,
        document_ids: &[String],
    ) -> Result<u64, CoreError> {
        resolve_document_errors(&self.pool, key, document_ids).await
    }

    async fn list_unresolved_document_errors(
        &self,
        key: ResourceKey,
    ) -> Result<Vec<DocumentErrorRecord>, CoreError> {
        list_unresolved_document_errors(&self.pool, key).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
