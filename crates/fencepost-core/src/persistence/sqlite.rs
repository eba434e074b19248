// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Timestamps are written from the application so both backends agree on
//! their format; time comparisons are done by callers, not in SQL.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::CoreError;
use crate::migrations;
use crate::types::{
    AttemptRecord, AttemptStatus, BatchProgress, CoordinationStatus, DocumentErrorRecord,
    DocumentFailure, ResourceKey, ResourceRecord, ResourceStatus, WorkKind,
};

use super::{
    AttemptRow, DocumentErrorRow, Persistence, ResourceRow, attempts_from_rows, failure_message,
    map_create_attempt_error,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a migrated in-memory database.
    ///
    /// The pool holds a single connection that is never recycled, since every
    /// connection to `sqlite::memory:` opens a separate database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn register_resource(
        &self,
        resource_id: i64,
        refresh_interval_secs: Option<i64>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO resources (resource_id, status, refresh_interval_secs, created_at)
            VALUES (?, 'scheduled', ?, ?)
            ON CONFLICT (resource_id) DO NOTHING
            "#,
        )
        .bind(resource_id)
        .bind(refresh_interval_secs)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_resource(&self, resource_id: i64) -> Result<Option<ResourceRecord>, CoreError> {
        let row = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT resource_id, status, in_repeated_error_state, refresh_interval_secs,
                   last_successful_at, created_at
            FROM resources
            WHERE resource_id = ?
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ResourceRecord::try_from).transpose()
    }

    async fn list_resources(&self) -> Result<Vec<ResourceRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT resource_id, status, in_repeated_error_state, refresh_interval_secs,
                   last_successful_at, created_at
            FROM resources
            ORDER BY resource_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ResourceRecord::try_from).collect()
    }

    async fn save_resource_state(
        &self,
        resource_id: i64,
        status: ResourceStatus,
        in_repeated_error_state: bool,
        last_successful_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET status = ?, in_repeated_error_state = ?, last_successful_at = ?
            WHERE resource_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(in_repeated_error_state)
        .bind(last_successful_at)
        .bind(resource_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ResourceNotFound { resource_id });
        }

        Ok(())
    }

    async fn delete_resource(&self, resource_id: i64) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM resources WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn register_configuration(
        &self,
        configuration_id: i64,
        is_active: bool,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO configurations (configuration_id, is_active, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (configuration_id) DO UPDATE SET is_active = excluded.is_active
            "#,
        )
        .bind(configuration_id)
        .bind(is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_active_configurations(&self) -> Result<Vec<i64>, CoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT configuration_id FROM configurations WHERE is_active = 1 ORDER BY configuration_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn create_attempt(
        &self,
        key: ResourceKey,
        kind: WorkKind,
    ) -> Result<AttemptRecord, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            INSERT INTO attempts (kind, resource_id, configuration_id, status, created_at)
            VALUES (?, ?, ?, 'not_started', ?)
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

        sqlx::query("INSERT INTO coordination_status (attempt_id, last_progress_at) VALUES (?, ?)")
            .bind(row.attempt_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        AttemptRecord::try_from(row)
    }

    async fn get_attempt(&self, attempt_id: i64) -> Result<Option<AttemptRecord>, CoreError> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
                   created_at, started_at, finished_at, failure_reason
            FROM attempts
            WHERE attempt_id = ?
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AttemptRecord::try_from).transpose()
    }

    async fn set_attempt_task_handle(
        &self,
        attempt_id: i64,
        task_handle: &str,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE attempts SET task_handle = ? WHERE attempt_id = ?")
            .bind(task_handle)
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AttemptNotFound { attempt_id });
        }

        Ok(())
    }

    async fn mark_attempt_in_progress(&self, attempt_id: i64) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE attempts
            SET status = 'in_progress', started_at = COALESCE(started_at, ?1)
            WHERE attempt_id = ?2
              AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(Utc::now())
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_attempt_if_active(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE attempts
            SET status = ?1,
                finished_at = ?2,
                failure_reason = COALESCE(?3, failure_reason)
            WHERE attempt_id = ?4
              AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(failure_reason)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active_attempts(&self, kind: WorkKind) -> Result<Vec<AttemptRecord>, CoreError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
                   created_at, started_at, finished_at, failure_reason
            FROM attempts
            WHERE kind = ?
              AND status IN ('not_started', 'in_progress')
            ORDER BY attempt_id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        attempts_from_rows(rows)
    }

    async fn latest_attempt(
        &self,
        key: ResourceKey,
        kind: WorkKind,
    ) -> Result<Option<AttemptRecord>, CoreError> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
                   created_at, started_at, finished_at, failure_reason
            FROM attempts
            WHERE kind = ? AND resource_id = ? AND configuration_id = ?
            ORDER BY attempt_id DESC
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(key.resource_id)
        .bind(key.configuration_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AttemptRecord::try_from).transpose()
    }

    async fn list_recent_completed_attempts(
        &self,
        key: ResourceKey,
        kind: WorkKind,
        limit: i64,
    ) -> Result<Vec<AttemptRecord>, CoreError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT attempt_id, kind, resource_id, configuration_id, status, task_handle,
                   created_at, started_at, finished_at, failure_reason
            FROM attempts
            WHERE kind = ? AND resource_id = ? AND configuration_id = ?
              AND status NOT IN ('not_started', 'in_progress')
            ORDER BY attempt_id DESC
            LIMIT ?
            "#,
        )
        .bind(kind.as_str())
        .bind(key.resource_id)
        .bind(key.configuration_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        attempts_from_rows(rows)
    }

    async fn get_coordination_status(
        &self,
        attempt_id: i64,
    ) -> Result<Option<CoordinationStatus>, CoreError> {
        let status = sqlx::query_as::<_, CoordinationStatus>(
            r#"
            SELECT attempt_id, completed_batches, total_batches, total_docs_indexed,
                   new_docs_indexed, total_chunks, total_failures, last_progress_at
            FROM coordination_status
            WHERE attempt_id = ?
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn record_batch_progress(
        &self,
        attempt_id: i64,
        batch_num: i64,
        progress: &BatchProgress,
    ) -> Result<Option<CoordinationStatus>, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO coordination_batches (attempt_id, batch_num, completed_at)
            SELECT ?1, ?2, ?3
            WHERE EXISTS (SELECT 1 FROM coordination_status WHERE attempt_id = ?1)
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
                total_docs_indexed = total_docs_indexed + ?2,
                new_docs_indexed = new_docs_indexed + ?3,
                total_chunks = total_chunks + ?4,
                total_failures = total_failures + ?5,
                last_progress_at = ?6
            WHERE attempt_id = ?1
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

    async fn set_total_batches(
        &self,
        attempt_id: i64,
        total_batches: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE coordination_status
            SET total_batches = ?1
            WHERE attempt_id = ?2
              AND completed_batches <= ?1
            "#,
        )
        .bind(total_batches)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_coordination_status(&self, attempt_id: i64) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM coordination_batches WHERE attempt_id = ?")
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM coordination_status WHERE attempt_id = ?")
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_document_errors(
        &self,
        attempt_id: i64,
        key: ResourceKey,
        failures: &[DocumentFailure],
    ) -> Result<(), CoreError> {
        if failures.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for failure in failures {
            sqlx::query(
                r#"
                INSERT INTO document_errors
                    (attempt_id, resource_id, configuration_id, document_id, message, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
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

    async fn resolve_document_errors(
        &self,
        key: ResourceKey,
        document_ids: &[String],
    ) -> Result<u64, CoreError> {
        if document_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "UPDATE document_errors SET is_resolved = 1 WHERE is_resolved = 0 AND resource_id = ",
        );
        builder.push_bind(key.resource_id);
        builder.push(" AND configuration_id = ");
        builder.push_bind(key.configuration_id);
        builder.push(" AND document_id IN (");
        let mut separated = builder.separated(", ");
        for document_id in document_ids {
            separated.push_bind(document_id.as_str());
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn list_unresolved_document_errors(
        &self,
        key: ResourceKey,
    ) -> Result<Vec<DocumentErrorRecord>, CoreError> {
        let rows = sqlx::query_as::<_, DocumentErrorRow>(
            r#"
            SELECT id, attempt_id, resource_id, configuration_id, document_id, message,
                   is_resolved, created_at
            FROM document_errors
            WHERE resource_id = ? AND configuration_id = ? AND is_resolved = 0
            ORDER BY id
            "#,
        )
        .bind(key.resource_id)
        .bind(key.configuration_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DocumentErrorRecord::from).collect())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
