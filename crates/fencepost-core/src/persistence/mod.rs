// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for fencepost-core.
//!
//! The [`Persistence`] trait covers everything the coordinator keeps in the
//! relational database: resources and configurations, attempts, the
//! coordination ledger and per-document errors. Every terminal attempt write
//! is conditional on the attempt still being in flight, so concurrent
//! finalizers (monitor, validator) never overwrite each other.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::types::{
    AttemptRecord, AttemptStatus, BatchProgress, CoordinationStatus, DocumentErrorRecord,
    DocumentFailure, ResourceKey, ResourceRecord, ResourceStatus, WorkKind,
};

/// Persistence abstraction for the attempts ledger.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // Resources and configurations

    /// Register a resource in SCHEDULED state. Existing resources are left untouched.
    async fn register_resource(
        &self,
        resource_id: i64,
        refresh_interval_secs: Option<i64>,
    ) -> Result<(), CoreError>;

    async fn get_resource(&self, resource_id: i64) -> Result<Option<ResourceRecord>, CoreError>;

    async fn list_resources(&self) -> Result<Vec<ResourceRecord>, CoreError>;

    /// Persist the lifecycle fields of a resource.
    async fn save_resource_state(
        &self,
        resource_id: i64,
        status: ResourceStatus,
        in_repeated_error_state: bool,
        last_successful_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Delete a resource and, by cascade, its attempts. Returns false if it did not exist.
    async fn delete_resource(&self, resource_id: i64) -> Result<bool, CoreError>;

    /// Insert or update a configuration.
    async fn register_configuration(
        &self,
        configuration_id: i64,
        is_active: bool,
    ) -> Result<(), CoreError>;

    async fn list_active_configurations(&self) -> Result<Vec<i64>, CoreError>;

    // Attempts

    /// Create a NOT_STARTED attempt and its coordination status row in one transaction.
    ///
    /// Fails with [`CoreError::AttemptAlreadyActive`] when another in-flight
    /// attempt exists for the same kind and key.
    async fn create_attempt(
        &self,
        key: ResourceKey,
        kind: WorkKind,
    ) -> Result<AttemptRecord, CoreError>;

    async fn get_attempt(&self, attempt_id: i64) -> Result<Option<AttemptRecord>, CoreError>;

    async fn set_attempt_task_handle(
        &self,
        attempt_id: i64,
        task_handle: &str,
    ) -> Result<(), CoreError>;

    /// Move an in-flight attempt to IN_PROGRESS.
    ///
    /// Returns false if the attempt is already terminal.
    async fn mark_attempt_in_progress(&self, attempt_id: i64) -> Result<bool, CoreError>;

    /// Write a terminal status if the attempt is still in flight.
    ///
    /// Returns true if this call performed the transition.
    async fn complete_attempt_if_active(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// In-flight attempts of a kind, oldest first.
    async fn list_active_attempts(&self, kind: WorkKind) -> Result<Vec<AttemptRecord>, CoreError>;

    /// Most recently created attempt for a key.
    async fn latest_attempt(
        &self,
        key: ResourceKey,
        kind: WorkKind,
    ) -> Result<Option<AttemptRecord>, CoreError>;

    /// Most recent terminal attempts for a key, newest first.
    async fn list_recent_completed_attempts(
        &self,
        key: ResourceKey,
        kind: WorkKind,
        limit: i64,
    ) -> Result<Vec<AttemptRecord>, CoreError>;

    // Coordination ledger

    async fn get_coordination_status(
        &self,
        attempt_id: i64,
    ) -> Result<Option<CoordinationStatus>, CoreError>;

    /// Count one finished batch and accumulate its counters.
    ///
    /// Returns the updated status, or None if the batch was already counted,
    /// the ledger row is gone, or every known batch is already complete.
    async fn record_batch_progress(
        &self,
        attempt_id: i64,
        batch_num: i64,
        progress: &BatchProgress,
    ) -> Result<Option<CoordinationStatus>, CoreError>;

    /// Record the total batch count once the producer has enumerated every batch.
    ///
    /// Returns false if the ledger row is gone or more batches already completed.
    async fn set_total_batches(&self, attempt_id: i64, total_batches: i64)
    -> Result<bool, CoreError>;

    /// Remove the ledger row and its per-batch rows.
    async fn delete_coordination_status(&self, attempt_id: i64) -> Result<(), CoreError>;

    // Document errors

    async fn record_document_errors(
        &self,
        attempt_id: i64,
        key: ResourceKey,
        failures: &[DocumentFailure],
    ) -> Result<(), CoreError>;

    /// Mark unresolved errors for these documents as resolved. Returns the number resolved.
    async fn resolve_document_errors(
        &self,
        key: ResourceKey,
        document_ids: &[String],
    ) -> Result<u64, CoreError>;

    async fn list_unresolved_document_errors(
        &self,
        key: ResourceKey,
    ) -> Result<Vec<DocumentErrorRecord>, CoreError>;

    /// Health check.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

// Raw rows shared by both backends. Text columns are mapped onto the domain
// enums here so a bad value surfaces as `CoreError::InvalidRecord`.

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AttemptRow {
    pub attempt_id: i64,
    pub kind: String,
    pub resource_id: i64,
    pub configuration_id: i64,
    pub status: String,
    pub task_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl TryFrom<AttemptRow> for AttemptRecord {
    type Error = CoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(AttemptRecord {
            attempt_id: row.attempt_id,
            kind: row.kind.parse()?,
            key: ResourceKey::new(row.resource_id, row.configuration_id),
            status: row.status.parse()?,
            task_handle: row.task_handle,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            failure_reason: row.failure_reason,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ResourceRow {
    pub resource_id: i64,
    pub status: String,
    pub in_repeated_error_state: bool,
    pub refresh_interval_secs: Option<i64>,
    pub last_successful_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ResourceRow> for ResourceRecord {
    type Error = CoreError;

    fn try_from(row: ResourceRow) -> Result<Self, Self::Error> {
        Ok(ResourceRecord {
            resource_id: row.resource_id,
            status: row.status.parse()?,
            in_repeated_error_state: row.in_repeated_error_state,
            refresh_interval_secs: row.refresh_interval_secs,
            last_successful_at: row.last_successful_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DocumentErrorRow {
    pub id: i64,
    pub attempt_id: i64,
    pub resource_id: i64,
    pub configuration_id: i64,
    pub document_id: Option<String>,
    pub message: String,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DocumentErrorRow> for DocumentErrorRecord {
    fn from(row: DocumentErrorRow) -> Self {
        DocumentErrorRecord {
            id: row.id,
            attempt_id: row.attempt_id,
            key: ResourceKey::new(row.resource_id, row.configuration_id),
            document_id: row.document_id,
            message: row.message,
            is_resolved: row.is_resolved,
            created_at: row.created_at,
        }
    }
}

pub(crate) fn attempts_from_rows(rows: Vec<AttemptRow>) -> Result<Vec<AttemptRecord>, CoreError> {
    rows.into_iter().map(AttemptRecord::try_from).collect()
}

/// Message stored for a failed document, with the cause appended when known.
pub(crate) fn failure_message(failure: &DocumentFailure) -> String {
    match &failure.cause {
        Some(cause) => format!("{}: {}", failure.message, cause),
        None => failure.message.clone(),
    }
}

/// Map a unique-index violation on attempt creation onto [`CoreError::AttemptAlreadyActive`].
pub(crate) fn map_create_attempt_error(
    err: sqlx::Error,
    key: ResourceKey,
    kind: WorkKind,
) -> CoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::AttemptAlreadyActive {
            kind: kind.as_str().to_string(),
            resource_id: key.resource_id,
            configuration_id: key.configuration_id,
        },
        _ => err.into(),
    }
}
