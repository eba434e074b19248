// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fencepost-core.
//!
//! [`CoreError`] covers the relational ledger (attempts, coordination status,
//! resources). [`StoreError`] covers the fast key-value store that backs
//! fences, locks and the task queue.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Attempt was not found in the database.
    AttemptNotFound {
        /// The attempt ID that was not found.
        attempt_id: i64,
    },

    /// A non-terminal attempt already exists for the same resource key.
    AttemptAlreadyActive {
        /// Work kind of the conflicting attempt.
        kind: String,
        /// Resource the attempt is for.
        resource_id: i64,
        /// Configuration the attempt is for.
        configuration_id: i64,
    },

    /// Resource was not found.
    ResourceNotFound {
        /// The resource ID that was not found.
        resource_id: i64,
    },

    /// A stored value could not be mapped onto a domain type.
    InvalidRecord {
        /// The column or field that failed to decode.
        field: String,
        /// The offending value.
        value: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AttemptNotFound { .. } => "ATTEMPT_NOT_FOUND",
            Self::AttemptAlreadyActive { .. } => "ATTEMPT_ALREADY_ACTIVE",
            Self::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::InvalidRecord { .. } => "INVALID_RECORD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    pub(crate) fn invalid(field: &str, value: impl Into<String>) -> Self {
        Self::InvalidRecord {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptNotFound { attempt_id } => {
                write!(f, "Attempt '{}' not found", attempt_id)
            }
            Self::AttemptAlreadyActive {
                kind,
                resource_id,
                configuration_id,
            } => {
                write!(
                    f,
                    "An active {} attempt already exists for resource {}/{}",
                    kind, resource_id, configuration_id
                )
            }
            Self::ResourceNotFound { resource_id } => {
                write!(f, "Resource '{}' not found", resource_id)
            }
            Self::InvalidRecord { field, value } => {
                write!(f, "Invalid value for '{}': '{}'", field, value)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

/// Errors raised by the fence store and the task queue.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Could not connect to the backing store.
    #[error("Failed to connect to {url}: {reason}")]
    ConnectionFailed {
        /// Store URL.
        url: String,
        /// Connection failure reason.
        reason: String,
    },

    /// Redis command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other store failure.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (CoreError::AttemptNotFound { attempt_id: 7 }, "ATTEMPT_NOT_FOUND"),
            (
                CoreError::AttemptAlreadyActive {
                    kind: "indexing".to_string(),
                    resource_id: 1,
                    configuration_id: 2,
                },
                "ATTEMPT_ALREADY_ACTIVE",
            ),
            (CoreError::ResourceNotFound { resource_id: 3 }, "RESOURCE_NOT_FOUND"),
            (CoreError::invalid("status", "bogus"), "INVALID_RECORD"),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "wrong code for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::AttemptAlreadyActive {
            kind: "indexing".to_string(),
            resource_id: 4,
            configuration_id: 1,
        };
        assert_eq!(
            err.to_string(),
            "An active indexing attempt already exists for resource 4/1"
        );

        let err = CoreError::invalid("status", "bogus");
        assert_eq!(err.to_string(), "Invalid value for 'status': 'bogus'");
    }
}
