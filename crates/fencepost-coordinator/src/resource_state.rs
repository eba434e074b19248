// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource lifecycle: SCHEDULED → INITIAL_INDEXING → ACTIVE, with an
//! orthogonal repeated-error flag.
//!
//! Only indexing attempts drive the machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fencepost_core::{
    AttemptRecord, AttemptStatus, Persistence, ResourceRecord, ResourceStatus, WorkKind,
};
use tracing::{info, warn};

use crate::context::LogContext;
use crate::error::Result;

/// Tuning for the resource state machine and for `needs_work`.
#[derive(Debug, Clone)]
pub struct ResourceStateConfig {
    /// Consecutive failed attempts that set the repeated-error flag.
    pub repeated_error_threshold: usize,
    /// Retry delay before the resource has ever succeeded.
    pub initial_retry_interval: Duration,
    /// Minimum delay between attempts while the repeated-error flag is set.
    pub repeated_error_interval: Duration,
}

impl Default for ResourceStateConfig {
    fn default() -> Self {
        Self {
            repeated_error_threshold: 5,
            initial_retry_interval: Duration::from_secs(5 * 60),
            repeated_error_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Drives resource status from attempt dispatch and completion.
#[derive(Clone)]
pub struct ResourceStateMachine {
    persistence: Arc<dyn Persistence>,
    config: ResourceStateConfig,
}

impl ResourceStateMachine {
    /// Create a state machine over `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>, config: ResourceStateConfig) -> Self {
        Self {
            persistence,
            config,
        }
    }

    /// Tuning in effect.
    pub fn config(&self) -> &ResourceStateConfig {
        &self.config
    }

    /// SCHEDULED → INITIAL_INDEXING on the first dispatched indexing attempt.
    pub async fn on_attempt_dispatched(
        &self,
        kind: WorkKind,
        resource_id: i64,
        ctx: &LogContext,
    ) -> Result<()> {
        if kind != WorkKind::Indexing {
            return Ok(());
        }
        let Some(resource) = self.persistence.get_resource(resource_id).await? else {
            warn!(ctx = %ctx, "Dispatched attempt for unknown resource");
            return Ok(());
        };
        if resource.status == ResourceStatus::Scheduled {
            self.persistence
                .save_resource_state(
                    resource_id,
                    ResourceStatus::InitialIndexing,
                    resource.in_repeated_error_state,
                    resource.last_successful_at,
                )
                .await?;
            info!(ctx = %ctx, "Resource moved to initial indexing");
        }
        Ok(())
    }

    /// Apply a terminal attempt outcome.
    ///
    /// Success makes the resource ACTIVE and clears the repeated-error flag.
    /// A failure sets the flag once the last N completed attempts all failed.
    /// Cancellation changes nothing.
    pub async fn on_attempt_finished(
        &self,
        attempt: &AttemptRecord,
        status: AttemptStatus,
        ctx: &LogContext,
    ) -> Result<()> {
        if attempt.kind != WorkKind::Indexing {
            return Ok(());
        }
        let resource_id = attempt.key.resource_id;
        let Some(resource) = self.persistence.get_resource(resource_id).await? else {
            warn!(ctx = %ctx, "Finished attempt for unknown resource");
            return Ok(());
        };

        if status.is_successful() {
            self.persistence
                .save_resource_state(resource_id, ResourceStatus::Active, false, Some(Utc::now()))
                .await?;
            if resource.status != ResourceStatus::Active {
                info!(ctx = %ctx, "Resource is now active");
            }
            return Ok(());
        }

        if status != AttemptStatus::Failed || resource.in_repeated_error_state {
            return Ok(());
        }

        let threshold = self.config.repeated_error_threshold;
        let recent = self
            .persistence
            .list_recent_completed_attempts(attempt.key, attempt.kind, threshold as i64)
            .await?;
        let repeated = recent.len() >= threshold
            && recent.iter().all(|a| a.status == AttemptStatus::Failed);
        if repeated {
            self.persistence
                .save_resource_state(
                    resource_id,
                    resource.status,
                    true,
                    resource.last_successful_at,
                )
                .await?;
            warn!(
                ctx = %ctx,
                consecutive_failures = threshold,
                "Resource entered repeated error state"
            );
        }
        Ok(())
    }
}

/// Whether a new attempt is due for a resource.
pub fn needs_work(
    config: &ResourceStateConfig,
    resource: &ResourceRecord,
    latest: Option<&AttemptRecord>,
    now: DateTime<Utc>,
) -> bool {
    let Some(latest) = latest else {
        return true;
    };
    if latest.is_active() {
        return false;
    }
    let Some(finished_at) = latest.finished_at else {
        return true;
    };

    let mut interval = match resource.status {
        ResourceStatus::Active => match resource.refresh_interval_secs {
            Some(secs) => chrono::Duration::seconds(secs.max(0)),
            None => return false,
        },
        ResourceStatus::Scheduled | ResourceStatus::InitialIndexing => {
            to_chrono(config.initial_retry_interval)
        }
    };
    if resource.in_repeated_error_state {
        interval = interval.max(to_chrono(config.repeated_error_interval));
    }
    finished_at
        .checked_add_signed(interval)
        .is_some_and(|due| due <= now)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fencepost_core::ResourceKey;

    fn resource(status: ResourceStatus, refresh: Option<i64>, repeated: bool) -> ResourceRecord {
        ResourceRecord {
            resource_id: 1,
            status,
            in_repeated_error_state: repeated,
            refresh_interval_secs: refresh,
            last_successful_at: None,
            created_at: Utc::now(),
        }
    }

    fn finished(status: AttemptStatus, at: DateTime<Utc>) -> AttemptRecord {
        AttemptRecord {
            attempt_id: 1,
            kind: WorkKind::Indexing,
            key: ResourceKey::new(1, 1),
            status,
            task_handle: Some("h".to_string()),
            created_at: at,
            started_at: Some(at),
            finished_at: if status.is_terminal() { Some(at) } else { None },
            failure_reason: None,
        }
    }

    #[test]
    fn test_needs_work_without_history() {
        let config = ResourceStateConfig::default();
        let r = resource(ResourceStatus::Scheduled, Some(3600), false);
        assert!(needs_work(&config, &r, None, Utc::now()));
    }

    #[test]
    fn test_needs_work_while_in_flight() {
        let config = ResourceStateConfig::default();
        let r = resource(ResourceStatus::Active, Some(0), false);
        let long_ago = Utc::now() - chrono::Duration::days(1);
        let running = finished(AttemptStatus::InProgress, long_ago);
        assert!(!needs_work(&config, &r, Some(&running), Utc::now()));
    }

    #[test]
    fn test_needs_work_refresh_interval() {
        let config = ResourceStateConfig::default();
        let now = Utc::now();
        let r = resource(ResourceStatus::Active, Some(3600), false);

        let recent = finished(AttemptStatus::Succeeded, now - chrono::Duration::minutes(30));
        assert!(!needs_work(&config, &r, Some(&recent), now));

        let old = finished(AttemptStatus::Succeeded, now - chrono::Duration::minutes(61));
        assert!(needs_work(&config, &r, Some(&old), now));

        let never = resource(ResourceStatus::Active, None, false);
        assert!(!needs_work(&config, &never, Some(&old), now));
    }

    #[test]
    fn test_needs_work_initial_retry_and_repeated_errors() {
        let config = ResourceStateConfig::default();
        let now = Utc::now();
        let failed = finished(AttemptStatus::Failed, now - chrono::Duration::minutes(10));

        let initial = resource(ResourceStatus::InitialIndexing, Some(3600), false);
        assert!(needs_work(&config, &initial, Some(&failed), now));

        let flagged = resource(ResourceStatus::InitialIndexing, Some(3600), true);
        assert!(!needs_work(&config, &flagged, Some(&failed), now));
    }
}
