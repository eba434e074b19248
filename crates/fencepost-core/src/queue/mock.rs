// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock task queue for testing.
//!
//! Keeps the pending queue and leased reservations in memory and lets tests
//! inject the faults the validator has to recover from: lost tasks, crashed
//! workers (leases that are never renewed) and failing submissions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{TaskMessage, TaskQueue, TaskState};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MockQueueState {
    pending: VecDeque<String>,
    /// Leased handles with their deadline, in reservation order.
    reserved: Vec<(String, Instant)>,
    tasks: HashMap<String, TaskMessage>,
    states: HashMap<String, TaskState>,
    submitted: Vec<TaskMessage>,
}

impl MockQueueState {
    fn requeue_expired(&mut self, now: Instant) {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.reserved)
            .into_iter()
            .partition(|(_, deadline)| *deadline <= now);
        self.reserved = live;
        for (handle, _) in expired {
            self.states.insert(handle.clone(), TaskState::Pending);
            self.pending.push_front(handle);
        }
    }
}

/// Default lease of the mock queue.
const DEFAULT_LEASE: Duration = Duration::from_secs(120);

/// Mock task queue for testing.
#[derive(Clone)]
pub struct MockTaskQueue {
    state: Arc<Mutex<MockQueueState>>,
    next_handle: Arc<AtomicU64>,
    fail_next_submit: Arc<AtomicBool>,
    lease: Duration,
}

impl Default for MockTaskQueue {
    fn default() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }
}

impl MockTaskQueue {
    /// Create an empty mock queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty mock queue whose reservations last `lease`.
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            state: Arc::default(),
            next_handle: Arc::default(),
            fail_next_submit: Arc::default(),
            lease,
        }
    }

    /// Make the next `submit` call fail.
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::SeqCst);
    }

    /// Forget a task entirely, as if its worker crashed and the broker lost it.
    pub async fn drop_task(&self, handle: &str) {
        let mut state = self.state.lock().await;
        state.pending.retain(|h| h != handle);
        state.reserved.retain(|(h, _)| h != handle);
        state.tasks.remove(handle);
        state.states.remove(handle);
    }

    /// Every task ever submitted, in order.
    pub async fn submitted(&self) -> Vec<TaskMessage> {
        self.state.lock().await.submitted.clone()
    }

    /// Submitted tasks of one type.
    pub async fn submitted_of_type(&self, task_type: &str) -> Vec<TaskMessage> {
        self.submitted()
            .await
            .into_iter()
            .filter(|t| t.task_type == task_type)
            .collect()
    }

    /// Number of tasks waiting in the pending queue.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[async_trait]
impl TaskQueue for MockTaskQueue {
    async fn submit(
        &self,
        task_type: &str,
        args: serde_json::Value,
    ) -> Result<String, StoreError> {
        if self.fail_next_submit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Other("mock submit failure".to_string()));
        }

        let handle = format!("mock-task-{}", self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let message = TaskMessage {
            handle: handle.clone(),
            task_type: task_type.to_string(),
            args,
        };

        let mut state = self.state.lock().await;
        state.pending.push_back(handle.clone());
        state.tasks.insert(handle.clone(), message.clone());
        state.states.insert(handle.clone(), TaskState::Pending);
        state.submitted.push(message);

        Ok(handle)
    }

    async fn state(&self, handle: &str) -> Result<TaskState, StoreError> {
        let state = self.state.lock().await;
        Ok(state.states.get(handle).copied().unwrap_or(TaskState::Unknown))
    }

    async fn is_queued(&self, handle: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.pending.iter().any(|h| h == handle))
    }

    async fn reserved_handles(&self) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.requeue_expired(Instant::now());
        Ok(state.reserved.iter().map(|(h, _)| h.clone()).collect())
    }

    async fn reserve(&self, _timeout: Duration) -> Result<Option<TaskMessage>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.requeue_expired(now);
        while let Some(handle) = state.pending.pop_front() {
            if let Some(message) = state.tasks.get(&handle).cloned() {
                state.reserved.push((handle, now + self.lease));
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn lease_duration(&self) -> Duration {
        self.lease
    }

    async fn renew_lease(&self, handle: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let deadline = Instant::now() + self.lease;
        match state.reserved.iter_mut().find(|(h, _)| h == handle) {
            Some((_, lease)) => {
                *lease = deadline;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn start(&self, handle: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.states.contains_key(handle) {
            state.states.insert(handle.to_string(), TaskState::Active);
        }
        Ok(())
    }

    async fn complete(&self, handle: &str, _success: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.reserved.retain(|(h, _)| h != handle);
        state.pending.retain(|h| h != handle);
        state.tasks.remove(handle);
        state.states.insert(handle.to_string(), TaskState::Terminal);
        Ok(())
    }
}
