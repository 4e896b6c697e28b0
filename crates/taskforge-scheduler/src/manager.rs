//! Task queue manager: thread-safe admission, ordering and lifecycle bookkeeping.
//!
//! One mutex guards the queue, the store, per-task cancellation tokens and the
//! cumulative counters. Every public method takes the lock exactly once and
//! never calls back into another locking method while holding it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use taskforge_core::config::QueueConfig;
use taskforge_core::error::{Result, TaskForgeError};
use taskforge_core::types::{Phase, TaskPriority, TaskStatus};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::queue::PriorityQueue;
use crate::store::TaskStore;
use crate::tasks::{Task, TaskRequest};

/// Result of [`TaskQueueManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still queued and is now CANCELLED.
    Cancelled,
    /// The task is in flight; it will be finalised at the next phase boundary.
    Requested,
}

/// Filter + pagination for [`TaskQueueManager::list`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Matching tasks before pagination.
    pub total: usize,
}

/// Point-in-time snapshot of queue state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub queue_depth: usize,
    pub active: usize,
    pub capacity: usize,
    pub history_size: usize,
    /// Queued tasks per priority.
    pub by_priority: BTreeMap<String, usize>,
    /// Active and retained tasks per status.
    pub by_status: BTreeMap<String, usize>,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_escalated: u64,
}

#[derive(Debug, Default)]
struct Totals {
    enqueued: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    escalated: u64,
}

struct Inner {
    queue: PriorityQueue,
    store: TaskStore,
    tokens: HashMap<String, CancellationToken>,
    totals: Totals,
}

impl Inner {
    /// Validate and apply a status change on an active task.
    fn transition(&mut self, task_id: &str, to: TaskStatus) -> Result<&mut Task> {
        let from = self
            .store
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))?;
        if !from.can_transition_to(to) {
            return Err(TaskForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from,
                to,
            });
        }
        let task = self
            .store
            .get_active_mut(task_id)
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))?;
        task.status = to;
        Ok(task)
    }

    /// Active task that a worker currently owns.
    fn in_progress(&mut self, task_id: &str) -> Result<&mut Task> {
        let status = self
            .store
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))?;
        if status != TaskStatus::InProgress {
            return Err(TaskForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: status,
                to: TaskStatus::InProgress,
            });
        }
        self.store
            .get_active_mut(task_id)
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))
    }

    /// Set a terminal status and move the record into history.
    fn finalize(
        &mut self,
        task_id: &str,
        to: TaskStatus,
        apply: impl FnOnce(&mut Task),
    ) -> Result<()> {
        let task = self.transition(task_id, to)?;
        task.completed_at = Some(Utc::now());
        task.approval_deadline = None;
        apply(task);

        match to {
            TaskStatus::Completed => self.totals.completed += 1,
            TaskStatus::Failed => self.totals.failed += 1,
            TaskStatus::Cancelled => self.totals.cancelled += 1,
            TaskStatus::Escalated => self.totals.escalated += 1,
            _ => {}
        }
        self.queue.remove(task_id);
        self.tokens.remove(task_id);
        self.store.archive(task_id);
        Ok(())
    }
}

/// Composes [`PriorityQueue`] and [`TaskStore`] behind one lock.
pub struct TaskQueueManager {
    inner: Mutex<Inner>,
    available: Notify,
}

impl TaskQueueManager {
    pub fn new(max_queue_size: usize, max_history_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: PriorityQueue::new(),
                store: TaskStore::new(max_queue_size, max_history_size),
                tokens: HashMap::new(),
                totals: Totals::default(),
            }),
            available: Notify::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_queue_size, config.max_history_size)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| TaskForgeError::Lock(format!("task queue: {e}")))
    }

    // ── Admission ──────────────────────────────────────────

    /// Admit a task as QUEUED. Fails on duplicate id or full capacity.
    pub fn enqueue(&self, mut task: Task) -> Result<String> {
        task.status = TaskStatus::Queued;
        task.phase = None;
        let task_id = task.task_id.clone();
        let priority = task.priority;
        {
            let mut inner = self.lock()?;
            inner.store.insert(task)?;
            inner.queue.push(&task_id, priority);
            inner.tokens.insert(task_id.clone(), CancellationToken::new());
            inner.totals.enqueued += 1;
        }
        tracing::debug!("📥 Task enqueued: '{}' ({})", task_id, priority);
        self.available.notify_waiters();
        Ok(task_id)
    }

    /// Admit a request from the ingestion layer.
    pub fn submit(&self, request: TaskRequest) -> Result<String> {
        self.enqueue(request.into_task())
    }

    // ── Dispatch ───────────────────────────────────────────

    /// Take the next task, marking it IN_PROGRESS. `None` if nothing is queued.
    pub fn dequeue(&self) -> Result<Option<Task>> {
        let mut inner = self.lock()?;
        while let Some(task_id) = inner.queue.pop() {
            match inner.transition(&task_id, TaskStatus::InProgress) {
                Ok(task) => {
                    task.started_at = Some(Utc::now());
                    return Ok(Some(task.clone()));
                }
                Err(e) => tracing::warn!("⚠️ Dropping stale queue entry '{}': {}", task_id, e),
            }
        }
        Ok(None)
    }

    /// Wait up to `timeout` for a task. Returns `Err(Cancelled)` promptly once
    /// `cancel` fires.
    pub async fn dequeue_blocking(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Task>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(TaskForgeError::Cancelled);
            }
            // Register interest before looking, so an enqueue in between still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.dequeue()? {
                return Ok(Some(task));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskForgeError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    // ── Queries ────────────────────────────────────────────

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.lock()?
            .store
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))
    }

    pub fn get_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.lock()?
            .store
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))
    }

    /// Terminal tasks, most recent first.
    pub fn history(&self, limit: usize) -> Result<Vec<Task>> {
        Ok(self
            .lock()?
            .store
            .history_recent()
            .take(limit)
            .cloned()
            .collect())
    }

    /// Active and retained tasks, newest first.
    pub fn list(&self, query: &ListQuery) -> Result<TaskPage> {
        let mut matching: Vec<Task> = {
            let inner = self.lock()?;
            inner
                .store
                .active()
                .chain(inner.store.history_recent())
                .filter(|t| query.status.is_none_or(|s| t.status == s))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len();
        let tasks = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(TaskPage { tasks, total })
    }

    pub fn queue_size(&self) -> usize {
        self.lock().map(|inner| inner.queue.len()).unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.lock().map(|inner| inner.store.active_len()).unwrap_or(0)
    }

    /// Snapshot every counter under a single lock acquisition.
    pub fn metrics(&self) -> Result<QueueMetrics> {
        let inner = self.lock()?;

        let depth = inner.queue.depth_by_priority();
        let by_priority: BTreeMap<String, usize> = TaskPriority::ALL
            .iter()
            .map(|p| (p.to_string(), depth.get(p).copied().unwrap_or(0)))
            .collect();
        let mut by_status: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();

        for task in inner.store.active() {
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }
        for task in inner.store.history_recent() {
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }

        Ok(QueueMetrics {
            queue_depth: inner.queue.len(),
            active: inner.store.active_len(),
            capacity: inner.store.capacity(),
            history_size: inner.store.history_len(),
            by_priority,
            by_status,
            total_enqueued: inner.totals.enqueued,
            total_completed: inner.totals.completed,
            total_failed: inner.totals.failed,
            total_cancelled: inner.totals.cancelled,
            total_escalated: inner.totals.escalated,
        })
    }

    // ── Status changes ─────────────────────────────────────

    /// Apply a status change validated against the status graph.
    /// Terminal statuses move the task into history.
    pub fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut inner = self.lock()?;
        if status.is_terminal() {
            return inner.finalize(task_id, status, |_| {});
        }
        let task = inner.transition(task_id, status)?;
        if status == TaskStatus::InProgress && task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn complete(&self, task_id: &str, result: serde_json::Value) -> Result<()> {
        self.lock()?.finalize(task_id, TaskStatus::Completed, |task| {
            task.result = Some(result);
            task.error = None;
        })?;
        tracing::info!("✅ Task '{}' completed", task_id);
        Ok(())
    }

    pub fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        tracing::warn!("❌ Task '{}' failed: {}", task_id, error);
        self.lock()?.finalize(task_id, TaskStatus::Failed, |task| {
            task.error = Some(error);
        })
    }

    /// Hand the task to a human. `gaps` carries unmet verification criteria, if any.
    pub fn escalate(&self, task_id: &str, reason: impl Into<String>, gaps: Vec<String>) -> Result<()> {
        let reason = reason.into();
        tracing::warn!("🚨 Task '{}' escalated: {}", task_id, reason);
        self.lock()?.finalize(task_id, TaskStatus::Escalated, |task| {
            task.error = Some(reason);
            task.verification_gaps = gaps;
        })
    }

    /// Finalise an in-flight task as CANCELLED.
    pub fn mark_cancelled(&self, task_id: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        tracing::info!("🛑 Task '{}' cancelled: {}", task_id, reason);
        self.lock()?.finalize(task_id, TaskStatus::Cancelled, |task| {
            task.error = Some(reason);
        })
    }

    /// Cancel a task. Queued tasks are cancelled immediately; in-flight tasks
    /// have their cancellation token tripped.
    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        let mut inner = self.lock()?;
        let status = inner
            .store
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))?;

        match status {
            TaskStatus::Queued => {
                inner.finalize(task_id, TaskStatus::Cancelled, |task| {
                    task.cancel_requested = true;
                    task.error = Some("cancelled before dispatch".into());
                })?;
                tracing::info!("🛑 Task '{}' cancelled while queued", task_id);
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::InProgress | TaskStatus::AwaitingApproval => {
                if let Some(task) = inner.store.get_active_mut(task_id) {
                    task.cancel_requested = true;
                }
                if let Some(token) = inner.tokens.get(task_id) {
                    token.cancel();
                }
                tracing::info!("🛑 Cancellation requested for task '{}' ({})", task_id, status);
                Ok(CancelOutcome::Requested)
            }
            _ => Err(TaskForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: status,
                to: TaskStatus::Cancelled,
            }),
        }
    }

    /// Token tripped by [`cancel`](Self::cancel) for an active task.
    pub fn cancellation_token(&self, task_id: &str) -> Result<CancellationToken> {
        self.lock()?
            .tokens
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))
    }

    // ── Phase bookkeeping ──────────────────────────────────

    /// Record phase entry and reset the per-phase retry counter.
    pub fn enter_phase(&self, task_id: &str, phase: Phase) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.in_progress(task_id)?;
        task.phase = Some(phase);
        task.retry_count = 0;
        task.phase_retries.insert(phase, 0);
        Ok(())
    }

    /// Record a failed attempt that will be retried. Returns the new retry count.
    pub fn record_attempt_failure(&self, task_id: &str, error: &str) -> Result<u32> {
        let mut inner = self.lock()?;
        let task = inner.in_progress(task_id)?;
        task.retry_count += 1;
        if let Some(phase) = task.phase {
            task.phase_retries.insert(phase, task.retry_count);
        }
        task.error = Some(error.to_string());
        Ok(task.retry_count)
    }

    pub fn record_phase_result(
        &self,
        task_id: &str,
        phase: Phase,
        result: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.in_progress(task_id)?;
        task.phase_results.insert(phase, result.clone());
        task.result = Some(result);
        task.error = None;
        Ok(())
    }

    pub fn begin_iteration(&self, task_id: &str, iteration: u32) -> Result<()> {
        let mut inner = self.lock()?;
        inner.in_progress(task_id)?.iteration = iteration;
        Ok(())
    }

    pub fn await_approval(&self, task_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.transition(task_id, TaskStatus::AwaitingApproval)?;
        task.approval_deadline = Some(deadline);
        Ok(())
    }

    pub fn resume_from_approval(&self, task_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let from = inner.store.get(task_id).map(|t| t.status);
        if from != Some(TaskStatus::AwaitingApproval) {
            return Err(TaskForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: from.ok_or_else(|| TaskForgeError::TaskNotFound(task_id.to_string()))?,
                to: TaskStatus::InProgress,
            });
        }
        let task = inner.transition(task_id, TaskStatus::InProgress)?;
        task.approval_deadline = None;
        Ok(())
    }
}
