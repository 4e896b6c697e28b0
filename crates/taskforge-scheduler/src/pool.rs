//! Worker pool: a fixed set of tokio tasks running `dequeue_blocking → advance`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use taskforge_core::error::TaskForgeError;
use taskforge_core::types::{TaskEvent, TaskEventKind, TaskStatus};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::orchestrator::WorkflowOrchestrator;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    /// Workers currently advancing a task.
    pub busy: usize,
    /// Tasks driven to a terminal status.
    pub processed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    busy: AtomicUsize,
    processed: AtomicU64,
}

pub struct WorkerPool;

impl WorkerPool {
    /// Start `workers` workers. Must be called inside a tokio runtime.
    pub fn spawn(
        orchestrator: Arc<WorkflowOrchestrator>,
        workers: usize,
        dequeue_timeout: Duration,
    ) -> PoolHandle {
        let workers = workers.max(1);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let counters = Arc::new(Counters::default());

        for worker_id in 0..workers {
            tracker.spawn(worker_loop(
                worker_id,
                orchestrator.clone(),
                dequeue_timeout,
                shutdown.clone(),
                counters.clone(),
            ));
        }
        tracker.close();
        tracing::info!("👷 Worker pool started ({} workers)", workers);

        PoolHandle {
            workers,
            shutdown,
            tracker,
            counters,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    orchestrator: Arc<WorkflowOrchestrator>,
    dequeue_timeout: Duration,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
) {
    tracing::debug!("Worker {} up", worker_id);
    loop {
        let task = match orchestrator
            .manager()
            .dequeue_blocking(dequeue_timeout, &shutdown)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(TaskForgeError::Cancelled) => break,
            Err(e) => {
                tracing::error!("Worker {} dequeue failed: {}", worker_id, e);
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }
        };

        let task_id = task.task_id.clone();
        counters.busy.fetch_add(1, Ordering::SeqCst);
        let outcome = AssertUnwindSafe(orchestrator.advance(task))
            .catch_unwind()
            .await;
        counters.busy.fetch_sub(1, Ordering::SeqCst);
        counters.processed.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(status) => tracing::debug!("Worker {} finished '{}': {}", worker_id, task_id, status),
            Err(_) => {
                tracing::error!("💥 Worker {} recovered from a panic in '{}'", worker_id, task_id);
                settle_after_panic(&orchestrator, &task_id);
            }
        }
    }
    tracing::debug!("Worker {} stopped", worker_id);
}

/// Finalise a task whose `advance` panicked. AWAITING_APPROVAL has no FAILED
/// edge, so such a task is escalated and its gate disarmed.
fn settle_after_panic(orchestrator: &WorkflowOrchestrator, task_id: &str) {
    const REASON: &str = "orchestrator panicked";
    let manager = orchestrator.manager();
    let status = match manager.fail(task_id, REASON) {
        Ok(()) => TaskStatus::Failed,
        Err(TaskForgeError::InvalidTransition { .. }) => {
            orchestrator.approvals().disarm(task_id);
            match manager.escalate(task_id, REASON, Vec::new()) {
                Ok(()) => TaskStatus::Escalated,
                Err(e) => {
                    tracing::error!("Could not escalate '{}' after panic: {}", task_id, e);
                    return;
                }
            }
        }
        Err(e) => {
            tracing::error!("Could not fail '{}' after panic: {}", task_id, e);
            return;
        }
    };
    orchestrator.notifier().publish(TaskEvent::new(
        task_id,
        TaskEventKind::Terminal,
        status,
        None,
        REASON,
    ));
}

/// Control handle for a running pool.
pub struct PoolHandle {
    workers: usize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    counters: Arc<Counters>,
}

impl PoolHandle {
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            busy: self.counters.busy.load(Ordering::SeqCst),
            processed: self.counters.processed.load(Ordering::SeqCst),
        }
    }

    /// Stop taking new work. Tasks already being advanced run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every worker to exit.
    pub async fn join(&self) {
        self.tracker.wait().await;
    }

    pub async fn shutdown_and_join(self) {
        self.shutdown();
        self.join().await;
        tracing::info!("👷 Worker pool stopped ({} task(s) processed)", self.stats().processed);
    }
}
