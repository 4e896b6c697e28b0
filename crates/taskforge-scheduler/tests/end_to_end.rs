//! Worker pool + orchestrator + manager through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use taskforge_core::error::Result;
use taskforge_core::traits::PhaseCapability;
use taskforge_core::types::{
    PhaseInput, PhaseOutput, TaskEventKind, TaskPriority, TaskStatus, WorkflowType,
};
use taskforge_scheduler::{
    ListQuery, OrchestratorSettings, PhaseCapabilities, RetryPolicy, TaskQueueManager,
    TaskRequest, WorkerPool, WorkflowOrchestrator,
};

/// Fails transiently on the first call for every task, then succeeds.
/// Each phase sits behind its own breaker so the warm-up failures stay under threshold.
struct FlakyOnce {
    name: &'static str,
    score: f64,
    calls: AtomicU32,
    seen: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl FlakyOnce {
    fn new(name: &'static str, score: f64) -> Arc<Self> {
        Arc::new(Self {
            name,
            score,
            calls: AtomicU32::new(0),
            seen: Default::default(),
        })
    }
}

#[async_trait]
impl PhaseCapability for FlakyOnce {
    fn name(&self) -> &str {
        self.name
    }

    fn dependency(&self) -> &str {
        self.name
    }

    async fn invoke(&self, input: &PhaseInput) -> Result<PhaseOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = self.seen.lock().unwrap().insert(input.task_id.clone());
        if first {
            return Ok(PhaseOutput::transient("warming up"));
        }
        Ok(PhaseOutput::success(serde_json::json!({ "phase": input.phase })).with_confidence(self.score))
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Some(Duration::from_millis(2)),
            jitter: false,
            max_deferrals: 5,
        },
        approval_timeout: Duration::from_millis(200),
        ..OrchestratorSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_workload_reaches_terminal_states() {
    let discovery = FlakyOnce::new("discovery", 100.0);
    let capabilities = PhaseCapabilities {
        discovery: discovery.clone(),
        planning: FlakyOnce::new("planning", 100.0),
        execution: FlakyOnce::new("execution", 100.0),
        verification: FlakyOnce::new("verification", 95.0),
    };
    let manager = Arc::new(TaskQueueManager::new(50, 50));
    let orchestrator = Arc::new(WorkflowOrchestrator::new(manager.clone(), capabilities, settings()));
    let mut events = orchestrator.notifier().subscribe();

    // Answer approvals as soon as tasks reach the gate: approve "fix-ok", ignore "fix-ignored".
    let approver = {
        let orchestrator = orchestrator.clone();
        let mut rx = orchestrator.notifier().subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.kind == TaskEventKind::AwaitingApproval && event.task_id == "fix-ok" {
                    orchestrator.signal_approval(&event.task_id, true);
                }
            }
        })
    };

    let pool = WorkerPool::spawn(orchestrator.clone(), 3, Duration::from_millis(50));

    let submit = |workflow, priority, key: &str| {
        orchestrator
            .submit(
                TaskRequest::new(workflow, priority, serde_json::json!({"key": key}))
                    .with_idempotency_key(key),
            )
            .unwrap()
    };
    submit(WorkflowType::TicketToFix, TaskPriority::Critical, "fix-ok");
    submit(WorkflowType::TicketToFix, TaskPriority::High, "fix-ignored");
    submit(WorkflowType::ErrorToTicket, TaskPriority::Normal, "error-1");
    submit(WorkflowType::InquiryOnly, TaskPriority::Low, "question-1");

    // A repeated idempotency key is rejected synchronously.
    let dup = orchestrator.submit(
        TaskRequest::new(WorkflowType::InquiryOnly, TaskPriority::Low, serde_json::Value::Null)
            .with_idempotency_key("question-1"),
    );
    assert!(dup.unwrap_err().is_admission());

    let mut terminal = 0;
    tokio::time::timeout(Duration::from_secs(10), async {
        while terminal < 4 {
            match events.recv().await {
                Ok(event) if event.kind == TaskEventKind::Terminal => terminal += 1,
                _ => {}
            }
        }
    })
    .await
    .expect("all tasks should reach a terminal status");

    assert_eq!(manager.get_status("fix-ok").unwrap(), TaskStatus::Completed);
    assert_eq!(manager.get_status("fix-ignored").unwrap(), TaskStatus::Escalated);
    assert_eq!(manager.get_status("error-1").unwrap(), TaskStatus::Completed);
    assert_eq!(manager.get_status("question-1").unwrap(), TaskStatus::Completed);

    // Every discovery retried exactly once.
    let task = manager.get_task("question-1").unwrap();
    assert_eq!(task.retry_count, 1);
    assert!(task.duration().is_some_and(|d| d >= chrono::Duration::zero()));
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 8);

    let metrics = manager.metrics().unwrap();
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.history_size, 4);
    assert_eq!(metrics.total_completed, 3);
    assert_eq!(metrics.total_escalated, 1);
    assert_eq!(metrics.total_enqueued, 4);

    let page = manager
        .list(&ListQuery {
            status: Some(TaskStatus::Completed),
            ..ListQuery::default()
        })
        .unwrap();
    assert_eq!(page.total, 3);

    pool.shutdown_and_join().await;
    approver.abort();
}

#[tokio::test]
async fn test_cancel_queued_task_before_dispatch() {
    let capabilities = PhaseCapabilities {
        discovery: FlakyOnce::new("discovery", 100.0),
        planning: FlakyOnce::new("planning", 100.0),
        execution: FlakyOnce::new("execution", 100.0),
        verification: FlakyOnce::new("verification", 100.0),
    };
    let manager = Arc::new(TaskQueueManager::new(10, 10));
    let orchestrator = WorkflowOrchestrator::new(manager.clone(), capabilities, settings());

    let id = orchestrator
        .submit(TaskRequest::new(WorkflowType::InquiryOnly, TaskPriority::Normal, serde_json::Value::Null))
        .unwrap();
    orchestrator.cancel(&id).unwrap();

    assert_eq!(manager.get_status(&id).unwrap(), TaskStatus::Cancelled);
    assert!(manager.dequeue().unwrap().is_none());
    assert_eq!(manager.history(5).unwrap()[0].task_id, id);
}
