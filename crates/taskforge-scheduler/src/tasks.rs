//! Task definitions: the core data model for scheduled work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskforge_core::types::{Phase, TaskPriority, TaskStatus, WorkflowType};

/// A unit of work moving through a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID (caller-supplied idempotency key or generated).
    pub task_id: String,
    /// Which phase sequence applies.
    pub workflow_type: WorkflowType,
    /// Opaque data handed to phase capabilities.
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Current phase, meaningful while IN_PROGRESS / AWAITING_APPROVAL.
    pub phase: Option<Phase>,
    /// Retries scheduled in the current phase. Reset at phase entry.
    pub retry_count: u32,
    /// Retry count of every phase that ran.
    #[serde(default)]
    pub phase_retries: BTreeMap<Phase, u32>,
    /// Successful output per phase.
    #[serde(default)]
    pub phase_results: BTreeMap<Phase, serde_json::Value>,
    /// EXECUTION/VERIFICATION iteration (0 until execution starts).
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Output of the last successful phase, or the final output at completion.
    pub result: Option<serde_json::Value>,
    /// Last recorded failure description.
    pub error: Option<String>,
    /// Unmet acceptance criteria attached on verification escalation.
    #[serde(default)]
    pub verification_gaps: Vec<String>,
    /// Back-reference for sub-tasks spawned by a phase.
    pub parent_task_id: Option<String>,
    /// Wall-clock approval deadline while AWAITING_APPROVAL.
    pub approval_deadline: Option<DateTime<Utc>>,
    /// A cooperative cancellation was requested.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Task {
    /// Create a QUEUED task with an explicit id.
    pub fn new(
        task_id: impl Into<String>,
        workflow_type: WorkflowType,
        priority: TaskPriority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_type,
            payload,
            priority,
            status: TaskStatus::Queued,
            phase: None,
            retry_count: 0,
            phase_retries: BTreeMap::new(),
            phase_results: BTreeMap::new(),
            iteration: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            verification_gaps: Vec::new(),
            parent_task_id: None,
            approval_deadline: None,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time from dequeue to terminal status.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// A normalized work item produced by the ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Becomes the task id, so repeated submissions are rejected as duplicates.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
}

impl TaskRequest {
    pub fn new(workflow_type: WorkflowType, priority: TaskPriority, payload: serde_json::Value) -> Self {
        Self {
            workflow_type,
            priority,
            payload,
            idempotency_key: None,
            parent_task_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Build the QUEUED task this request describes.
    pub fn into_task(self) -> Task {
        let task_id = match self.idempotency_key {
            Some(key) if !key.trim().is_empty() => key,
            _ => generate_task_id(),
        };
        let mut task = Task::new(task_id, self.workflow_type, self.priority, self.payload);
        task.parent_task_id = self.parent_task_id;
        task
    }
}

fn generate_task_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4())
}
