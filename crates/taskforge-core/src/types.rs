//! Shared vocabulary: priorities, statuses, phases, workflow types and the
//! structured input/output exchanged with phase capabilities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::TaskForgeError;

/// Dispatch priority. `Critical` is dispatched before `High`, before `Normal`, before `Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::Critical => write!(f, "CRITICAL"),
            TaskPriority::High => write!(f, "HIGH"),
            TaskPriority::Normal => write!(f, "NORMAL"),
            TaskPriority::Low => write!(f, "LOW"),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    InProgress,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
    Escalated,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Queued,
        TaskStatus::InProgress,
        TaskStatus::AwaitingApproval,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Escalated,
    ];

    /// Terminal statuses move a task from the active map into history.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Escalated
        )
    }

    /// The allowed status graph. Nothing leaves a terminal status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Queued => matches!(next, InProgress | Cancelled),
            InProgress => matches!(
                next,
                AwaitingApproval | Completed | Failed | Cancelled | Escalated
            ),
            AwaitingApproval => matches!(next, InProgress | Cancelled | Escalated),
            Completed | Failed | Cancelled | Escalated => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::AwaitingApproval => "AWAITING_APPROVAL",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Escalated => "ESCALATED",
        };
        write!(f, "{s}")
    }
}

/// A workflow phase. Each phase invokes exactly one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Discovery,
    Planning,
    Execution,
    Verification,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Discovery => write!(f, "DISCOVERY"),
            Phase::Planning => write!(f, "PLANNING"),
            Phase::Execution => write!(f, "EXECUTION"),
            Phase::Verification => write!(f, "VERIFICATION"),
        }
    }
}

/// Which phase sequence a task runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    /// Ticket assigned → analyse → plan → human go/no-go → fix → verify.
    TicketToFix,
    /// Error report → analyse → plan → file a ticket.
    ErrorToTicket,
    /// Question answered from discovery alone.
    InquiryOnly,
}

impl WorkflowType {
    /// Ordered phases for this workflow.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            WorkflowType::TicketToFix => &[
                Phase::Discovery,
                Phase::Planning,
                Phase::Execution,
                Phase::Verification,
            ],
            WorkflowType::ErrorToTicket => &[Phase::Discovery, Phase::Planning, Phase::Execution],
            WorkflowType::InquiryOnly => &[Phase::Discovery],
        }
    }

    /// Whether an approval gate sits between planning and execution.
    pub fn requires_approval(&self) -> bool {
        matches!(self, WorkflowType::TicketToFix)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::TicketToFix => "ticket-to-fix",
            WorkflowType::ErrorToTicket => "error-to-ticket",
            WorkflowType::InquiryOnly => "inquiry-only",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = TaskForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ticket-to-fix" => Ok(WorkflowType::TicketToFix),
            "error-to-ticket" => Ok(WorkflowType::ErrorToTicket),
            "inquiry-only" => Ok(WorkflowType::InquiryOnly),
            other => Err(TaskForgeError::Config(format!(
                "Unknown workflow type: '{other}'"
            ))),
        }
    }
}

// ── Capability I/O ─────────────────────────────────────────

/// How a capability call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// Structured input handed to a phase capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseInput {
    pub task_id: String,
    pub workflow_type: WorkflowType,
    pub phase: Phase,
    /// The task payload, passed through untouched.
    pub payload: serde_json::Value,
    /// Results of phases that already succeeded.
    pub prior_results: BTreeMap<Phase, serde_json::Value>,
    /// EXECUTION/VERIFICATION iteration, starting at 1.
    pub iteration: u32,
    /// Gaps reported by the previous verification, empty on the first iteration.
    #[serde(default)]
    pub verification_gaps: Vec<String>,
}

/// Structured output returned by a phase capability.
///
/// The orchestrator routes on `status` and `confidence_score` only; `result` is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub status: PhaseStatus,
    #[serde(default)]
    pub result: serde_json::Value,
    /// 0–100, reported by verification.
    #[serde(default)]
    pub confidence_score: Option<f64>,
    /// Unmet acceptance criteria reported by verification.
    #[serde(default)]
    pub gaps: Vec<String>,
    /// Failure description for non-success statuses.
    #[serde(default)]
    pub error: Option<String>,
}

impl PhaseOutput {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            status: PhaseStatus::Success,
            result,
            confidence_score: None,
            gaps: Vec::new(),
            error: None,
        }
    }

    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::TransientFailure,
            result: serde_json::Value::Null,
            confidence_score: None,
            gaps: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::PermanentFailure,
            result: serde_json::Value::Null,
            confidence_score: None,
            gaps: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_confidence(mut self, score: f64) -> Self {
        self.confidence_score = Some(score);
        self
    }

    pub fn with_gaps<I, S>(mut self, gaps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gaps = gaps.into_iter().map(Into::into).collect();
        self
    }

    /// Failure description, falling back to the status name.
    pub fn error_message(&self) -> String {
        match (&self.error, self.status) {
            (Some(e), _) => e.clone(),
            (None, PhaseStatus::Success) => "success".into(),
            (None, PhaseStatus::TransientFailure) => "transient failure".into(),
            (None, PhaseStatus::PermanentFailure) => "permanent failure".into(),
        }
    }
}

// ── Task events ────────────────────────────────────────────

/// What kind of lifecycle moment a [`TaskEvent`] marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Enqueued,
    PhaseEntered,
    PhaseExited,
    AwaitingApproval,
    Terminal,
}

/// Fire-and-forget notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub kind: TaskEventKind,
    pub status: TaskStatus,
    pub phase: Option<Phase>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(
        task_id: &str,
        kind: TaskEventKind,
        status: TaskStatus,
        phase: Option<Phase>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
            status,
            phase,
            summary: summary.into(),
            timestamp: Utc::now(),
        }
    }
}
