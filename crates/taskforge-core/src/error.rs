//! TaskForge error taxonomy.

use crate::types::TaskStatus;

/// Every failure the scheduler can report.
#[derive(Debug, thiserror::Error)]
pub enum TaskForgeError {
    // ── Admission / caller errors ──────────────────────────
    #[error("Task '{0}' already exists")]
    DuplicateTask(String),

    #[error("Queue is full (max size: {0})")]
    QueueFull(usize),

    #[error("Invalid transition for task '{task_id}': {from} → {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    // ── Collaborator errors ────────────────────────────────
    #[error("Transient collaborator error: {0}")]
    TransientCollaborator(String),

    #[error("Permanent collaborator error: {0}")]
    PermanentCollaborator(String),

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    // ── Escalations ────────────────────────────────────────
    #[error("Approval for task '{0}' timed out")]
    ApprovalTimeout(String),

    #[error("Verification rejected after {iterations} iteration(s) (score {score:.1}, {} gap(s))", .gaps.len())]
    VerificationRejected {
        iterations: u32,
        score: f64,
        gaps: Vec<String>,
    },

    // ── Infrastructure ─────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Lock poisoned: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl TaskForgeError {
    /// Worth retrying: the dependency may recover.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskForgeError::TransientCollaborator(_) | TaskForgeError::CircuitOpen(_)
        )
    }

    /// Returned synchronously to the submitter, never retried internally.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            TaskForgeError::DuplicateTask(_)
                | TaskForgeError::QueueFull(_)
                | TaskForgeError::InvalidTransition { .. }
        )
    }

    /// Ends in ESCALATED rather than FAILED.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            TaskForgeError::ApprovalTimeout(_) | TaskForgeError::VerificationRejected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskForgeError>;
