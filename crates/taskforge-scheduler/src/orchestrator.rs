//! Workflow orchestrator: the phase state machine.
//!
//! ```text
//! QUEUED → DISCOVERY → PLANNING → AWAITING_APPROVAL → EXECUTION ⇄ VERIFICATION → COMPLETED
//!              │           │              │                 │            │
//!              └───────────┴──── FAILED ──┼─────────────────┘            └── ESCALATED (3rd miss)
//!                                         ├── CANCELLED (rejected)
//!                                         └── ESCALATED (timeout)
//! ```
//!
//! Every capability call goes through the dependency's circuit breaker inside
//! the retry policy. Phase errors end the task; they never escape `advance`.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use taskforge_core::config::{MAX_VERIFICATION_ITERATIONS, TaskForgeConfig};
use taskforge_core::error::{Result, TaskForgeError};
use taskforge_core::traits::PhaseCapability;
use taskforge_core::types::{
    Phase, PhaseInput, PhaseOutput, PhaseStatus, TaskEvent, TaskEventKind, TaskStatus,
};
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalDecision, ApprovalGate, SignalOutcome};
use crate::breaker::BreakerRegistry;
use crate::manager::{CancelOutcome, TaskQueueManager};
use crate::notify::NotifyRouter;
use crate::retry::{Classification, RetryPolicy};
use crate::tasks::{Task, TaskRequest};

/// One capability per phase.
#[derive(Clone)]
pub struct PhaseCapabilities {
    pub discovery: Arc<dyn PhaseCapability>,
    pub planning: Arc<dyn PhaseCapability>,
    pub execution: Arc<dyn PhaseCapability>,
    pub verification: Arc<dyn PhaseCapability>,
}

impl PhaseCapabilities {
    pub fn for_phase(&self, phase: Phase) -> &Arc<dyn PhaseCapability> {
        match phase {
            Phase::Discovery => &self.discovery,
            Phase::Planning => &self.planning,
            Phase::Execution => &self.execution,
            Phase::Verification => &self.verification,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub approval_timeout: Duration,
    /// Minimum verification confidence (0–100) to complete.
    pub pass_threshold: f64,
    /// EXECUTION attempts before escalating. Never more than 3.
    pub max_iterations: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            approval_timeout: Duration::from_secs(24 * 60 * 60),
            pass_threshold: 90.0,
            max_iterations: MAX_VERIFICATION_ITERATIONS,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &TaskForgeConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.retry),
            approval_timeout: config.approval.timeout(),
            pass_threshold: config.verification.pass_threshold,
            max_iterations: config.verification.max_iterations,
        }
    }
}

/// Why a workflow stopped short of COMPLETED.
#[derive(Debug)]
enum Halt {
    Failed(String),
    Escalated { reason: String, gaps: Vec<String> },
    Cancelled(String),
}

impl From<TaskForgeError> for Halt {
    fn from(err: TaskForgeError) -> Self {
        match err {
            TaskForgeError::Cancelled => Halt::Cancelled("cancelled".into()),
            other => Halt::Failed(other.to_string()),
        }
    }
}

type Flow<T> = std::result::Result<T, Halt>;

/// Per-advance state.
struct Run<'a> {
    task: &'a Task,
    cancel: CancellationToken,
    prior: BTreeMap<Phase, serde_json::Value>,
}

pub struct WorkflowOrchestrator {
    manager: Arc<TaskQueueManager>,
    capabilities: PhaseCapabilities,
    breakers: Arc<BreakerRegistry>,
    approvals: Arc<ApprovalGate>,
    notifier: Arc<NotifyRouter>,
    settings: OrchestratorSettings,
}

impl WorkflowOrchestrator {
    pub fn new(
        manager: Arc<TaskQueueManager>,
        capabilities: PhaseCapabilities,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            manager,
            capabilities,
            breakers: Arc::new(BreakerRegistry::default()),
            approvals: Arc::new(ApprovalGate::new()),
            notifier: Arc::new(NotifyRouter::default()),
            settings,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalGate>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<NotifyRouter>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn manager(&self) -> &Arc<TaskQueueManager> {
        &self.manager
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn notifier(&self) -> &Arc<NotifyRouter> {
        &self.notifier
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    fn publish(
        &self,
        task_id: &str,
        kind: TaskEventKind,
        status: TaskStatus,
        phase: Option<Phase>,
        summary: impl Into<String>,
    ) {
        self.notifier
            .publish(TaskEvent::new(task_id, kind, status, phase, summary));
    }

    // ── Inbound surface ────────────────────────────────────

    /// Admit a request and announce it.
    pub fn submit(&self, request: TaskRequest) -> Result<String> {
        let workflow = request.workflow_type;
        let task_id = self.manager.submit(request)?;
        self.publish(
            &task_id,
            TaskEventKind::Enqueued,
            TaskStatus::Queued,
            None,
            format!("queued for {workflow}"),
        );
        Ok(task_id)
    }

    /// Forward an external go/no-go decision.
    pub fn signal_approval(&self, task_id: &str, approved: bool) -> SignalOutcome {
        self.approvals.signal(task_id, approved)
    }

    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        let outcome = self.manager.cancel(task_id)?;
        if outcome == CancelOutcome::Cancelled {
            self.publish(
                task_id,
                TaskEventKind::Terminal,
                TaskStatus::Cancelled,
                None,
                "cancelled before dispatch",
            );
        }
        Ok(outcome)
    }

    // ── State machine ──────────────────────────────────────

    /// Drive a dequeued task to a terminal status. Never fails: every phase
    /// error is recorded on the task.
    pub async fn advance(&self, task: Task) -> TaskStatus {
        tracing::info!(
            "▶️ Task '{}' started ({}, {})",
            task.task_id,
            task.workflow_type,
            task.priority
        );
        let outcome = self.run_workflow(&task).await;
        self.finish(&task.task_id, outcome)
    }

    async fn run_workflow(&self, task: &Task) -> Flow<serde_json::Value> {
        let mut run = Run {
            task,
            cancel: self.manager.cancellation_token(&task.task_id)?,
            prior: task.phase_results.clone(),
        };
        let phases = task.workflow_type.phases();
        let mut last = serde_json::Value::Null;

        for &phase in phases {
            match phase {
                Phase::Execution => {
                    if task.workflow_type.requires_approval() {
                        self.approval_gate(&run).await?;
                    }
                    if phases.contains(&Phase::Verification) {
                        return self.execute_and_verify(&mut run).await;
                    }
                    last = self.run_phase(&mut run, Phase::Execution, 1, &[]).await?.result;
                }
                // Driven together with EXECUTION.
                Phase::Verification => {}
                _ => last = self.run_phase(&mut run, phase, 1, &[]).await?.result,
            }
        }
        Ok(last)
    }

    /// Run one phase through retry + breaker.
    async fn run_phase(
        &self,
        run: &mut Run<'_>,
        phase: Phase,
        iteration: u32,
        gaps: &[String],
    ) -> Flow<PhaseOutput> {
        let task: &Task = run.task;
        let task_id = task.task_id.as_str();
        if run.cancel.is_cancelled() {
            return Err(Halt::Cancelled(format!("cancelled before {phase}")));
        }
        self.manager.enter_phase(task_id, phase)?;
        self.publish(
            task_id,
            TaskEventKind::PhaseEntered,
            TaskStatus::InProgress,
            Some(phase),
            format!("entered {phase} (iteration {iteration})"),
        );

        let capability = self.capabilities.for_phase(phase).clone();
        let breaker = self.breakers.get(capability.dependency());
        let input = PhaseInput {
            task_id: task_id.to_string(),
            workflow_type: task.workflow_type,
            phase,
            payload: task.payload.clone(),
            prior_results: run.prior.clone(),
            iteration,
            verification_gaps: gaps.to_vec(),
        };
        let retry = &self.settings.retry;

        let capability_ref: &dyn PhaseCapability = capability.as_ref();
        let breaker_ref = breaker.as_ref();
        let input_ref = &input;
        let report = retry
            .execute(
                move |_attempt| async move {
                    breaker_ref
                        .call(|| invoke_capability(capability_ref, input_ref))
                        .await
                },
                |err| match err {
                    TaskForgeError::CircuitOpen(_) => {
                        Classification::Deferred(breaker.retry_in().max(retry.base_delay))
                    }
                    other => retry.default_classifier(other),
                },
                |attempt, err, delay| {
                    tracing::warn!(
                        "🔁 Task '{}' {} attempt {} failed: {} (retrying in {:?})",
                        task_id,
                        phase,
                        attempt,
                        err,
                        delay
                    );
                    if let Err(e) = self.manager.record_attempt_failure(task_id, &err.to_string()) {
                        tracing::warn!("⚠️ Could not record retry for '{}': {}", task_id, e);
                    }
                },
                &run.cancel,
            )
            .await;

        match report.result {
            Ok(output) => {
                self.manager
                    .record_phase_result(task_id, phase, output.result.clone())?;
                run.prior.insert(phase, output.result.clone());
                tracing::info!(
                    "✔️ Task '{}' {} done ({} attempt(s), {:?})",
                    task_id,
                    phase,
                    report.attempts,
                    report.elapsed
                );
                self.publish(
                    task_id,
                    TaskEventKind::PhaseExited,
                    TaskStatus::InProgress,
                    Some(phase),
                    format!("{phase} succeeded"),
                );
                Ok(output)
            }
            Err(TaskForgeError::Cancelled) if run.cancel.is_cancelled() => {
                Err(Halt::Cancelled(format!("cancelled during {phase}")))
            }
            Err(e) => {
                let message = format!("{phase} failed after {} attempt(s): {e}", report.attempts);
                self.publish(
                    task_id,
                    TaskEventKind::PhaseExited,
                    TaskStatus::InProgress,
                    Some(phase),
                    message.clone(),
                );
                Err(Halt::Failed(message))
            }
        }
    }

    /// Suspend on the approval gate. Only returns `Ok` when approved.
    async fn approval_gate(&self, run: &Run<'_>) -> Flow<()> {
        let task_id = run.task.task_id.as_str();
        if run.cancel.is_cancelled() {
            return Err(Halt::Cancelled("cancelled before approval".into()));
        }

        let timeout = self.settings.approval_timeout;
        let ticket = self.approvals.arm(task_id);
        let deadline_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Err(e) = self.manager.await_approval(task_id, deadline_at) {
            self.approvals.disarm(task_id);
            return Err(e.into());
        }
        tracing::info!("✋ Task '{}' awaiting approval until {}", task_id, deadline_at);
        self.publish(
            task_id,
            TaskEventKind::AwaitingApproval,
            TaskStatus::AwaitingApproval,
            None,
            format!("awaiting approval until {}", deadline_at.to_rfc3339()),
        );

        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(MAX_APPROVAL_WAIT_SECS));
        match self.approvals.wait(ticket, deadline, &run.cancel).await {
            ApprovalDecision::Approved => {
                self.manager.resume_from_approval(task_id)?;
                Ok(())
            }
            ApprovalDecision::Rejected => Err(Halt::Cancelled("approval rejected".into())),
            ApprovalDecision::TimedOut => Err(Halt::Escalated {
                reason: TaskForgeError::ApprovalTimeout(task_id.to_string()).to_string(),
                gaps: Vec::new(),
            }),
            ApprovalDecision::Cancelled => {
                Err(Halt::Cancelled("cancelled while awaiting approval".into()))
            }
        }
    }

    /// EXECUTION → VERIFICATION, looping on low scores. The third miss escalates.
    async fn execute_and_verify(&self, run: &mut Run<'_>) -> Flow<serde_json::Value> {
        let task: &Task = run.task;
        let max_iterations = self
            .settings
            .max_iterations
            .clamp(1, MAX_VERIFICATION_ITERATIONS);
        let mut gaps: Vec<String> = Vec::new();
        let mut score = 0.0;

        for iteration in 1..=max_iterations {
            self.manager.begin_iteration(&task.task_id, iteration)?;
            self.run_phase(run, Phase::Execution, iteration, &gaps).await?;
            let verdict = self
                .run_phase(run, Phase::Verification, iteration, &gaps)
                .await?;

            score = verdict.confidence_score.unwrap_or(0.0);
            if score >= self.settings.pass_threshold {
                tracing::info!(
                    "🎯 Task '{}' verified at {:.1} on iteration {}",
                    task.task_id,
                    score,
                    iteration
                );
                return Ok(verdict.result);
            }
            gaps = verdict.gaps;
            tracing::info!(
                "🔁 Task '{}' scored {:.1} < {:.1} on iteration {}/{} ({} gap(s))",
                task.task_id,
                score,
                self.settings.pass_threshold,
                iteration,
                max_iterations,
                gaps.len()
            );
        }

        let reason = TaskForgeError::VerificationRejected {
            iterations: max_iterations,
            score,
            gaps: gaps.clone(),
        }
        .to_string();
        Err(Halt::Escalated { reason, gaps })
    }

    /// Record the terminal status and announce it.
    fn finish(&self, task_id: &str, outcome: Flow<serde_json::Value>) -> TaskStatus {
        let (status, summary, recorded) = match outcome {
            Ok(result) => (
                TaskStatus::Completed,
                "completed".to_string(),
                self.manager.complete(task_id, result),
            ),
            Err(Halt::Failed(error)) => (
                TaskStatus::Failed,
                error.clone(),
                self.manager.fail(task_id, error),
            ),
            Err(Halt::Escalated { reason, gaps }) => (
                TaskStatus::Escalated,
                reason.clone(),
                self.manager.escalate(task_id, reason, gaps),
            ),
            Err(Halt::Cancelled(reason)) => (
                TaskStatus::Cancelled,
                reason.clone(),
                self.manager.mark_cancelled(task_id, reason),
            ),
        };

        let status = match recorded {
            Ok(()) => status,
            Err(e) => {
                tracing::error!("💥 Could not record {} for task '{}': {}", status, task_id, e);
                // Still owned by this worker: hand it to a human instead of leaving it active.
                match self.manager.get_status(task_id) {
                    Ok(current) if !current.is_terminal() => {
                        match self.manager.escalate(
                            task_id,
                            format!("could not record {status}: {e}"),
                            Vec::new(),
                        ) {
                            Ok(()) => TaskStatus::Escalated,
                            Err(_) => current,
                        }
                    }
                    Ok(current) => current,
                    Err(_) => status,
                }
            }
        };

        let phase = self.manager.get_task(task_id).ok().and_then(|t| t.phase);
        self.publish(task_id, TaskEventKind::Terminal, status, phase, summary);
        status
    }
}

/// Upper bound on an approval wait when the configured timeout overflows the clock.
const MAX_APPROVAL_WAIT_SECS: u64 = 365 * 24 * 60 * 60;

/// Call a capability, folding its output status and any panic into the error taxonomy.
async fn invoke_capability(
    capability: &dyn PhaseCapability,
    input: &PhaseInput,
) -> Result<PhaseOutput> {
    let outcome = AssertUnwindSafe(capability.invoke(input))
        .catch_unwind()
        .await;

    match outcome {
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!("💥 Capability '{}' panicked: {}", capability.name(), msg);
            Err(TaskForgeError::PermanentCollaborator(format!(
                "capability '{}' panicked: {msg}",
                capability.name()
            )))
        }
        Ok(Err(e @ (TaskForgeError::TransientCollaborator(_)
        | TaskForgeError::PermanentCollaborator(_)
        | TaskForgeError::CircuitOpen(_)))) => Err(e),
        // Anything else, `Cancelled` included, is a collaborator fault.
        Ok(Err(other)) => Err(TaskForgeError::PermanentCollaborator(format!(
            "{}: {other}",
            capability.name()
        ))),
        Ok(Ok(output)) => match output.status {
            PhaseStatus::Success => Ok(output),
            PhaseStatus::TransientFailure => {
                Err(TaskForgeError::TransientCollaborator(output.error_message()))
            }
            PhaseStatus::PermanentFailure => {
                Err(TaskForgeError::PermanentCollaborator(output.error_message()))
            }
        },
    }
}
