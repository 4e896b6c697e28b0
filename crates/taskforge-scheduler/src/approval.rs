//! Approval gate: suspends a workflow until a human says go or no-go.
//!
//! Push-based: `arm` parks a oneshot sender under the task id and `signal`
//! fires it. Waiting never polls, and only the waiting worker is suspended.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Remembered ids of gates that already gave up, for late-signal logging.
const EXPIRED_MEMORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    /// Handed to the waiting workflow.
    Delivered,
    /// The gate already timed out or was cancelled; ignored.
    Late,
    /// No gate was ever armed for this id (or it aged out of memory).
    Unknown,
}

/// Registration returned by [`ApprovalGate::arm`], consumed by [`ApprovalGate::wait`].
#[derive(Debug)]
pub struct ApprovalTicket {
    task_id: String,
    rx: oneshot::Receiver<bool>,
}

impl ApprovalTicket {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

#[derive(Default)]
struct GateInner {
    waiting: HashMap<String, oneshot::Sender<bool>>,
    expired: VecDeque<String>,
}

impl GateInner {
    fn remember_expired(&mut self, task_id: &str) {
        self.expired.push_back(task_id.to_string());
        if self.expired.len() > EXPIRED_MEMORY {
            self.expired.pop_front();
        }
    }
}

#[derive(Default)]
pub struct ApprovalGate {
    inner: Mutex<GateInner>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter. Call before the task becomes AWAITING_APPROVAL so
    /// no signal can slip in between.
    pub fn arm(&self, task_id: &str) -> ApprovalTicket {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        inner.expired.retain(|id| id != task_id);
        if inner.waiting.insert(task_id.to_string(), tx).is_some() {
            tracing::warn!("⚠️ Approval gate for '{}' re-armed", task_id);
        }
        ApprovalTicket {
            task_id: task_id.to_string(),
            rx,
        }
    }

    /// Drop a registration that will never be waited on.
    pub fn disarm(&self, task_id: &str) {
        self.lock().waiting.remove(task_id);
    }

    /// Suspend until a signal arrives, `deadline` passes, or `cancel` fires.
    pub async fn wait(
        &self,
        ticket: ApprovalTicket,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ApprovalDecision {
        let ApprovalTicket { task_id, mut rx } = ticket;

        let decision = tokio::select! {
            biased;
            signal = &mut rx => match signal {
                Ok(true) => ApprovalDecision::Approved,
                Ok(false) => ApprovalDecision::Rejected,
                // Sender dropped: re-armed or disarmed elsewhere.
                Err(_) => ApprovalDecision::Cancelled,
            },
            _ = cancel.cancelled() => ApprovalDecision::Cancelled,
            _ = tokio::time::sleep_until(deadline) => ApprovalDecision::TimedOut,
        };

        if matches!(decision, ApprovalDecision::TimedOut | ApprovalDecision::Cancelled) {
            let mut inner = self.lock();
            if inner.waiting.remove(&task_id).is_none() {
                // A signal took the sender while we were giving up; honour it.
                if let Ok(approved) = rx.try_recv() {
                    return if approved {
                        ApprovalDecision::Approved
                    } else {
                        ApprovalDecision::Rejected
                    };
                }
            }
            inner.remember_expired(&task_id);
            tracing::info!("⌛ Approval wait for '{}' ended: {:?}", task_id, decision);
        }
        decision
    }

    /// Deliver an approval decision. Safe to call more than once or too late.
    pub fn signal(&self, task_id: &str, approved: bool) -> SignalOutcome {
        let mut inner = self.lock();
        if let Some(tx) = inner.waiting.remove(task_id) {
            if tx.send(approved).is_ok() {
                tracing::info!(
                    "👍 Approval signal for '{}': {}",
                    task_id,
                    if approved { "approved" } else { "rejected" }
                );
                return SignalOutcome::Delivered;
            }
            inner.remember_expired(task_id);
        }
        if inner.expired.iter().any(|id| id == task_id) {
            tracing::info!("⌛ Late approval signal for '{}' ignored", task_id);
            SignalOutcome::Late
        } else {
            tracing::warn!("⚠️ Approval signal for unknown task '{}'", task_id);
            SignalOutcome::Unknown
        }
    }

    /// Task ids currently waiting, sorted.
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().waiting.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_not_lost() {
        let gate = ApprovalGate::new();
        let ticket = gate.arm("t1");
        assert_eq!(gate.signal("t1", true), SignalOutcome::Delivered);
        let decision = gate.wait(ticket, far(), &CancellationToken::new()).await;
        assert_eq!(decision, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn test_rejection() {
        let gate = Arc::new(ApprovalGate::new());
        let ticket = gate.arm("t1");
        assert_eq!(gate.pending(), vec!["t1".to_string()]);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(ticket, far(), &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.signal("t1", false);
        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Rejected);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_then_late_signal() {
        let gate = ApprovalGate::new();
        let ticket = gate.arm("t1");
        let deadline = Instant::now() + Duration::from_millis(20);
        let decision = gate.wait(ticket, deadline, &CancellationToken::new()).await;
        assert_eq!(decision, ApprovalDecision::TimedOut);

        assert_eq!(gate.signal("t1", true), SignalOutcome::Late);
        assert_eq!(gate.signal("t1", true), SignalOutcome::Late);
        assert_eq!(gate.signal("never-armed", true), SignalOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly() {
        let gate = ApprovalGate::new();
        let ticket = gate.arm("t1");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let decision = tokio::time::timeout(Duration::from_secs(1), gate.wait(ticket, far(), &cancel))
            .await
            .expect("cancelled wait must return promptly");
        assert_eq!(decision, ApprovalDecision::Cancelled);
        assert_eq!(gate.signal("t1", true), SignalOutcome::Late);
    }
}
