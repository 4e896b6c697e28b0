//! Circuit breaker: per-dependency failure gate.
//!
//! CLOSED → OPEN after `failure_threshold` consecutive failures inside the
//! sliding window. OPEN → HALF_OPEN once the cooldown elapses; exactly one
//! trial call is let through. HALF_OPEN → CLOSED on trial success, back to
//! OPEN on trial failure.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use taskforge_core::config::BreakerConfig;
use taskforge_core::error::{Result, TaskForgeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Health report for one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    /// Consecutive failures still inside the window.
    pub recent_failures: usize,
    /// Calls rejected without reaching the dependency.
    pub rejected: u64,
    /// Time until the next trial call is allowed, while OPEN.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    rejected: u64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            window,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                rejected: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.window_secs),
            Duration::from_secs(config.cooldown_secs),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // Breaker state is plain counters; a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, promoting OPEN → HALF_OPEN once the cooldown has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open
            && inner.opened_at.is_some_and(|at| at.elapsed() >= self.cooldown)
        {
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = false;
            tracing::info!("🔌 Circuit '{}' half-open, allowing a trial call", self.name);
        }
    }

    /// Time until a call may pass again. Zero when CLOSED or a trial slot is free.
    pub fn retry_in(&self) -> Duration {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Open => inner
                .opened_at
                .map(|at| self.cooldown.saturating_sub(at.elapsed()))
                .unwrap_or(self.cooldown),
            _ => Duration::ZERO,
        }
    }

    fn try_acquire(&self) -> Result<CallGuard<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                inner.rejected += 1;
                return Err(TaskForgeError::CircuitOpen(self.name.clone()));
            }
        };
        Ok(CallGuard {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Run `op` through the breaker. While OPEN, fails with `CircuitOpen`
    /// without calling `op`.
    ///
    /// Permanent collaborator errors and cancellation do not count as failures:
    /// the dependency answered, it just said no.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.try_acquire()?;
        let result = op().await;
        match &result {
            Ok(_) | Err(TaskForgeError::PermanentCollaborator(_)) => guard.settle(true),
            Err(TaskForgeError::Cancelled) => {}
            Err(_) => guard.settle(false),
        }
        result
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        if inner.state != BreakerState::Closed {
            tracing::info!("🔌 Circuit '{}' closed", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.failures.push_back(now);
        while inner
            .failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            inner.failures.pop_front();
        }

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failures.len() >= self.failure_threshold as usize,
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            inner.trial_in_flight = false;
            tracing::warn!(
                "🔌 Circuit '{}' opened after {} failure(s), cooldown {:?}",
                self.name,
                inner.failures.len(),
                self.cooldown
            );
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let retry_in_ms = match inner.state {
            BreakerState::Open => inner
                .opened_at
                .map(|at| self.cooldown.saturating_sub(at.elapsed()).as_millis() as u64),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            rejected: inner.rejected,
            retry_in_ms,
        }
    }

    /// Force CLOSED and forget recorded failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
        tracing::info!("🔌 Circuit '{}' reset", self.name);
    }
}

/// Admission ticket for one call. Dropping an unsettled trial frees the slot.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success();
        } else {
            self.breaker.on_failure();
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// One breaker per named dependency, created on first use.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(dependency, &self.config)))
            .clone()
    }

    /// Snapshots sorted by dependency name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset one breaker. Returns false if the dependency was never used.
    pub fn reset(&self, dependency: &str) -> bool {
        let breaker = self.lock().get(dependency).cloned();
        match breaker {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "code-host",
            threshold,
            Duration::from_secs(60),
            Duration::from_millis(cooldown_ms),
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TaskForgeError::TransientCollaborator("503".into()))
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_without_calling() {
        let b = breaker(3, 60_000);
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            assert!(fail(&b, &calls).await.is_err());
        }
        assert_eq!(b.state(), BreakerState::Open);

        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(matches!(err, TaskForgeError::CircuitOpen(name) if name == "code-host"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(b.snapshot().rejected, 1);
        assert!(b.retry_in() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let b = breaker(3, 60_000);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        fail(&b, &calls).await.ok();
        succeed(&b, &calls).await.unwrap();
        fail(&b, &calls).await.ok();
        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_failures_outside_window_expire() {
        let b = CircuitBreaker::new(
            "code-host",
            2,
            Duration::from_millis(20),
            Duration::from_secs(60),
        );
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().recent_failures, 1);

        // Two failures inside the window still trip it.
        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_trip() {
        let b = breaker(1, 60_000);
        let result: Result<()> = b
            .call(|| async { Err(TaskForgeError::PermanentCollaborator("bad request".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let b = breaker(1, 20);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let b = breaker(1, 20);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        tokio::time::sleep(Duration::from_millis(40)).await;
        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_trial_and_dropped_trial_releases_slot() {
        let b = Arc::new(breaker(1, 20));
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    started_tx.send(()).ok();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, TaskForgeError>(())
                })
                .await
            })
        };
        started_rx.await.unwrap();

        // Second caller is rejected while the trial is in flight.
        assert!(matches!(succeed(&b, &calls).await, Err(TaskForgeError::CircuitOpen(_))));

        trial.abort();
        let _ = trial.await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_registry_one_breaker_per_dependency() {
        let registry = BreakerRegistry::default();
        let a = registry.get("code-host");
        let b = registry.get("code-host");
        let c = registry.get("ticket-tracker");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["code-host", "ticket-tracker"]);
        assert!(registry.reset("code-host"));
        assert!(!registry.reset("chat-notifier"));
    }
}
