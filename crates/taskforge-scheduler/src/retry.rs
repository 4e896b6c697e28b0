//! Retry policy: exponential backoff around a fallible async operation.
//!
//! Delay before retry `n` is `base_delay * 2^(n-1)`, capped at `max_delay`,
//! plus up to 25% random jitter when enabled.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use taskforge_core::config::RetryConfig;
use taskforge_core::error::{Result, TaskForgeError};
use tokio_util::sync::CancellationToken;

/// How the caller wants a failure handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Retry after backoff, consuming an attempt.
    Transient,
    /// Stop now.
    Permanent,
    /// Wait and try again without consuming an attempt (e.g. an open circuit).
    Deferred(Duration),
}

/// Outcome of [`RetryPolicy::execute`], with the counters for logging.
#[derive(Debug)]
pub struct RetryReport<T> {
    pub result: Result<T>,
    /// Attempts that reached the operation.
    pub attempts: u32,
    pub deferrals: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub jitter: bool,
    pub max_deferrals: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Some(Duration::from_secs(10)),
            jitter: true,
            max_deferrals: 10,
        }
    }
}

impl RetryPolicy {
    /// More attempts, shorter waits: for cheap idempotent calls.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(5)),
            ..Self::default()
        }
    }

    /// Fewer attempts, longer waits: for rate-limited dependencies.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Some(Duration::from_secs(30)),
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: config.max_delay_ms.map(Duration::from_millis),
            jitter: config.jitter,
            max_deferrals: config.max_deferrals,
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let mut delay = self.base_delay.saturating_mul(1u32 << exp);
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=0.25);
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + extra)).unwrap_or(delay);
        }
        // The cap holds with jitter applied.
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Transient collaborator errors retry, open circuits defer by `base_delay`,
    /// everything else is permanent.
    pub fn default_classifier(&self, err: &TaskForgeError) -> Classification {
        match err {
            TaskForgeError::CircuitOpen(_) => Classification::Deferred(self.base_delay),
            TaskForgeError::TransientCollaborator(_) => Classification::Transient,
            _ => Classification::Permanent,
        }
    }

    /// Run `op` until it succeeds, a failure classifies as permanent, attempts
    /// run out, or `cancel` fires during a wait. `on_retry(attempt, err, delay)`
    /// is called before each backoff sleep.
    ///
    /// The operation itself is never interrupted; cancellation is only
    /// observed between attempts.
    pub async fn execute<T, F, Fut, C, R>(
        &self,
        mut op: F,
        classify: C,
        mut on_retry: R,
        cancel: &CancellationToken,
    ) -> RetryReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&TaskForgeError) -> Classification,
        R: FnMut(u32, &TaskForgeError, Duration),
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut deferrals = 0u32;

        let result = loop {
            let err = match op(attempts + 1).await {
                Ok(value) => {
                    attempts += 1;
                    break Ok(value);
                }
                Err(err) => err,
            };

            let wait = match classify(&err) {
                Classification::Permanent => {
                    attempts += 1;
                    break Err(err);
                }
                Classification::Deferred(wait) => {
                    if deferrals >= self.max_deferrals {
                        tracing::warn!("⏳ Gave up after {} deferral(s): {}", deferrals, err);
                        break Err(err);
                    }
                    deferrals += 1;
                    tracing::debug!("⏳ Deferred ({}), waiting {:?}", err, wait);
                    wait
                }
                Classification::Transient => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        break Err(err);
                    }
                    let delay = self.delay_for(attempts);
                    on_retry(attempts, &err, delay);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break Err(TaskForgeError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        };

        RetryReport {
            result,
            attempts,
            deferrals,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Some(Duration::from_millis(5)),
            jitter: false,
            max_deferrals: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy { jitter: false, ..RetryPolicy::default() };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_millis(2500));
        }
        // Past the cap, jitter never pushes the delay over max_delay.
        // The capped attempts already exceed it before jitter, so they sit exactly on it.
        let cap = policy.max_delay.unwrap();
        for attempt in [4, 10, 40] {
            for _ in 0..100 {
                let d = policy.delay_for(attempt);
                assert_eq!(d, cap, "attempt {attempt}");
            }
        }
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryPolicy::aggressive().max_attempts, 5);
        assert_eq!(RetryPolicy::conservative().max_delay, Some(Duration::from_secs(30)));
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
        let from_cfg = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(from_cfg.base_delay, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let policy = fast(3);
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let report = policy
            .execute(
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(TaskForgeError::TransientCollaborator("503".into()))
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |e| policy.default_classifier(e),
                |attempt, _, _| retries.push(attempt),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.result.unwrap(), "ok");
        assert_eq!(report.attempts, 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_permanent_short_circuits() {
        let policy = fast(5);
        let calls = AtomicU32::new(0);
        let report: RetryReport<()> = policy
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TaskForgeError::PermanentCollaborator("400".into())) }
                },
                |e| policy.default_classifier(e),
                |_, _, _| {},
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(report.result, Err(TaskForgeError::PermanentCollaborator(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let policy = fast(3);
        let calls = AtomicU32::new(0);
        let report: RetryReport<()> = policy
            .execute(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Err(TaskForgeError::TransientCollaborator(format!("try {attempt}")))
                    }
                },
                |e| policy.default_classifier(e),
                |_, _, _| {},
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(report.result, Err(TaskForgeError::TransientCollaborator(m)) if m == "try 3"));
    }

    #[tokio::test]
    async fn test_deferral_does_not_consume_attempts() {
        let policy = fast(1);
        let calls = AtomicU32::new(0);
        let report = policy
            .execute(
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(TaskForgeError::CircuitOpen("code-host".into()))
                        } else {
                            Ok(n)
                        }
                    }
                },
                |e| policy.default_classifier(e),
                |_, _, _| {},
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.result.unwrap(), 2);
        assert_eq!(report.deferrals, 2);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_deferrals_are_bounded() {
        let policy = fast(3);
        let report: RetryReport<()> = policy
            .execute(
                |_| async { Err(TaskForgeError::CircuitOpen("code-host".into())) },
                |e| policy.default_classifier(e),
                |_, _, _| {},
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(report.result, Err(TaskForgeError::CircuitOpen(_))));
        assert_eq!(report.deferrals, 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            jitter: false,
            ..RetryPolicy::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report: RetryReport<()> = tokio::time::timeout(
            Duration::from_secs(1),
            policy.execute(
                |_| async { Err(TaskForgeError::TransientCollaborator("slow".into())) },
                |e| policy.default_classifier(e),
                |_, _, _| {},
                &cancel,
            ),
        )
        .await
        .expect("backoff must observe cancellation");
        assert!(matches!(report.result, Err(TaskForgeError::Cancelled)));
    }
}
