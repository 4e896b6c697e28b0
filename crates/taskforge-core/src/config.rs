//! TaskForge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TaskForgeError};

/// Hard ceiling on EXECUTION/VERIFICATION iterations.
pub const MAX_VERIFICATION_ITERATIONS: u32 = 3;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskForgeConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl TaskForgeConfig {
    /// Load config from the default path (~/.taskforge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskForgeError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskForge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskforge")
    }

    /// Apply `TASKFORGE_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var("TASKFORGE_WORKERS") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.workers.count = n,
                _ => tracing::warn!("Ignoring invalid TASKFORGE_WORKERS='{}'", raw),
            }
        }
        if let Ok(url) = std::env::var("TASKFORGE_NOTIFY_WEBHOOK_URL")
            && !url.is_empty()
        {
            self.notify.webhook_url = Some(url);
        }
    }

    /// Reject values the scheduler cannot honour.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(TaskForgeError::Config(msg.to_string()));
        if self.queue.max_queue_size == 0 {
            return fail("queue.max_queue_size must be > 0");
        }
        if self.queue.max_history_size == 0 {
            return fail("queue.max_history_size must be > 0");
        }
        if self.workers.count == 0 {
            return fail("workers.count must be > 0");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be > 0");
        }
        if self.breaker.failure_threshold == 0 {
            return fail("breaker.failure_threshold must be > 0");
        }
        if !(0.0..=100.0).contains(&self.verification.pass_threshold) {
            return fail("verification.pass_threshold must be within 0..=100");
        }
        if !(1..=MAX_VERIFICATION_ITERATIONS).contains(&self.verification.max_iterations) {
            return fail("verification.max_iterations must be within 1..=3");
        }
        Ok(())
    }
}

/// Admission and history bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

fn default_max_queue_size() -> usize { 100 }
fn default_max_history_size() -> usize { 1000 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_history_size: default_max_history_size(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
}

fn default_worker_count() -> usize { 4 }
fn default_dequeue_timeout_ms() -> u64 { 5_000 }

impl WorkerConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
        }
    }
}

/// Exponential backoff for capability calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: Option<u64>,
    #[serde(default = "bool_true")]
    pub jitter: bool,
    /// How many times an open circuit may defer a call without consuming an attempt.
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 2_000 }
fn default_max_delay_ms() -> Option<u64> { Some(10_000) }
fn default_max_deferrals() -> u32 { 10 }
fn bool_true() -> bool { true }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
            max_deferrals: default_max_deferrals(),
        }
    }
}

/// Per-dependency circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_window_secs() -> u64 { 60 }
fn default_cooldown_secs() -> u64 { 60 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Human approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_approval_timeout_secs() -> u64 { 24 * 60 * 60 }

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_secs: default_approval_timeout_secs() }
    }
}

/// EXECUTION/VERIFICATION loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_pass_threshold() -> f64 { 90.0 }
fn default_max_iterations() -> u32 { MAX_VERIFICATION_ITERATIONS }

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// Notification fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "bool_true")]
    pub log_events: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
}

fn default_history_size() -> usize { 100 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            log_events: true,
            webhook_url: None,
            webhook_headers: Vec::new(),
        }
    }
}
