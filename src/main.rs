//! # TaskForge CLI
//!
//! Runs batches of tasks through the scheduler with simulated phase
//! capabilities, and inspects configuration.
//!
//! Usage:
//!   taskforge config                         # Effective configuration (TOML)
//!   taskforge config --default               # Built-in defaults
//!   taskforge run --tasks tasks.json         # Run a batch, print metrics
//!   taskforge run --tasks t.json --reject    # Reject every approval request

mod simulate;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskforge_core::config::TaskForgeConfig;
use taskforge_core::types::TaskEventKind;
use taskforge_scheduler::{
    BreakerRegistry, NotifyRouter, OrchestratorSettings, TaskQueueManager, TaskRequest, WorkerPool,
    WorkflowOrchestrator, dispatchers_from_config,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskforge",
    version,
    about = "⚙️ TaskForge: priority task scheduling and workflow orchestration"
)]
struct Cli {
    /// Config file (default: ~/.taskforge/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration as TOML
    Config {
        /// Show built-in defaults instead of the effective config
        #[arg(long)]
        default: bool,
    },
    /// Run a batch of tasks to completion
    Run {
        /// JSON array of task requests
        #[arg(long)]
        tasks: String,

        /// Worker count (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Approve every approval request (default)
        #[arg(long, conflicts_with_all = ["reject", "ignore_approvals"])]
        approve: bool,

        /// Reject every approval request
        #[arg(long, conflicts_with = "ignore_approvals")]
        reject: bool,

        /// Leave approval requests unanswered until they time out
        #[arg(long)]
        ignore_approvals: bool,

        /// Approval timeout in seconds (overrides config)
        #[arg(long)]
        approval_timeout: Option<u64>,

        /// Confidence score reported by simulated verification
        #[arg(long, default_value = "95")]
        score: f64,

        /// Transient failures per phase run before success
        #[arg(long, default_value = "0")]
        flaky: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalMode {
    Approve,
    Reject,
    Ignore,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<TaskForgeConfig> {
    let mut config = match path {
        Some(p) => {
            let path = expand_path(p);
            TaskForgeConfig::load_from(&path)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => TaskForgeConfig::load()?,
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        "taskforge=debug,taskforge_scheduler=debug,taskforge_core=debug"
    } else {
        "taskforge=info,taskforge_scheduler=info,taskforge_core=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Config { default } => {
            let config = if default {
                TaskForgeConfig::default()
            } else {
                load_config(cli.config.as_deref())?
            };
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Run {
            tasks,
            workers,
            approve: _,
            reject,
            ignore_approvals,
            approval_timeout,
            score,
            flaky,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(n) = workers {
                config.workers.count = n.max(1);
            }
            if let Some(secs) = approval_timeout {
                config.approval.timeout_secs = secs;
            }
            let mode = if reject {
                ApprovalMode::Reject
            } else if ignore_approvals {
                ApprovalMode::Ignore
            } else {
                ApprovalMode::Approve
            };
            run_batch(config, &expand_path(&tasks), mode, score, flaky).await
        }
    }
}

async fn run_batch(
    config: TaskForgeConfig,
    tasks_path: &std::path::Path,
    mode: ApprovalMode,
    score: f64,
    flaky: u32,
) -> Result<()> {
    let raw = std::fs::read_to_string(tasks_path)
        .with_context(|| format!("reading {}", tasks_path.display()))?;
    let requests: Vec<TaskRequest> =
        serde_json::from_str(&raw).context("parsing task requests")?;

    let mut notifier = NotifyRouter::new(config.notify.history_size);
    for dispatcher in dispatchers_from_config(&config.notify) {
        notifier.register(dispatcher);
    }
    let orchestrator = Arc::new(
        WorkflowOrchestrator::new(
            Arc::new(TaskQueueManager::from_config(&config.queue)),
            simulate::capabilities(score, flaky),
            OrchestratorSettings::from_config(&config),
        )
        .with_breakers(Arc::new(BreakerRegistry::new(config.breaker.clone())))
        .with_notifier(Arc::new(notifier)),
    );

    // Subscribe before anything is submitted so no terminal event is missed.
    let mut events = orchestrator.notifier().subscribe();
    let approver = spawn_approver(orchestrator.clone(), mode);
    let pool = WorkerPool::spawn(
        orchestrator.clone(),
        config.workers.count,
        config.workers.dequeue_timeout(),
    );

    let mut pending: HashSet<String> = HashSet::new();
    let mut rejected = 0usize;
    for request in requests {
        match orchestrator.submit(request) {
            Ok(task_id) => {
                pending.insert(task_id);
            }
            Err(e) => {
                rejected += 1;
                tracing::warn!("⚠️ Submission rejected: {}", e);
            }
        }
    }
    tracing::info!(
        "📥 {} task(s) submitted, {} rejected ({} workers)",
        pending.len(),
        rejected,
        config.workers.count
    );

    let interrupted = tokio::select! {
        _ = wait_for_terminal(&orchestrator, &mut events, &mut pending) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        tracing::warn!("🛑 Interrupted, cancelling {} outstanding task(s)", pending.len());
        for task_id in &pending {
            if let Err(e) = orchestrator.cancel(task_id) {
                tracing::warn!("Cancel '{}' failed: {}", task_id, e);
            }
        }
    }

    pool.shutdown();
    pool.join().await;
    approver.abort();

    let manager = orchestrator.manager();
    let report = serde_json::json!({
        "metrics": manager.metrics()?,
        "pool": pool.stats(),
        "breakers": orchestrator.breakers().snapshot(),
        "tasks": manager.history(usize::MAX)?
            .iter()
            .map(|t| serde_json::json!({
                "task_id": t.task_id,
                "workflow_type": t.workflow_type,
                "status": t.status,
                "retry_count": t.retry_count,
                "iteration": t.iteration,
                "duration_ms": t.duration().map(|d| d.num_milliseconds()),
                "error": t.error,
                "gaps": t.verification_gaps,
            }))
            .collect::<Vec<_>>(),
        "submission_rejected": rejected,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Answer every approval request according to `mode`.
fn spawn_approver(
    orchestrator: Arc<WorkflowOrchestrator>,
    mode: ApprovalMode,
) -> tokio::task::JoinHandle<()> {
    let mut events = orchestrator.notifier().subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Approver lagged by {} event(s)", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if event.kind != TaskEventKind::AwaitingApproval {
                continue;
            }
            let outcome = match mode {
                ApprovalMode::Approve => orchestrator.signal_approval(&event.task_id, true),
                ApprovalMode::Reject => orchestrator.signal_approval(&event.task_id, false),
                ApprovalMode::Ignore => continue,
            };
            tracing::info!("✍️ Approval for '{}' ({:?}): {:?}", event.task_id, mode, outcome);
        }
    })
}

/// Evicted from history counts as finished.
fn still_running(manager: &TaskQueueManager, task_id: &str) -> bool {
    manager
        .get_status(task_id)
        .is_ok_and(|status| !status.is_terminal())
}

/// Block until every id in `pending` has reached a terminal status.
async fn wait_for_terminal(
    orchestrator: &WorkflowOrchestrator,
    events: &mut tokio::sync::broadcast::Receiver<taskforge_core::types::TaskEvent>,
    pending: &mut HashSet<String>,
) {
    let manager = orchestrator.manager();
    pending.retain(|id| still_running(manager, id));

    while !pending.is_empty() {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(event)) => {
                if event.kind == TaskEventKind::Terminal {
                    pending.remove(&event.task_id);
                }
            }
            Ok(Err(RecvError::Closed)) => break,
            // Lagged or quiet: reconcile against the manager.
            Ok(Err(RecvError::Lagged(_))) | Err(_) => {
                pending.retain(|id| still_running(manager, id));
            }
        }
    }
}
