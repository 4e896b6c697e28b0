//! # TaskForge Scheduler
//!
//! Priority task queue, resilience policies and the multi-phase workflow
//! state machine.
//!
//! ## Design Principles
//! - Single process, in-memory state, explicit instances (no globals)
//! - One lock for queue + task records; breakers lock independently
//! - Every wait is cancellable: dequeue, approval, retry backoff
//! - A failing task never takes a worker down
//!
//! ## Architecture
//! ```text
//! submit(TaskRequest) → TaskQueueManager (PriorityQueue + TaskStore)
//!                            │ dequeue_blocking
//!                       WorkerPool (N tokio tasks)
//!                            │ advance
//!                  WorkflowOrchestrator
//!   ├── DISCOVERY ─┐
//!   ├── PLANNING   ├── RetryPolicy → CircuitBreaker → PhaseCapability
//!   ├── ApprovalGate (arm / wait / signal, 24h timeout)
//!   ├── EXECUTION ⇄ VERIFICATION (≤ 3 iterations, pass ≥ 90)
//!   └── on every transition → NotifyRouter → Dispatchers (log, webhook)
//! ```

pub mod approval;
pub mod breaker;
pub mod dispatch;
pub mod manager;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod test_support;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalTicket, SignalOutcome};
pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use dispatch::{LogDispatcher, WebhookDispatcher, dispatchers_from_config};
pub use manager::{CancelOutcome, ListQuery, QueueMetrics, TaskPage, TaskQueueManager};
pub use notify::NotifyRouter;
pub use orchestrator::{OrchestratorSettings, PhaseCapabilities, WorkflowOrchestrator};
pub use pool::{PoolHandle, PoolStats, WorkerPool};
pub use queue::PriorityQueue;
pub use retry::{Classification, RetryPolicy, RetryReport};
pub use store::TaskStore;
pub use tasks::{Task, TaskRequest};
