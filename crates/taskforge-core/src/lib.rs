//! # TaskForge Core
//!
//! Shared vocabulary for the TaskForge scheduler: the error taxonomy,
//! TOML configuration, task/phase types and the trait seams for phase
//! capabilities and notification dispatchers.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::TaskForgeConfig;
pub use error::{Result, TaskForgeError};
pub use types::{
    Phase, PhaseInput, PhaseOutput, PhaseStatus, TaskEvent, TaskEventKind, TaskPriority,
    TaskStatus, WorkflowType,
};
