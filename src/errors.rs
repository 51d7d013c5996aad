// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Structural errors (`DuplicateTask`, `UnknownTask`, `Cycle`, `InvalidState`)
//! are returned synchronously by the mutating APIs and always leave the graph
//! untouched. `Execution` wraps a failure reported by a `TaskExecutor`; the
//! scheduler consumes those internally to drive retries and cascades.

use thiserror::Error;

use crate::dag::TaskStatus;
use crate::types::TaskId;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<TaskId> },

    #[error("Invalid state for task {task}: {status} ({reason})")]
    InvalidState {
        task: TaskId,
        status: TaskStatus,
        reason: String,
    },

    #[error("Ready queue is empty")]
    EmptyQueue,

    #[error("Execution of task {task} failed: {message}")]
    Execution { task: TaskId, message: String },

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedulerError {
    pub(crate) fn invalid_state(
        task: impl Into<TaskId>,
        status: TaskStatus,
        reason: impl Into<String>,
    ) -> Self {
        SchedulerError::InvalidState {
            task: task.into(),
            status,
            reason: reason.into(),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SchedulerError>;
