// src/engine/mod.rs

//! Scheduling engine.
//!
//! This module ties together:
//! - the dependency graph (readiness, cascades, retries)
//! - the ready queue (which task runs next)
//! - the worker pool (how many run at once)
//! - the dispatch loop that reacts to executor reports
//!
//! The synchronous, deterministic state machine lives in [`core`]; the
//! async shell that owns channels, timers and worker tasks is in [`runtime`];
//! [`scheduler`] is the public handle callers hold.

use tracing::Span;

use crate::dag::Task;
use crate::types::{RetryPolicy, TaskId};

/// A task plus the ids it must wait on, for batch submission.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task: Task,
    pub after: Vec<TaskId>,
}

impl TaskSpec {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            after: Vec::new(),
        }
    }

    pub fn after(mut self, dependency: impl Into<TaskId>) -> Self {
        self.after.push(dependency.into());
        self
    }
}

/// Construction-time options for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Worker pool capacity (clamped to at least 1).
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Span every log line of this scheduler is recorded under. The host
    /// decides name and fields; nothing in the engine reaches for a global.
    pub span: Span,
}

impl SchedulerOptions {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            span: tracing::info_span!("scheduler"),
        }
    }
}

pub mod core;
pub mod runtime;
pub mod scheduler;

pub use self::core::{CoreCommand, CoreStep, SchedulerCore};
pub use scheduler::Scheduler;
