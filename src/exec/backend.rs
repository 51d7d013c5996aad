// src/exec/backend.rs

//! Pluggable executor abstraction.
//!
//! The scheduler talks to a [`TaskExecutor`] and never interprets task
//! payloads itself. Production code uses [`ShellExecutor`]; tests provide
//! their own implementation that scripts outcomes without spawning processes.
//!
//! [`ShellExecutor`]: crate::exec::ShellExecutor

use std::fmt;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::dag::Task;
use crate::errors::SchedulerError;

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed(String),
    /// The executor observed the cancel signal and stopped.
    Cancelled,
}

/// Everything an executor reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcome: TaskOutcome,
    /// Opaque output; the scheduler only logs it.
    pub output: Option<String>,
}

impl ExecutionReport {
    pub fn success() -> Self {
        Self {
            outcome: TaskOutcome::Success,
            output: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Failed(error.into()),
            output: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: TaskOutcome::Cancelled,
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Success
    }

    /// The error message, if the attempt failed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Failed(msg) => Some(msg),
            _ => None,
        }
    }

    /// View a failed attempt as a [`SchedulerError::Execution`].
    pub fn as_error(&self, task: &str) -> Option<SchedulerError> {
        self.error().map(|message| SchedulerError::Execution {
            task: task.to_string(),
            message: message.to_string(),
        })
    }
}

/// Runs one attempt of a task.
///
/// Called once per dispatch attempt, possibly concurrently for distinct
/// tasks. Implementations should watch `cancel` and return
/// [`ExecutionReport::cancelled`] once it fires; execution timeouts, if
/// wanted, are the executor's business too.
pub trait TaskExecutor: Send + Sync {
    fn run(
        &self,
        task: Task,
        cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = ExecutionReport> + Send + '_>>;
}

pub type SharedExecutor = Arc<dyn TaskExecutor>;

/// Scheduler side of a cooperative cancellation request.
#[derive(Debug)]
pub struct CancelHandle {
    tx: oneshot::Sender<()>,
}

impl CancelHandle {
    /// Fire the signal. Returns `false` if the executor already dropped its
    /// side (the attempt is over).
    pub fn cancel(self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Executor side of a cooperative cancellation request.
pub struct CancelSignal {
    rx: Option<oneshot::Receiver<()>>,
    fired: bool,
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = oneshot::channel();
        (
            CancelHandle { tx },
            CancelSignal {
                rx: Some(rx),
                fired: false,
            },
        )
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        CancelSignal {
            rx: None,
            fired: false,
        }
    }

    /// Non-blocking check.
    pub fn is_cancelled(&mut self) -> bool {
        if self.fired {
            return true;
        }
        if let Some(rx) = self.rx.as_mut() {
            match rx.try_recv() {
                Ok(()) => {
                    self.fired = true;
                    self.rx = None;
                }
                Err(oneshot::error::TryRecvError::Closed) => self.rx = None,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
        self.fired
    }

    /// Resolve once cancellation is requested. Never resolves if the
    /// scheduler dropped its handle without cancelling.
    pub async fn cancelled(&mut self) {
        if self.fired {
            return;
        }

        if let Some(rx) = self.rx.as_mut() {
            let result = rx.await;
            self.rx = None;
            if result.is_ok() {
                self.fired = true;
                return;
            }
        }

        pending::<()>().await;
    }
}
