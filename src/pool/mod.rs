// src/pool/mod.rs

//! Bounded worker pool.
//!
//! The pool only limits *how many* tasks run at once; *which* task runs next
//! is decided by the ready queue. A [`WorkerSlot`] is one unit of capacity:
//! it is acquired before a task is handed to the executor and released when
//! the slot is dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use crate::dag::Task;
use crate::exec::{CancelSignal, ExecutionReport, SharedExecutor};
use crate::types::TaskId;

/// One held unit of pool capacity.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

/// Result of one attempt, sent back to the dispatch loop.
///
/// The slot travels with the report so capacity is only released after the
/// dispatch loop has moved the task out of `Running`.
#[derive(Debug)]
pub struct WorkerReport {
    pub task_id: TaskId,
    pub report: ExecutionReport,
    pub slot: WorkerSlot,
}

/// Aborts the executor attempt if the worker itself is aborted.
struct AbortOnDrop(JoinHandle<ExecutionReport>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    capacity: usize,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    /// `capacity` is clamped to at least one worker.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a free slot. Fails only after [`close`](Self::close).
    pub async fn acquire(&self) -> Result<WorkerSlot, AcquireError> {
        let permit = Arc::clone(&self.slots).acquire_owned().await?;
        Ok(WorkerSlot { _permit: permit })
    }

    /// Take a slot without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<WorkerSlot> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerSlot { _permit: permit })
    }

    /// Refuse all further acquisitions; waiters are woken with an error.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Run one attempt of `task` on the executor in its own Tokio task.
    ///
    /// The executor future runs in a nested task so a panic inside it is
    /// turned into a failed report instead of a slot that never comes back.
    pub fn spawn(
        &self,
        slot: WorkerSlot,
        executor: SharedExecutor,
        task: Task,
        cancel: CancelSignal,
        results: mpsc::UnboundedSender<WorkerReport>,
    ) -> JoinHandle<()> {
        let task_id = task.id.clone();
        let span = tracing::debug_span!("worker", task = %task_id);

        tokio::spawn(
            async move {
                debug!("worker started");

                let mut attempt =
                    AbortOnDrop(tokio::spawn(async move { executor.run(task, cancel).await }));
                let report = match (&mut attempt.0).await {
                    Ok(report) => report,
                    Err(join_err) => {
                        error!(error = %join_err, "executor panicked or was aborted");
                        ExecutionReport::failed(format!("executor aborted: {join_err}"))
                    }
                };

                let message = WorkerReport {
                    task_id,
                    report,
                    slot,
                };
                if results.send(message).is_err() {
                    debug!("dispatch loop gone; dropping report");
                }
            }
            .instrument(span),
        )
    }
}
