// src/engine/core.rs

//! Pure scheduling state machine.
//!
//! [`SchedulerCore`] owns the [`DependencyGraph`] and turns every input
//! (submission, dispatch, executor report, cancel request, retry timer) into:
//! - updated graph state and ready-queue contents
//! - a [`CoreStep`] listing the status changes to persist and the commands
//!   the async shell should carry out
//!
//! It holds no channels, timers or Tokio handles, so it can be driven step by
//! step in tests. Callers serialize access to it behind one lock.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dag::{CancelOutcome, DependencyGraph, FailureDecision, GraphSummary, Task, TaskStatus};
use crate::engine::TaskSpec;
use crate::errors::{Result, SchedulerError};
use crate::exec::TaskOutcome;
use crate::queue::{ReadyEntry, ReadyQueue};
use crate::types::{RetryPolicy, TaskId};

/// Side effect requested by the core, carried out by the async shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Make `task` ready again once `delay` has passed.
    ScheduleRetry {
        task: TaskId,
        attempt: u32,
        delay: Duration,
    },
    /// Ask the running attempt of this task to stop.
    SignalCancel(TaskId),
}

/// Outcome of a single core step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStep {
    /// Every task whose status changed, with its new status, in order.
    pub changed: Vec<(TaskId, TaskStatus)>,
    pub commands: Vec<CoreCommand>,
}

impl CoreStep {
    fn record(&mut self, graph: &DependencyGraph, ids: &[TaskId]) {
        for id in ids {
            if let Some(status) = graph.status_of(id) {
                self.changed.push((id.clone(), status));
            }
        }
    }

    /// Ids that moved to `status` in this step.
    pub fn ids_with(&self, status: TaskStatus) -> Vec<TaskId> {
        self.changed
            .iter()
            .filter(|(_, s)| *s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug)]
pub struct SchedulerCore {
    graph: DependencyGraph,
    retry: RetryPolicy,
}

impl SchedulerCore {
    pub fn new(graph: DependencyGraph, retry: RetryPolicy) -> Self {
        Self { graph, retry }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn summary(&self) -> GraphSummary {
        self.graph.summary()
    }

    /// Ids currently `Running`, ordered.
    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Queue everything that is ready in a freshly loaded graph.
    pub fn seed(&mut self, queue: &ReadyQueue) -> CoreStep {
        let promoted = self.graph.promote_all_ready();

        let mut step = CoreStep::default();
        step.record(&self.graph, &promoted);

        for task in self.graph.tasks().filter(|t| t.status == TaskStatus::Ready) {
            queue.push(ReadyEntry::from(task));
        }
        step
    }

    /// Register `task` waiting on `deps`, and queue it if nothing is
    /// outstanding.
    ///
    /// Everything is checked before the graph is touched, so a rejected
    /// submission leaves no trace.
    pub fn submit(&mut self, queue: &ReadyQueue, task: Task, deps: &[TaskId]) -> Result<CoreStep> {
        if self.graph.contains(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }

        for dep in deps {
            if *dep == task.id {
                return Err(SchedulerError::Cycle {
                    path: vec![task.id.clone(), task.id.clone()],
                });
            }
            let Some(status) = self.graph.status_of(dep) else {
                return Err(SchedulerError::UnknownTask(dep.clone()));
            };
            if matches!(status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(SchedulerError::invalid_state(
                    dep.clone(),
                    status,
                    "cannot depend on a task that will never complete",
                ));
            }
        }

        let id = task.id.clone();
        self.graph.add_task(task)?;
        for dep in deps {
            self.graph.add_dependency(&id, dep)?;
        }

        let mut step = CoreStep::default();
        step.record(&self.graph, std::slice::from_ref(&id));
        self.promote_and_queue(queue, &id, &mut step)?;
        Ok(step)
    }

    /// Register several tasks and their edges as one unit.
    ///
    /// Dependencies may point at tasks earlier or later in the same batch.
    /// The batch is applied to a copy of the graph that replaces the live one
    /// only if every task and edge was accepted.
    pub fn submit_batch(&mut self, queue: &ReadyQueue, specs: Vec<TaskSpec>) -> Result<CoreStep> {
        let mut staged = self.graph.clone();
        let mut new_ids = Vec::with_capacity(specs.len());
        let mut edges = Vec::new();

        for spec in specs {
            let id = spec.task.id.clone();
            staged.add_task(spec.task)?;
            edges.extend(spec.after.into_iter().map(|dep| (id.clone(), dep)));
            new_ids.push(id);
        }

        for (dependent, dependency) in &edges {
            staged.add_dependency(dependent, dependency)?;
        }

        self.graph = staged;
        info!(tasks = new_ids.len(), edges = edges.len(), "batch submitted");

        let mut step = CoreStep::default();
        step.record(&self.graph, &new_ids);
        for id in &new_ids {
            self.promote_and_queue(queue, id, &mut step)?;
        }
        Ok(step)
    }

    /// Add an edge between two registered tasks.
    pub fn add_dependency(
        &mut self,
        queue: &ReadyQueue,
        dependent: &str,
        dependency: &str,
    ) -> Result<(bool, CoreStep)> {
        let was_ready = self.graph.status_of(dependent) == Some(TaskStatus::Ready);
        let added = self.graph.add_dependency(dependent, dependency)?;

        let mut step = CoreStep::default();
        if was_ready && self.graph.status_of(dependent) == Some(TaskStatus::Pending) {
            let id = dependent.to_string();
            queue.remove(std::iter::once(&id));
            debug!(task = %dependent, "new dependency; task back to Pending");
            step.record(&self.graph, &[id]);
        }
        Ok((added, step))
    }

    /// Pop the best ready entry and mark it `Running`.
    ///
    /// Entries whose task is no longer `Ready` are skipped; they can only be
    /// left behind by a cancel that raced with the pop.
    pub fn dispatch_next(&mut self, queue: &ReadyQueue) -> Option<Task> {
        while let Some(entry) = queue.pop() {
            match self.graph.status_of(&entry.task_id) {
                Some(TaskStatus::Ready) => match self.graph.start_task(&entry.task_id) {
                    Ok(task) => {
                        info!(
                            task = %task.id,
                            priority = task.priority,
                            attempt = task.retries + 1,
                            "dispatching task"
                        );
                        return Some(task);
                    }
                    Err(err) => warn!(task = %entry.task_id, error = %err, "failed to start task"),
                },
                other => {
                    debug!(task = %entry.task_id, status = ?other, "skipping stale ready entry");
                }
            }
        }
        None
    }

    /// React to one executor report for a `Running` task.
    pub fn apply_report(
        &mut self,
        queue: &ReadyQueue,
        task_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<CoreStep> {
        let task = self.graph.task(task_id)?;
        if task.status != TaskStatus::Running {
            return Err(SchedulerError::invalid_state(
                task_id,
                task.status,
                "report for a task that is not running",
            ));
        }

        let id = task_id.to_string();
        let mut step = CoreStep::default();

        if task.cancel_requested {
            debug!(task = %task_id, outcome = ?outcome, "cancel was requested; finalizing as Cancelled");
            let cascaded = self.graph.finalize_cancelled(task_id)?;
            queue.remove(cascaded.iter());
            step.record(&self.graph, std::slice::from_ref(&id));
            step.record(&self.graph, &cascaded);
            return Ok(step);
        }

        match outcome {
            TaskOutcome::Success => {
                let newly_ready = self.graph.on_task_completed(task_id)?;
                step.record(&self.graph, std::slice::from_ref(&id));
                step.record(&self.graph, &newly_ready);
                for ready in &newly_ready {
                    self.queue_task(queue, ready);
                }
            }
            TaskOutcome::Failed(message) => match self.graph.record_failure(task_id)? {
                FailureDecision::Retry { attempt } => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(task = %task_id, attempt, ?delay, error = %message, "task failed; retrying after backoff");
                    step.record(&self.graph, std::slice::from_ref(&id));
                    step.commands.push(CoreCommand::ScheduleRetry {
                        task: id,
                        attempt,
                        delay,
                    });
                }
                FailureDecision::Exhausted { cascaded } => {
                    warn!(task = %task_id, error = %message, "retries exhausted");
                    queue.remove(cascaded.iter());
                    step.record(&self.graph, std::slice::from_ref(&id));
                    step.record(&self.graph, &cascaded);
                }
            },
            TaskOutcome::Cancelled => {
                let cascaded = self.graph.finalize_cancelled(task_id)?;
                queue.remove(cascaded.iter());
                step.record(&self.graph, std::slice::from_ref(&id));
                step.record(&self.graph, &cascaded);
            }
        }

        Ok(step)
    }

    /// Backoff elapsed: make a parked task ready again.
    ///
    /// Does nothing if the task was cancelled (or otherwise moved on) while
    /// it was waiting.
    pub fn release_retry(&mut self, queue: &ReadyQueue, task_id: &str) -> Result<CoreStep> {
        let mut step = CoreStep::default();
        self.promote_and_queue(queue, task_id, &mut step)?;
        Ok(step)
    }

    /// Cancel a task and everything downstream that has not started.
    pub fn cancel(&mut self, queue: &ReadyQueue, task_id: &str) -> Result<(CancelOutcome, CoreStep)> {
        let outcome = self.graph.cancel_task(task_id)?;
        let id = task_id.to_string();

        queue.remove(std::iter::once(&id).chain(outcome.cascaded().iter()));

        let mut step = CoreStep::default();
        if let CancelOutcome::Cancelled { .. } = outcome {
            step.record(&self.graph, std::slice::from_ref(&id));
        } else {
            step.commands.push(CoreCommand::SignalCancel(id));
        }
        step.record(&self.graph, outcome.cascaded());

        Ok((outcome, step))
    }

    /// Give up on every running task: mark them `Cancelled` without waiting
    /// for the executor. Returns the ids that were still running.
    pub fn force_cancel_running(&mut self, queue: &ReadyQueue) -> (Vec<TaskId>, CoreStep) {
        let running = self.running_tasks();
        let mut step = CoreStep::default();

        for id in &running {
            match self.graph.finalize_cancelled(id) {
                Ok(cascaded) => {
                    queue.remove(cascaded.iter());
                    step.record(&self.graph, std::slice::from_ref(id));
                    step.record(&self.graph, &cascaded);
                    step.commands.push(CoreCommand::SignalCancel(id.clone()));
                }
                Err(err) => warn!(task = %id, error = %err, "failed to force-cancel task"),
            }
        }

        (running, step)
    }

    /// Remove a finished task from the graph.
    pub fn purge(&mut self, task_id: &str) -> Result<Task> {
        self.graph.purge(task_id)
    }

    fn promote_and_queue(&mut self, queue: &ReadyQueue, id: &str, step: &mut CoreStep) -> Result<()> {
        if self.graph.promote_if_ready(id)? {
            self.queue_task(queue, id);
            step.record(&self.graph, &[id.to_string()]);
        }
        Ok(())
    }

    fn queue_task(&self, queue: &ReadyQueue, id: &str) {
        if let Some(task) = self.graph.get(id) {
            queue.push(ReadyEntry::from(task));
        }
    }
}
