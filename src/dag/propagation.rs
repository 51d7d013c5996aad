// src/dag/propagation.rs

//! Status transitions that ripple through the graph: readiness on
//! completion, failure and cancellation cascades, retries.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::dag::graph::DependencyGraph;
use crate::dag::task::{Task, TaskStatus};
use crate::errors::{Result, SchedulerError};
use crate::types::TaskId;

/// What [`DependencyGraph::cancel_task`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was `Pending` or `Ready` and is now `Cancelled`.
    Cancelled { cascaded: Vec<TaskId> },
    /// The task is `Running`; it stays `Running` until the executor
    /// acknowledges. Dependents were cancelled right away.
    Signalled { cascaded: Vec<TaskId> },
}

impl CancelOutcome {
    pub fn cascaded(&self) -> &[TaskId] {
        match self {
            CancelOutcome::Cancelled { cascaded } | CancelOutcome::Signalled { cascaded } => {
                cascaded
            }
        }
    }
}

/// What happened after an executor reported a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Task parked in `Pending`; it should become ready again after the
    /// backoff for `attempt`.
    Retry { attempt: u32 },
    /// Retries exhausted; the task and `cascaded` dependents are `Failed`.
    Exhausted { cascaded: Vec<TaskId> },
}

/// Count of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphSummary {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl GraphSummary {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.completed + self.failed + self.cancelled
    }

    /// `true` once no task can make further progress.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.ready == 0 && self.running == 0
    }
}

impl DependencyGraph {
    /// `Pending -> Ready` if every dependency has completed.
    pub fn promote_if_ready(&mut self, id: &str) -> Result<bool> {
        let degree = self.in_degree.get(id).copied().unwrap_or(0);
        let task = self.task_mut(id)?;

        if task.status != TaskStatus::Pending || degree != 0 {
            return Ok(false);
        }

        task.transition(TaskStatus::Ready)?;
        debug!(task = %id, "dependencies satisfied; marked Ready");
        Ok(true)
    }

    /// Promote every `Pending` task with no outstanding dependencies.
    pub fn promote_all_ready(&mut self) -> Vec<TaskId> {
        let candidates: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| self.in_degree.get(&t.id).copied().unwrap_or(0) == 0)
            .map(|t| t.id.clone())
            .collect();

        for id in &candidates {
            if let Some(task) = self.tasks.get_mut(id) {
                task.status = TaskStatus::Ready;
            }
        }

        candidates
    }

    /// `Ready -> Running`. Returns a copy of the record for the executor.
    pub fn start_task(&mut self, id: &str) -> Result<Task> {
        let task = self.task_mut(id)?;
        task.transition(TaskStatus::Running)?;
        Ok(task.clone())
    }

    /// `Running -> Completed`, then release dependents.
    ///
    /// Returns the dependents that became `Ready` because of this
    /// completion. Calling it twice for the same task fails, so in-degrees are
    /// never decremented twice.
    pub fn on_task_completed(&mut self, id: &str) -> Result<Vec<TaskId>> {
        let task = self.task_mut(id)?;
        task.transition(TaskStatus::Completed)?;

        let dependents: Vec<TaskId> = task.dependents.iter().cloned().collect();
        let mut newly_ready = Vec::new();

        for dep in dependents {
            let Some(degree) = self.in_degree.get_mut(&dep) else {
                warn!(task = %id, dependent = %dep, "dependent missing from in-degree map");
                continue;
            };
            *degree = degree.saturating_sub(1);

            if *degree == 0 && self.promote_if_ready(&dep)? {
                newly_ready.push(dep);
            }
        }

        info!(task = %id, ready = ?newly_ready, "task completed");
        Ok(newly_ready)
    }

    /// Mark `id` as `Failed` and cascade `Failed` to every transitive
    /// dependent that has not started yet.
    ///
    /// Returns the cascaded dependents, not including `id` itself.
    pub fn on_task_failed_permanently(&mut self, id: &str) -> Result<Vec<TaskId>> {
        self.task_mut(id)?.transition(TaskStatus::Failed)?;
        let cascaded = self.cascade(id, TaskStatus::Failed);

        warn!(task = %id, cascaded = ?cascaded, "task failed permanently");
        Ok(cascaded)
    }

    /// Record a failed attempt and decide between retry and permanent failure.
    ///
    /// `retries` is incremented first; the task is retried while
    /// `retries <= max_retries`, so `max_retries = 0` fails on the first error.
    pub fn record_failure(&mut self, id: &str) -> Result<FailureDecision> {
        let task = self.task_mut(id)?;

        if task.status != TaskStatus::Running {
            return Err(SchedulerError::invalid_state(
                id,
                task.status,
                "only running tasks can fail",
            ));
        }

        task.retries += 1;
        if task.retries <= task.max_retries {
            let attempt = task.retries;
            task.transition(TaskStatus::Pending)?;
            debug!(task = %id, attempt, max_retries = task.max_retries, "task parked for retry");
            return Ok(FailureDecision::Retry { attempt });
        }

        let cascaded = self.on_task_failed_permanently(id)?;
        Ok(FailureDecision::Exhausted { cascaded })
    }

    /// Cancel a task.
    ///
    /// `Pending`/`Ready` tasks are cancelled immediately; a `Running` task
    /// only gets `cancel_requested` set and is finalized by
    /// [`finalize_cancelled`](Self::finalize_cancelled). In both cases the
    /// not-yet-started dependents are cancelled right away.
    pub fn cancel_task(&mut self, id: &str) -> Result<CancelOutcome> {
        let task = self.task_mut(id)?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Ready => {
                task.transition(TaskStatus::Cancelled)?;
                let cascaded = self.cascade(id, TaskStatus::Cancelled);
                info!(task = %id, cascaded = ?cascaded, "task cancelled");
                Ok(CancelOutcome::Cancelled { cascaded })
            }
            TaskStatus::Running => {
                task.cancel_requested = true;
                let cascaded = self.cascade(id, TaskStatus::Cancelled);
                info!(task = %id, cascaded = ?cascaded, "cancellation requested for running task");
                Ok(CancelOutcome::Signalled { cascaded })
            }
            status => Err(SchedulerError::invalid_state(
                id,
                status,
                "task already reached a terminal state",
            )),
        }
    }

    /// `Running -> Cancelled` once the executor acknowledged (or the
    /// scheduler gave up waiting). Cascades to anything still waiting.
    pub fn finalize_cancelled(&mut self, id: &str) -> Result<Vec<TaskId>> {
        let task = self.task_mut(id)?;
        task.transition(TaskStatus::Cancelled)?;
        task.cancel_requested = true;

        let cascaded = self.cascade(id, TaskStatus::Cancelled);
        info!(task = %id, "running task cancelled");
        Ok(cascaded)
    }

    /// Remove a terminal task whose dependents are all terminal too.
    pub fn purge(&mut self, id: &str) -> Result<Task> {
        let task = self.task(id)?;

        if !task.is_terminal() {
            return Err(SchedulerError::invalid_state(
                id,
                task.status,
                "only terminal tasks can be purged",
            ));
        }

        if let Some(blocking) = task
            .dependents
            .iter()
            .find(|d| self.tasks.get(d.as_str()).is_some_and(|t| !t.is_terminal()))
        {
            return Err(SchedulerError::invalid_state(
                id,
                task.status,
                format!("dependent {blocking} has not finished"),
            ));
        }

        let task = self.task(id)?.clone();
        for dep in &task.dependencies {
            if let Some(parent) = self.tasks.get_mut(dep) {
                parent.dependents.remove(id);
            }
        }
        for child in &task.dependents {
            if let Some(dependent) = self.tasks.get_mut(child) {
                dependent.dependencies.remove(id);
            }
        }

        self.tasks.remove(id);
        self.in_degree.remove(id);
        debug!(task = %id, "task purged");
        Ok(task)
    }

    /// Status counts across the whole graph.
    pub fn summary(&self) -> GraphSummary {
        let mut summary = GraphSummary::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Ready => summary.ready += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Rebuild a graph from stored task records.
    ///
    /// Edges are taken from each task's `dependencies`; `dependents` and
    /// in-degrees are recomputed. `Running` records are parked back in
    /// `Pending` because no worker owns them any more, and waiting records
    /// below a `Failed` or `Cancelled` task take that status. Cyclic input
    /// is rejected with the cycle that was found.
    pub fn bulk_load(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut graph = DependencyGraph::new();

        for mut task in tasks {
            if graph.tasks.contains_key(&task.id) {
                return Err(SchedulerError::DuplicateTask(task.id));
            }
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
            }
            task.dependents.clear();
            graph.tasks.insert(task.id.clone(), task);
        }

        let edges: Vec<(TaskId, TaskId)> = graph
            .tasks
            .values()
            .flat_map(|t| t.dependencies.iter().map(|d| (d.clone(), t.id.clone())))
            .collect();

        for (dependency, dependent) in &edges {
            let Some(parent) = graph.tasks.get_mut(dependency) else {
                return Err(SchedulerError::UnknownTask(dependency.clone()));
            };
            parent.dependents.insert(dependent.clone());
        }

        if let Some(path) = graph.verify_acyclic() {
            return Err(SchedulerError::Cycle { path });
        }

        let degrees: Vec<(TaskId, usize)> = graph
            .tasks
            .values()
            .map(|t| {
                let open = t
                    .dependencies
                    .iter()
                    .filter(|d| graph.status_of(d) != Some(TaskStatus::Completed))
                    .count();
                (t.id.clone(), open)
            })
            .collect();
        graph.in_degree = degrees.into_iter().collect();

        // A stored Ready record whose dependencies are not all complete is
        // inconsistent; keep it waiting.
        for (id, degree) in graph.in_degree.iter() {
            if *degree > 0 {
                if let Some(task) = graph.tasks.get_mut(id) {
                    if task.status == TaskStatus::Ready {
                        task.status = TaskStatus::Pending;
                    }
                }
            }
        }

        // Records below a failed or cancelled task can never become ready;
        // finish the cascade that was cut short.
        let finished: Vec<(TaskId, TaskStatus)> = graph
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .map(|t| (t.id.clone(), t.status))
            .collect();
        for (id, status) in finished {
            let cascaded = graph.cascade(&id, status);
            if !cascaded.is_empty() {
                debug!(task = %id, %status, cascaded = ?cascaded, "repaired cascade on load");
            }
        }

        info!(tasks = graph.len(), "graph loaded from stored records");
        Ok(graph)
    }

    /// Walk dependents of `root`, moving every `Pending`/`Ready` task to
    /// `status`. Tasks that are already terminal stop the walk.
    fn cascade(&mut self, root: &str, status: TaskStatus) -> Vec<TaskId> {
        let mut stack: Vec<TaskId> = self
            .tasks
            .get(root)
            .map(|t| t.dependents.iter().cloned().collect())
            .unwrap_or_default();
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut affected = Vec::new();

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }

            let Some(task) = self.tasks.get_mut(&name) else {
                warn!(task = %name, "dependent missing from task map");
                continue;
            };

            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }

            task.status = status;
            debug!(task = %name, upstream = %root, %status, "cascaded from upstream task");
            affected.push(name);
            stack.extend(task.dependents.iter().cloned());
        }

        affected
    }
}
