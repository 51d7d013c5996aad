// src/engine/scheduler.rs

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument, Span};

use crate::dag::{CancelOutcome, DependencyGraph, GraphSummary, Task, TaskStatus};
use crate::engine::core::SchedulerCore;
use crate::engine::runtime::{dispatch_loop, LoopState, Shared};
use crate::engine::{SchedulerOptions, TaskSpec};
use crate::errors::{Result, SchedulerError};
use crate::exec::SharedExecutor;
use crate::pool::WorkerPool;
use crate::queue::ReadyEntry;
use crate::store::SharedStore;
use crate::types::TaskId;

/// Handle to a running scheduler.
///
/// Construction spawns the dispatch loop on the current Tokio runtime.
/// Mutating calls are synchronous: they take the graph lock, apply the change
/// and return, and the dispatch loop picks up any newly ready work on its
/// own. Dropping the handle stops the loop without waiting for running tasks;
/// use [`stop`](Self::stop) for a graceful drain.
pub struct Scheduler {
    shared: Arc<Shared>,
    pool: WorkerPool,
    control: watch::Sender<LoopState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool", &self.pool)
            .field("state", &*self.control.borrow())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start a scheduler with an empty graph.
    pub fn start(
        options: SchedulerOptions,
        executor: SharedExecutor,
        store: Option<SharedStore>,
    ) -> Self {
        Self::start_with_graph(DependencyGraph::new(), options, executor, store)
    }

    /// Start a scheduler over an existing graph (for example one rebuilt
    /// with [`DependencyGraph::bulk_load`]). Tasks that are ready, or can be
    /// made ready, are queued immediately.
    pub fn start_with_graph(
        graph: DependencyGraph,
        options: SchedulerOptions,
        executor: SharedExecutor,
        store: Option<SharedStore>,
    ) -> Self {
        let SchedulerOptions {
            workers,
            retry,
            span,
        } = options;

        let shared = Arc::new(Shared::new(SchedulerCore::new(graph, retry), store));
        span.in_scope(|| shared.commit(|core, queue| ((), core.seed(queue))));

        let pool = WorkerPool::new(workers);
        let (control, control_rx) = watch::channel(LoopState::Running);

        let loop_handle = tokio::spawn(
            dispatch_loop(Arc::clone(&shared), pool.clone(), executor, control_rx)
                .instrument(span.clone()),
        );

        Self {
            shared,
            pool,
            control,
            loop_handle: Mutex::new(Some(loop_handle)),
            span,
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if *self.control.borrow() != LoopState::Running {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(())
    }

    /// Register a task that waits on `deps` (all of which must already be
    /// registered). The task is queued right away if nothing is outstanding.
    pub fn submit<I, S>(&self, task: Task, deps: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        let _entered = self.span.enter();
        self.ensure_accepting()?;

        let deps: Vec<TaskId> = deps.into_iter().map(Into::into).collect();
        let id = task.id.clone();

        self.shared.try_commit(|core, queue| {
            let step = core.submit(queue, task, &deps)?;
            self.shared.save_records(core, std::slice::from_ref(&id));
            Ok(((), step))
        })?;

        info!(task = %id, deps = ?deps, "task submitted");
        Ok(())
    }

    /// Register several tasks and their edges atomically.
    pub fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<()> {
        let _entered = self.span.enter();
        self.ensure_accepting()?;

        let ids: Vec<TaskId> = specs.iter().map(|s| s.task.id.clone()).collect();
        self.shared.try_commit(|core, queue| {
            let step = core.submit_batch(queue, specs)?;
            self.shared.save_records(core, &ids);
            Ok(((), step))
        })
    }

    /// Make `dependent` wait on `dependency`. See
    /// [`DependencyGraph::add_dependency`].
    pub fn add_dependency(&self, dependent: &str, dependency: &str) -> Result<bool> {
        let _entered = self.span.enter();

        self.shared
            .try_commit(|core, queue| core.add_dependency(queue, dependent, dependency))
    }

    /// Cancel a task; see [`DependencyGraph::cancel_task`].
    ///
    /// A running task receives the cooperative cancel signal and stays
    /// `Running` until its executor reports back.
    pub fn cancel_task(&self, task_id: &str) -> Result<CancelOutcome> {
        let _entered = self.span.enter();

        self.shared.try_commit(|core, queue| core.cancel(queue, task_id))
    }

    /// Remove a finished task; see [`DependencyGraph::purge`].
    pub fn purge(&self, task_id: &str) -> Result<Task> {
        self.shared.write_core().purge(task_id)
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.shared.read_core().graph().status_of(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.shared.read_core().graph().get(task_id).cloned()
    }

    pub fn summary(&self) -> GraphSummary {
        self.shared.read_core().summary()
    }

    /// Copy of the whole graph at this instant.
    pub fn snapshot(&self) -> DependencyGraph {
        self.shared.read_core().graph().clone()
    }

    /// Ids of the tasks that are `Running` right now, taken under one read
    /// lock.
    pub fn get_running_tasks(&self) -> Vec<TaskId> {
        self.shared.read_core().running_tasks()
    }

    /// Best entry in the ready queue, without removing it.
    pub fn peek_ready(&self) -> Option<ReadyEntry> {
        self.shared.queue.peek()
    }

    pub fn ready_len(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Resolve once no task is pending, ready or running.
    pub async fn wait_idle(&self) {
        self.wait_until(GraphSummary::is_settled).await;
    }

    async fn wait_until(&self, done: impl Fn(&GraphSummary) -> bool) {
        let mut changes = self.shared.subscribe();
        loop {
            if done(&self.summary()) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop dispatching, give running tasks up to `timeout` to finish, then
    /// cancel whatever is still running.
    ///
    /// Returns the ids that did not finish gracefully. Further submissions
    /// fail with [`SchedulerError::ShuttingDown`].
    pub async fn stop(&self, timeout: Duration) -> Vec<TaskId> {
        info!(parent: &self.span, ?timeout, "stopping scheduler; draining running tasks");
        self.control.send_replace(LoopState::Draining);

        let drained = tokio::time::timeout(timeout, self.wait_until(|s| s.running == 0))
            .await
            .is_ok();

        let leftover = if drained {
            Vec::new()
        } else {
            let ids = self.span.in_scope(|| self.shared.abort_running());
            warn!(parent: &self.span, tasks = ?ids, "drain timeout elapsed; cancelled running tasks");
            ids
        };

        self.control.send_replace(LoopState::Shutdown);
        self.pool.close();
        self.shared.abort_retry_timers();

        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(parent: &self.span, error = %err, "dispatch loop ended abnormally");
            }
        }

        info!(parent: &self.span, "scheduler stopped");
        leftover
    }
}
