// src/engine/runtime.rs

//! Async shell around [`SchedulerCore`].
//!
//! The dispatch loop is the only consumer of worker reports. Each iteration
//! it either:
//! - applies a [`WorkerReport`] to the core (completion, retry, cascade), or
//! - takes a free worker slot plus the best ready task and starts a worker,
//! - or reacts to a change of the control state (drain, shutdown).
//!
//! Workers never touch the graph or the queue; they only send reports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dag::TaskStatus;
use crate::engine::core::{CoreCommand, CoreStep, SchedulerCore};
use crate::errors::Result;
use crate::exec::{CancelHandle, CancelSignal, SharedExecutor};
use crate::pool::{WorkerPool, WorkerReport, WorkerSlot};
use crate::queue::ReadyQueue;
use crate::store::SharedStore;
use crate::types::TaskId;

/// What the dispatch loop is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    /// Dispatch ready tasks and process reports.
    Running,
    /// Only process reports of tasks already running.
    Draining,
    /// Exit the loop.
    Shutdown,
}

/// Internal handle for a task attempt that is currently running.
///
/// `cancel` is taken when cancellation is signalled, so the signal is sent at
/// most once per attempt.
struct ActiveTask {
    cancel: Option<CancelHandle>,
    handle: JoinHandle<()>,
}

/// State shared between the public handle, the dispatch loop and retry
/// timers.
///
/// Lock order: `core`, then `queue`, then `active`. The queue has its own
/// lock so `ReadyQueue` stays usable on its own, but every queue mutation
/// that must agree with the graph happens while `core` is held.
pub(crate) struct Shared {
    core: RwLock<SchedulerCore>,
    pub(crate) queue: ReadyQueue,
    active: Mutex<HashMap<TaskId, ActiveTask>>,
    retry_timers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    store: Option<SharedStore>,
    changes: watch::Sender<()>,
}

impl Shared {
    pub(crate) fn new(core: SchedulerCore, store: Option<SharedStore>) -> Self {
        let (changes, _) = watch::channel(());
        Self {
            core: RwLock::new(core),
            queue: ReadyQueue::new(),
            active: Mutex::new(HashMap::new()),
            retry_timers: Mutex::new(HashMap::new()),
            store,
            changes,
        }
    }

    pub(crate) fn read_core(&self) -> RwLockReadGuard<'_, SchedulerCore> {
        self.core.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_core(&self) -> RwLockWriteGuard<'_, SchedulerCore> {
        self.core.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveTask>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retry_timers(&self) -> MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.retry_timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<()> {
        self.changes.subscribe()
    }

    /// Run `f` against the core under the write lock.
    ///
    /// Status changes are written to the store before the lock is released,
    /// so the store sees them in the same order as the graph does. Commands
    /// run and watchers are woken afterwards.
    pub(crate) fn commit<T>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut SchedulerCore, &ReadyQueue) -> (T, CoreStep),
    ) -> T {
        let (value, step) = {
            let mut core = self.write_core();
            let (value, step) = f(&mut core, &self.queue);
            self.persist_statuses(&step);
            (value, step)
        };
        self.run_commands(step);
        value
    }

    /// Fallible [`commit`](Self::commit). On error nothing was changed.
    pub(crate) fn try_commit<T>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut SchedulerCore, &ReadyQueue) -> Result<(T, CoreStep)>,
    ) -> Result<T> {
        let (value, step) = {
            let mut core = self.write_core();
            let (value, step) = f(&mut core, &self.queue)?;
            self.persist_statuses(&step);
            (value, step)
        };
        self.run_commands(step);
        Ok(value)
    }

    /// Best-effort write of freshly registered task records.
    pub(crate) fn save_records(&self, core: &SchedulerCore, ids: &[TaskId]) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        for task in ids.iter().filter_map(|id| core.graph().get(id)) {
            if let Err(err) = store.save_task(task) {
                warn!(task = %task.id, error = %err, "store failed to save task");
            }
        }
    }

    fn persist_statuses(&self, step: &CoreStep) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        for (id, status) in &step.changed {
            if let Err(err) = store.save_status(id, *status) {
                warn!(task = %id, %status, error = %err, "store failed to save status");
            }
        }
    }

    fn run_commands(self: &Arc<Self>, step: CoreStep) {
        for command in step.commands {
            match command {
                CoreCommand::ScheduleRetry {
                    task,
                    attempt,
                    delay,
                } => self.schedule_retry(task, attempt, delay),
                CoreCommand::SignalCancel(task) => self.signal_cancel(&task),
            }
        }

        self.changes.send_replace(());
    }

    fn schedule_retry(self: &Arc<Self>, task: TaskId, attempt: u32, delay: Duration) {
        debug!(task = %task, attempt, ?delay, "retry timer armed");

        let shared = Arc::clone(self);
        let timer_task = task.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.retry_timers().remove(&timer_task);

            let released =
                shared.try_commit(|core, queue| Ok(((), core.release_retry(queue, &timer_task)?)));
            if let Err(err) = released {
                warn!(task = %timer_task, error = %err, "retry release failed");
            }
        });

        self.retry_timers().insert(task, handle);
    }

    fn signal_cancel(&self, task: &str) {
        let cancel = self.active().get_mut(task).and_then(|a| a.cancel.take());
        match cancel {
            Some(cancel) => {
                if !cancel.cancel() {
                    debug!(task = %task, "attempt already finished while cancelling");
                }
            }
            None => debug!(task = %task, "no cancel handle present; already signalled"),
        }
    }

    /// Take the best ready task and start it on `slot`.
    ///
    /// Returns the slot if nothing is ready. Popping, the `Running`
    /// transition, registration in `active` and persistence happen under one
    /// core lock.
    fn dispatch(
        self: &Arc<Self>,
        slot: WorkerSlot,
        pool: &WorkerPool,
        executor: &SharedExecutor,
        results: &mpsc::UnboundedSender<WorkerReport>,
    ) -> std::result::Result<TaskId, WorkerSlot> {
        let mut core = self.write_core();
        let Some(task) = core.dispatch_next(&self.queue) else {
            return Err(slot);
        };

        let id = task.id.clone();
        let (cancel, signal) = CancelSignal::pair();
        let handle = pool.spawn(slot, Arc::clone(executor), task, signal, results.clone());
        self.active().insert(
            id.clone(),
            ActiveTask {
                cancel: Some(cancel),
                handle,
            },
        );

        let step = CoreStep {
            changed: vec![(id.clone(), TaskStatus::Running)],
            commands: Vec::new(),
        };
        self.persist_statuses(&step);
        drop(core);

        self.run_commands(step);
        Ok(id)
    }

    fn handle_report(self: &Arc<Self>, message: WorkerReport) {
        let WorkerReport {
            task_id,
            report,
            slot,
        } = message;

        if let Some(output) = report.output.as_deref().filter(|o| !o.is_empty()) {
            debug!(task = %task_id, output = %output, "executor output");
        }
        if let Some(err) = report.as_error(&task_id) {
            debug!(error = %err, "attempt failed");
        }

        let applied = self.try_commit(|core, queue| {
            Ok(((), core.apply_report(queue, &task_id, &report.outcome)?))
        });
        self.active().remove(&task_id);

        // Capacity returns only after the task has left `Running`.
        drop(slot);

        if let Err(err) = applied {
            // Force-cancelled during stop; the report is stale.
            debug!(task = %task_id, error = %err, "ignoring report");
        }
    }

    /// Stop every running attempt. Used when the drain timeout expires.
    pub(crate) fn abort_running(self: &Arc<Self>) -> Vec<TaskId> {
        let running = self.commit(|core, queue| core.force_cancel_running(queue));

        let mut active = self.active();
        for id in &running {
            if let Some(entry) = active.remove(id) {
                entry.handle.abort();
            }
        }
        running
    }

    pub(crate) fn abort_retry_timers(&self) {
        for (task, handle) in self.retry_timers().drain() {
            debug!(task = %task, "dropping retry timer");
            handle.abort();
        }
    }
}

/// Main dispatch loop; runs until the control state becomes `Shutdown` or
/// the control sender is dropped.
pub(crate) async fn dispatch_loop(
    shared: Arc<Shared>,
    pool: WorkerPool,
    executor: SharedExecutor,
    mut control: watch::Receiver<LoopState>,
) {
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<WorkerReport>();
    info!(workers = pool.capacity(), "dispatch loop started");

    loop {
        let state = *control.borrow_and_update();
        if state == LoopState::Shutdown {
            break;
        }
        let dispatching = state == LoopState::Running;

        tokio::select! {
            biased;

            changed = control.changed() => {
                if changed.is_err() {
                    info!("scheduler handle dropped; exiting dispatch loop");
                    break;
                }
            }

            Some(message) = results_rx.recv() => {
                shared.handle_report(message);
            }

            started = next_dispatch(&shared, &pool, &executor, &results_tx), if dispatching => {
                if let Some(id) = started {
                    debug!(task = %id, in_use = pool.in_use(), "worker started");
                }
            }
        }
    }

    info!("dispatch loop exiting");
}

/// Wait for a free slot and a ready task, then start it.
///
/// The only await points are the slot acquisition and the ready-queue wait;
/// the pop-and-start itself is synchronous, so dropping this future never
/// loses a task.
async fn next_dispatch(
    shared: &Arc<Shared>,
    pool: &WorkerPool,
    executor: &SharedExecutor,
    results: &mpsc::UnboundedSender<WorkerReport>,
) -> Option<TaskId> {
    let mut slot = pool.acquire().await.ok()?;

    loop {
        match shared.dispatch(slot, pool, executor, results) {
            Ok(id) => return Some(id),
            Err(returned) => slot = returned,
        }
        shared.queue.wait_for_entry().await;
    }
}
