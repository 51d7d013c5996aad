// src/queue/mod.rs

//! Priority-ordered queue of tasks whose dependencies are satisfied.
//!
//! Ordering key, best first:
//! 1. higher `priority`
//! 2. earlier `scheduled_time`
//! 3. lexicographically smaller task id
//!
//! The id makes the order total, so two runs over the same input always
//! dispatch in the same order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

use crate::dag::Task;
use crate::errors::{Result, SchedulerError};
use crate::types::TaskId;

/// One queued reference to a ready task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEntry {
    pub task_id: TaskId,
    pub priority: i64,
    pub scheduled_time: DateTime<Utc>,
}

impl ReadyEntry {
    pub fn new(task_id: impl Into<TaskId>, priority: i64, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            priority,
            scheduled_time,
        }
    }
}

impl From<&Task> for ReadyEntry {
    fn from(task: &Task) -> Self {
        ReadyEntry::new(task.id.clone(), task.priority, task.scheduled_time)
    }
}

impl Ord for ReadyEntry {
    /// "Greater" means "runs earlier", so a max-heap pops the right entry.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_time.cmp(&self.scheduled_time))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Thread-safe ready queue guarded by a single mutex.
///
/// Every `push` wakes one waiter blocked in [`ReadyQueue::wait_for_entry`].
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<ReadyEntry>>,
    available: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<ReadyEntry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, entry: ReadyEntry) {
        debug!(task = %entry.task_id, priority = entry.priority, "pushed to ready queue");
        self.lock().push(entry);
        self.available.notify_one();
    }

    /// Remove and return the best entry, or `None` when nothing is ready.
    pub fn pop(&self) -> Option<ReadyEntry> {
        self.lock().pop()
    }

    /// Like [`pop`](Self::pop), but reports an empty queue as an error.
    pub fn try_pop(&self) -> Result<ReadyEntry> {
        self.pop().ok_or(SchedulerError::EmptyQueue)
    }

    pub fn peek(&self) -> Option<ReadyEntry> {
        self.lock().peek().cloned()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().iter().any(|e| e.task_id == task_id)
    }

    /// Drop the given ids from the queue (cancelled or failed before
    /// dispatch). Returns how many entries were removed.
    pub fn remove<'a>(&self, ids: impl IntoIterator<Item = &'a TaskId>) -> usize {
        let ids: HashSet<&str> = ids.into_iter().map(|s| s.as_str()).collect();
        if ids.is_empty() {
            return 0;
        }

        let mut heap = self.lock();
        let before = heap.len();
        heap.retain(|e| !ids.contains(e.task_id.as_str()));
        let removed = before - heap.len();

        if removed > 0 {
            debug!(removed, "removed entries from ready queue");
        }
        removed
    }

    /// Wait until an entry may be available.
    ///
    /// A wakeup is not a guarantee; callers re-check with [`pop`](Self::pop).
    pub async fn wait_for_entry(&self) {
        if !self.is_empty() {
            return;
        }
        self.available.notified().await;
    }
}
