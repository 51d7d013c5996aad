// src/store/memory.rs

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, anyhow};

use crate::dag::{Task, TaskStatus};
use crate::store::PersistenceStore;

/// Store that keeps the latest record of every task in memory.
///
/// It also keeps the ordered list of status writes, which tests use to
/// check that every transition was reported.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: Mutex<BTreeMap<String, Task>>,
    history: Mutex<Vec<(String, TaskStatus)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `save_status` call so far, in order.
    pub fn status_history(&self) -> Vec<(String, TaskStatus)> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map(|t| t.status)
    }
}

impl PersistenceStore for InMemoryStore {
    fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn save_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((task_id.to_string(), status));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("status update for unsaved task '{task_id}'"))?;
        task.status = status;
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}
