// src/store/mod.rs

//! Persistence hooks.
//!
//! The scheduler calls a [`PersistenceStore`] when a task is created and on
//! every status transition. Durability is best effort: store errors are
//! logged by the caller and never turn into scheduling errors.
//!
//! - [`memory`] keeps records in a map (tests, embedding).
//! - [`file`] keeps a JSON snapshot on disk.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;

use crate::dag::{Task, TaskStatus};

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::InMemoryStore;

/// Narrow persistence capability consumed by the scheduler.
pub trait PersistenceStore: Send + Sync + Debug {
    fn save_task(&self, task: &Task) -> Result<()>;
    fn save_status(&self, task_id: &str, status: TaskStatus) -> Result<()>;
    fn load_tasks(&self) -> Result<Vec<Task>>;
}

pub type SharedStore = Arc<dyn PersistenceStore>;
