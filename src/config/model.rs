// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::Task;
use crate::engine::{SchedulerOptions, TaskSpec};
use crate::types::RetryPolicy;

/// Manifest as read from a TOML file, before validation.
///
/// ```toml
/// [scheduler]
/// workers = 2
/// default_max_retries = 1
///
/// [task.fetch]
/// cmd = "curl -fsS https://example.com > page.html"
/// priority = 10
///
/// [task.parse]
/// cmd = "wc -c page.html"
/// after = ["fetch"]
/// ```
///
/// Every section is optional and has defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawManifest {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// All tasks from `[task.<id>]`, keyed by id.
    #[serde(default)]
    pub task: BTreeMap<String, TaskEntry>,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    /// Maximum number of tasks running at once.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retry budget for tasks that do not set `max_retries`.
    #[serde(default)]
    pub default_max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long `stop` waits for running tasks before cancelling them.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Optional JSON file that receives every task record and status change.
    #[serde(default)]
    pub store: Option<PathBuf>,
}

fn default_workers() -> usize {
    4
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_max_retries: 0,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            store: None,
        }
    }
}

impl SchedulerSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// `[task.<id>]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tenant_id: Option<String>,

    /// Higher runs first.
    #[serde(default)]
    pub priority: i64,

    /// Falls back to `[scheduler].default_max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Ids this task waits on.
    #[serde(default)]
    pub after: Vec<String>,

    /// Shell command run by the executor.
    pub cmd: String,
}

/// A manifest that passed [`validate_manifest`](crate::config::validate_manifest).
///
/// Only obtainable through `TryFrom<RawManifest>`.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub scheduler: SchedulerSection,
    pub task: BTreeMap<String, TaskEntry>,
}

impl Manifest {
    pub(crate) fn new_unchecked(
        scheduler: SchedulerSection,
        task: BTreeMap<String, TaskEntry>,
    ) -> Self {
        Self { scheduler, task }
    }

    /// One spec per task, ready for
    /// [`Scheduler::submit_batch`](crate::engine::Scheduler::submit_batch).
    pub fn task_specs(&self) -> Vec<TaskSpec> {
        self.task
            .iter()
            .map(|(id, entry)| {
                let mut task = Task::new(id.clone(), entry.priority)
                    .with_max_retries(
                        entry
                            .max_retries
                            .unwrap_or(self.scheduler.default_max_retries),
                    )
                    .with_payload(entry.cmd.clone());
                if let Some(name) = &entry.name {
                    task = task.with_name(name.clone());
                }
                if let Some(tenant) = &entry.tenant_id {
                    task = task.with_tenant(tenant.clone());
                }

                TaskSpec {
                    task,
                    after: entry.after.clone(),
                }
            })
            .collect()
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions::new(self.scheduler.workers).with_retry(self.scheduler.retry_policy())
    }
}
