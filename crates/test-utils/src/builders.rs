#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use dagsched::config::{Manifest, RawManifest, SchedulerSection, TaskEntry};
use dagsched::dag::{DependencyGraph, Task};
use dagsched::engine::TaskSpec;

/// Fixed instant so tie-breaking on `scheduled_time` is reproducible.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid fixed timestamp")
}

/// Task with priority `priority`, scheduled `offset_secs` after [`epoch`].
pub fn task_at(id: &str, priority: i64, offset_secs: i64) -> Task {
    Task::new(id, priority).with_scheduled_time(epoch() + Duration::seconds(offset_secs))
}

/// Task with priority 0 scheduled at [`epoch`].
pub fn task(id: &str) -> Task {
    task_at(id, 0, 0)
}

/// Graph holding `ids` (priority 0) and `edges` as `(dependent, dependency)`.
pub fn graph_with(ids: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for id in ids {
        graph.add_task(task(id)).expect("add task");
    }
    for (dependent, dependency) in edges {
        graph
            .add_dependency(dependent, dependency)
            .expect("add dependency");
    }
    graph
}

/// `TaskSpec` for batch submission.
pub fn spec(task: Task, after: &[&str]) -> TaskSpec {
    TaskSpec {
        task,
        after: after.iter().map(|s| s.to_string()).collect(),
    }
}

/// Builder for `Manifest` to simplify test setup.
pub struct ManifestBuilder {
    manifest: RawManifest,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            manifest: RawManifest {
                scheduler: SchedulerSection::default(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.manifest.scheduler.workers = workers;
        self
    }

    pub fn default_max_retries(mut self, retries: u32) -> Self {
        self.manifest.scheduler.default_max_retries = retries;
        self
    }

    pub fn with_task(mut self, id: &str, task: TaskEntry) -> Self {
        self.manifest.task.insert(id.to_string(), task);
        self
    }

    pub fn raw(self) -> RawManifest {
        self.manifest
    }

    pub fn build(self) -> Manifest {
        Manifest::try_from(self.manifest).expect("Failed to build valid manifest from builder")
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskEntry`.
pub struct TaskEntryBuilder {
    task: TaskEntry,
}

impl TaskEntryBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskEntry {
                cmd: cmd.to_string(),
                ..TaskEntry::default()
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.task.max_retries = Some(retries);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.task.name = Some(name.to_string());
        self
    }

    pub fn tenant(mut self, tenant: &str) -> Self {
        self.task.tenant_id = Some(tenant.to_string());
        self
    }

    pub fn build(self) -> TaskEntry {
        self.task
    }
}
