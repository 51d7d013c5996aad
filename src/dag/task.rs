// src/dag/task.rs

//! Task records and their lifecycle status.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SchedulerError};
use crate::types::TaskId;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registered; waiting on dependencies (or on a retry backoff).
    Pending,
    /// All dependencies completed; sitting in the ready queue.
    Ready,
    /// Handed to a worker; the executor owns it until it reports back.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The single place that decides which status changes are legal.
    ///
    /// - `Ready -> Pending` happens when a new unfinished dependency is added
    ///   to a task that was already ready.
    /// - `Running -> Pending` parks a task during its retry backoff.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Pending, Ready) | (Pending, Failed) | (Pending, Cancelled) => true,
            (Ready, Running) | (Ready, Pending) | (Ready, Failed) | (Ready, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) | (Running, Pending) => {
                true
            }
            // Terminal states never move again.
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// One unit of schedulable work.
///
/// Tasks reference each other by id only; the [`DependencyGraph`] owns every
/// record and is the only thing allowed to change `status`, `dependencies`
/// and `dependents`.
///
/// [`DependencyGraph`]: crate::dag::DependencyGraph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub tenant_id: String,
    /// Higher runs first.
    pub priority: i64,
    pub scheduled_time: DateTime<Utc>,
    pub retries: u32,
    /// Number of retries allowed after the first failed attempt.
    pub max_retries: u32,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<TaskId>,
    pub dependents: BTreeSet<TaskId>,
    /// Opaque work description handed to the executor.
    #[serde(default)]
    pub payload: Option<String>,
    /// Set once cancellation was requested while the task was running.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, priority: i64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tenant_id: String::new(),
            priority,
            scheduled_time: Utc::now(),
            retries: 0,
            max_retries: 0,
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            payload: None,
            cancel_requested: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = at;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting anything [`TaskStatus::can_transition_to`]
    /// does not allow.
    pub(crate) fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::invalid_state(
                self.id.clone(),
                self.status,
                format!("cannot transition to {next}"),
            ));
        }
        self.status = next;
        Ok(())
    }
}
