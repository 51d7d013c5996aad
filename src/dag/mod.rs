// src/dag/mod.rs

//! Task records and the dependency graph.
//!
//! - [`task`] holds the [`Task`] record and its closed [`TaskStatus`] set.
//! - [`graph`] owns every task, the dependency edges and in-degree counters,
//!   and guarantees acyclicity on every mutation.
//! - [`propagation`] contains the transitions that ripple through the graph:
//!   readiness, failure and cancellation cascades, retries.

pub mod graph;
pub mod propagation;
pub mod task;

pub use graph::DependencyGraph;
pub use propagation::{CancelOutcome, FailureDecision, GraphSummary};
pub use task::{Task, TaskStatus};
