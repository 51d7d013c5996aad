// src/exec/mod.rs

//! Execution layer.
//!
//! - [`backend`] defines the [`TaskExecutor`] contract, the per-attempt
//!   [`ExecutionReport`] and the cooperative cancellation pair.
//! - [`shell`] provides [`ShellExecutor`], which runs task payloads as shell
//!   commands with `tokio::process`.

pub mod backend;
pub mod shell;

pub use backend::{
    CancelHandle, CancelSignal, ExecutionReport, SharedExecutor, TaskExecutor, TaskOutcome,
};
pub use shell::ShellExecutor;
