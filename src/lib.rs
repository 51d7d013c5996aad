// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::Manifest;
use crate::dag::TaskStatus;
use crate::engine::Scheduler;
use crate::exec::{SharedExecutor, ShellExecutor};
use crate::store::{JsonFileStore, SharedStore};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - manifest loading
/// - scheduler, worker pool and shell executor
/// - the optional JSON store
/// - Ctrl-C handling
///
/// Returns `Ok(true)` when every task completed.
pub async fn run(args: CliArgs) -> Result<bool> {
    let manifest_path = PathBuf::from(&args.manifest);
    let manifest = load_and_validate(&manifest_path)
        .with_context(|| format!("loading manifest {}", manifest_path.display()))?;

    if args.dry_run {
        print_dry_run(&manifest);
        return Ok(true);
    }

    let mut options = manifest.scheduler_options();
    if let Some(workers) = args.workers {
        options.workers = workers as usize;
    }
    options = options.with_span(tracing::info_span!(
        "scheduler",
        manifest = %manifest_path.display()
    ));

    let store: Option<SharedStore> = match &manifest.scheduler.store {
        Some(path) => {
            let store = JsonFileStore::open(path)
                .with_context(|| format!("opening store {}", path.display()))?;
            Some(Arc::new(store))
        }
        None => None,
    };

    let executor: SharedExecutor = Arc::new(ShellExecutor::new());
    let scheduler = Scheduler::start(options, executor, store);

    scheduler
        .submit_batch(manifest.task_specs())
        .context("submitting manifest tasks")?;
    info!(tasks = manifest.task.len(), "manifest submitted");

    tokio::select! {
        _ = scheduler.wait_idle() => {
            debug!("all tasks settled");
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => warn!("Ctrl-C received; shutting down"),
                Err(err) => warn!(error = %err, "failed to listen for Ctrl-C; shutting down"),
            }
        }
    }

    let unfinished = scheduler.stop(manifest.scheduler.drain_timeout()).await;
    if !unfinished.is_empty() {
        warn!(tasks = ?unfinished, "tasks cancelled at shutdown");
    }

    Ok(print_summary(&scheduler))
}

/// Print one line per task plus totals. Returns `true` if all completed.
fn print_summary(scheduler: &Scheduler) -> bool {
    let snapshot = scheduler.snapshot();
    let summary = snapshot.summary();

    println!("dagsched summary");
    for task in snapshot.tasks() {
        let attempts = if task.retries > 0 {
            format!(" (retries: {})", task.retries)
        } else {
            String::new()
        };
        println!("  {:<10} {}{attempts}", task.status.to_string(), task.id);
    }
    println!(
        "completed: {}, failed: {}, cancelled: {}, unfinished: {}",
        summary.completed,
        summary.failed,
        summary.cancelled,
        summary.pending + summary.ready + summary.running
    );

    snapshot
        .tasks()
        .all(|task| task.status == TaskStatus::Completed)
}

/// Print the validated manifest without executing anything.
fn print_dry_run(manifest: &Manifest) {
    let section = &manifest.scheduler;

    println!("dagsched dry-run");
    println!("  scheduler.workers = {}", section.workers);
    println!("  scheduler.default_max_retries = {}", section.default_max_retries);
    println!(
        "  scheduler.backoff = {}ms..{}ms",
        section.backoff_base_ms, section.backoff_max_ms
    );
    println!("  scheduler.drain_timeout_ms = {}", section.drain_timeout_ms);
    if let Some(store) = &section.store {
        println!("  scheduler.store = {}", store.display());
    }
    println!();

    println!("tasks ({}):", manifest.task.len());
    for (id, task) in manifest.task.iter() {
        println!("  - {id}");
        if let Some(name) = &task.name {
            println!("      name: {name}");
        }
        if let Some(tenant) = &task.tenant_id {
            println!("      tenant: {tenant}");
        }
        println!("      priority: {}", task.priority);
        println!(
            "      max_retries: {}",
            task.max_retries.unwrap_or(section.default_max_retries)
        );
        println!("      cmd: {}", task.cmd);
        if !task.after.is_empty() {
            println!("      after: {:?}", task.after);
        }
    }

    debug!("dry-run complete (no execution)");
}
