// src/exec/shell.rs

//! Executor that runs a task's payload as a shell command.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dag::Task;
use crate::exec::backend::{CancelSignal, ExecutionReport, TaskExecutor};

/// Stdout beyond this many bytes is dropped from the report.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Runs `task.payload` through `sh -c` (`cmd /C` on Windows).
///
/// - exit status 0 is a success, anything else a failure carrying the code
/// - stdout is captured into the report's `output`
/// - stderr is drained and logged at debug level
/// - on cancellation the child is killed and the attempt reports
///   `Cancelled`
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl TaskExecutor for ShellExecutor {
    fn run(
        &self,
        task: Task,
        cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = ExecutionReport> + Send + '_>> {
        Box::pin(async move {
            let task_id = task.id.clone();
            match run_command(task, cancel).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(task = %task_id, error = %err, "task execution error");
                    ExecutionReport::failed(format!("{err:#}"))
                }
            }
        })
    }
}

async fn run_command(task: Task, mut cancel: CancelSignal) -> Result<ExecutionReport> {
    let Some(cmd_line) = task.payload.as_deref() else {
        return Ok(ExecutionReport::failed(format!(
            "task '{}' has no command",
            task.id
        )));
    };

    info!(task = %task.id, cmd = %cmd_line, "starting task process");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd_line);
        c
    };

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for task '{}'", task.id))?;

    // Stdout is read to the end even past the cap; closing the pipe early
    // would kill the child with SIGPIPE.
    let stdout_reader = child.stdout.take().map(|stdout| {
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut capped = stdout.take(MAX_CAPTURED_OUTPUT as u64);
            if let Err(err) = capped.read_to_end(&mut buf).await {
                debug!(task = %task_id, error = %err, "reading stdout failed");
            }
            match tokio::io::copy(&mut capped.into_inner(), &mut tokio::io::sink()).await {
                Ok(0) => {}
                Ok(dropped) => debug!(task = %task_id, dropped, "stdout beyond capture limit discarded"),
                Err(err) => debug!(task = %task_id, error = %err, "draining stdout failed"),
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    // Always consume stderr so the pipe never fills up.
    if let Some(stderr) = child.stderr.take() {
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %task_id, "stderr: {}", line);
            }
        });
    }

    tokio::select! {
        status = child.wait() => {
            let status = status
                .with_context(|| format!("waiting for process of task '{}'", task.id))?;
            let code = status.code().unwrap_or(-1);

            let output = match stdout_reader {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };

            info!(task = %task.id, exit_code = code, success = status.success(), "task process exited");

            let report = if status.success() {
                ExecutionReport::success()
            } else {
                ExecutionReport::failed(format!("exit code {code}"))
            };
            Ok(report.with_output(output))
        }

        _ = cancel.cancelled() => {
            info!(task = %task.id, "cancellation requested; killing process");
            if let Err(e) = child.kill().await {
                warn!(task = %task.id, error = %e, "failed to kill child process on cancellation");
            }
            Ok(ExecutionReport::cancelled())
        }
    }
}
