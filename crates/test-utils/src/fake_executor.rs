use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dagsched::dag::Task;
use dagsched::exec::{CancelSignal, ExecutionReport, TaskExecutor};

/// What one scripted attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Report success after the executor's delay.
    Succeed,
    /// Report failure after the executor's delay.
    Fail(String),
    /// Sleep, then succeed. Cancellation during the sleep reports
    /// `Cancelled`.
    Sleep(Duration),
    /// Wait until cancelled, then report `Cancelled`.
    UntilCancelled,
    /// Sleep without looking at the cancel signal, then succeed.
    IgnoreCancel(Duration),
}

/// A fake executor that:
/// - plays back a per-task script of outcomes (default: succeed)
/// - records the order in which attempts were started
/// - tracks how many attempts ran at the same time
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    started: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to `Succeed` and `Fail` steps.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Outcomes for successive attempts of `task`. Attempts beyond the
    /// script succeed.
    pub fn script(self, task: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into_iter().collect());
        self
    }

    /// Every started attempt, in start order (retries appear again).
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn attempts(&self, task: &str) -> usize {
        self.started().iter().filter(|t| t.as_str() == task).count()
    }

    /// Highest number of attempts observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, task: &str) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

/// Decrements the running counter even if the attempt is aborted.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn run(
        &self,
        task: Task,
        mut cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = ExecutionReport> + Send + '_>> {
        Box::pin(async move {
            self.started.lock().unwrap().push(task.id.clone());
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard(&self.current);

            let (wait, report) = match self.next_step(&task.id) {
                Step::Succeed => (Some(self.delay), ExecutionReport::success()),
                Step::Fail(msg) => (Some(self.delay), ExecutionReport::failed(msg)),
                Step::Sleep(d) => (Some(d), ExecutionReport::success()),
                Step::UntilCancelled => (None, ExecutionReport::cancelled()),
                Step::IgnoreCancel(d) => {
                    tokio::time::sleep(d).await;
                    return ExecutionReport::success();
                }
            };

            match wait {
                Some(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => report,
                        _ = cancel.cancelled() => ExecutionReport::cancelled(),
                    }
                }
                None => {
                    cancel.cancelled().await;
                    report
                }
            }
        })
    }
}
