// tests/worker_pool.rs

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use dagsched::dag::Task;
use dagsched::exec::{CancelSignal, ExecutionReport, SharedExecutor, TaskExecutor};
use dagsched::pool::WorkerPool;
use dagsched_test_utils::builders::task;
use dagsched_test_utils::fake_executor::{ScriptedExecutor, Step};
use dagsched_test_utils::{init_tracing, with_timeout};

/// Executor whose attempts always panic.
struct PanickingExecutor;

impl TaskExecutor for PanickingExecutor {
    fn run(
        &self,
        task: Task,
        _cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = ExecutionReport> + Send + '_>> {
        Box::pin(async move {
            if task.id.is_empty() {
                return ExecutionReport::success();
            }
            panic!("boom in {}", task.id)
        })
    }
}

#[test]
fn capacity_is_clamped_to_one() {
    let pool = WorkerPool::new(0);
    assert_eq!(pool.capacity(), 1);
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn slots_are_bounded_and_returned_on_drop() {
    let pool = WorkerPool::new(2);

    let first = pool.acquire().await.unwrap();
    let second = pool.try_acquire().expect("second slot");
    assert_eq!(pool.in_use(), 2);
    assert!(pool.try_acquire().is_none());

    drop(first);
    assert_eq!(pool.available(), 1);
    let third = pool.try_acquire().expect("slot freed by drop");

    drop((second, third));
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn acquire_waits_for_a_release() {
    let pool = WorkerPool::new(1);
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.is_ok() })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(held);
    assert!(with_timeout(waiter).await.unwrap());
}

#[tokio::test]
async fn close_fails_pending_acquisitions() {
    let pool = WorkerPool::new(1);
    let _held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.is_err() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.close();
    assert!(with_timeout(waiter).await.unwrap());
}

#[tokio::test]
async fn spawned_worker_reports_and_keeps_slot_until_report_is_dropped() {
    init_tracing();
    let pool = WorkerPool::new(1);
    let executor: SharedExecutor =
        Arc::new(ScriptedExecutor::new().script("job", [Step::Fail("exit code 3".into())]));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let slot = pool.acquire().await.unwrap();
    pool.spawn(slot, executor, task("job"), CancelSignal::never(), tx);

    let report = with_timeout(rx.recv()).await.expect("worker report");
    assert_eq!(report.task_id, "job");
    assert_eq!(report.report.error(), Some("exit code 3"));
    assert_eq!(pool.in_use(), 1);

    drop(report);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn cancel_signal_reaches_the_executor() {
    let pool = WorkerPool::new(1);
    let executor: SharedExecutor =
        Arc::new(ScriptedExecutor::new().script("job", [Step::UntilCancelled]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (handle, signal) = CancelSignal::pair();

    let slot = pool.acquire().await.unwrap();
    pool.spawn(slot, executor, task("job"), signal, tx);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handle.cancel());

    let report = with_timeout(rx.recv()).await.expect("worker report");
    assert_eq!(report.report, ExecutionReport::cancelled());
}

#[tokio::test]
async fn executor_panic_becomes_failed_report() {
    let pool = WorkerPool::new(1);
    let executor: SharedExecutor = Arc::new(PanickingExecutor);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let slot = pool.acquire().await.unwrap();
    pool.spawn(slot, executor, task("job"), CancelSignal::never(), tx);

    let report = with_timeout(rx.recv()).await.expect("worker report");
    assert!(!report.report.is_success());
    assert!(report.report.error().is_some_and(|e| e.contains("executor aborted")));
}
