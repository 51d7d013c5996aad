// tests/scheduler_runtime.rs

use std::sync::Arc;
use std::time::Duration;

use dagsched::dag::{CancelOutcome, DependencyGraph, TaskStatus};
use dagsched::engine::{Scheduler, SchedulerOptions};
use dagsched::errors::SchedulerError;
use dagsched::store::{InMemoryStore, SharedStore};
use dagsched::types::RetryPolicy;
use dagsched_test_utils::builders::{spec, task, task_at};
use dagsched_test_utils::fake_executor::{ScriptedExecutor, Step};
use dagsched_test_utils::{init_tracing, with_timeout};

const NO_DEPS: [&str; 0] = [];

fn start(workers: usize, executor: &Arc<ScriptedExecutor>) -> Scheduler {
    start_with_store(workers, executor, None)
}

fn start_with_store(
    workers: usize,
    executor: &Arc<ScriptedExecutor>,
    store: Option<SharedStore>,
) -> Scheduler {
    init_tracing();
    let options = SchedulerOptions::new(workers).with_retry(RetryPolicy::immediate());
    Scheduler::start(options, executor.clone(), store)
}

async fn wait_for_status(scheduler: &Scheduler, id: &str, status: TaskStatus) {
    with_timeout(async {
        while scheduler.status_of(id) != Some(status) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}

#[tokio::test]
async fn chain_runs_in_dependency_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = start(4, &executor);

    scheduler.submit(task("A"), NO_DEPS).unwrap();
    scheduler.submit(task("B"), ["A"]).unwrap();
    scheduler.submit(task("C"), ["B"]).unwrap();

    with_timeout(scheduler.wait_idle()).await;

    assert_eq!(executor.started(), vec!["A", "B", "C"]);
    for id in ["A", "B", "C"] {
        assert_eq!(scheduler.status_of(id), Some(TaskStatus::Completed));
    }
    assert!(scheduler.stop(Duration::from_secs(1)).await.is_empty());
}

#[tokio::test]
async fn single_worker_dispatches_by_priority() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = start(1, &executor);

    scheduler
        .submit_batch(vec![
            spec(task_at("low", 5, 0), &[]),
            spec(task_at("high", 10, 0), &[]),
            spec(task_at("mid", 7, 0), &[]),
        ])
        .unwrap();

    with_timeout(scheduler.wait_idle()).await;
    assert_eq!(executor.started(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn failed_attempts_are_retried_until_success() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "A",
        [Step::Fail("attempt 1".into()), Step::Fail("attempt 2".into())],
    ));
    let scheduler = start(2, &executor);

    scheduler.submit(task("A").with_max_retries(2), NO_DEPS).unwrap();
    scheduler.submit(task("B"), ["A"]).unwrap();

    with_timeout(scheduler.wait_idle()).await;

    let a = scheduler.task("A").unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.retries, 2);
    assert_eq!(executor.attempts("A"), 3);
    assert_eq!(scheduler.status_of("B"), Some(TaskStatus::Completed));
    assert_eq!(executor.started(), vec!["A", "A", "A", "B"]);
}

#[tokio::test]
async fn failure_without_retries_cascades_and_skips_dependents() {
    let executor =
        Arc::new(ScriptedExecutor::new().script("A", [Step::Fail("exit code 1".into())]));
    let scheduler = start(2, &executor);

    scheduler.submit(task("A"), NO_DEPS).unwrap();
    scheduler.submit(task("B"), ["A"]).unwrap();

    with_timeout(scheduler.wait_idle()).await;

    assert_eq!(scheduler.status_of("A"), Some(TaskStatus::Failed));
    assert_eq!(scheduler.status_of("B"), Some(TaskStatus::Failed));
    assert_eq!(executor.attempts("B"), 0);
}

#[tokio::test]
async fn retry_backoff_parks_task_in_pending() {
    init_tracing();
    let executor =
        Arc::new(ScriptedExecutor::new().script("A", [Step::Fail("flaky".into())]));
    let retry = RetryPolicy::new(Duration::from_millis(150), Duration::from_millis(150));
    let scheduler = Scheduler::start(
        SchedulerOptions::new(1).with_retry(retry),
        executor.clone(),
        None,
    );

    scheduler.submit(task("A").with_max_retries(1), NO_DEPS).unwrap();

    with_timeout(async {
        while executor.attempts("A") == 0 || scheduler.task("A").unwrap().retries == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert_eq!(scheduler.status_of("A"), Some(TaskStatus::Pending));
    assert!(scheduler.get_running_tasks().is_empty());

    with_timeout(scheduler.wait_idle()).await;
    assert_eq!(scheduler.status_of("A"), Some(TaskStatus::Completed));
    assert_eq!(executor.attempts("A"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_tasks_never_exceed_worker_count() {
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(15)));
    let scheduler = start(3, &executor);

    let specs = (0..12)
        .map(|i| spec(task(&format!("t{i:02}")), &[]))
        .collect();
    scheduler.submit_batch(specs).unwrap();

    with_timeout(async {
        while !scheduler.summary().is_settled() {
            assert!(scheduler.get_running_tasks().len() <= 3);
            assert!(scheduler.pool().in_use() <= 3);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;

    assert!(executor.peak_concurrency() <= 3);
    assert!(executor.peak_concurrency() >= 2);
    assert_eq!(scheduler.summary().completed, 12);
}

#[tokio::test]
async fn cancelling_running_task_signals_executor_and_cascades() {
    let executor = Arc::new(ScriptedExecutor::new().script("A", [Step::UntilCancelled]));
    let scheduler = start(1, &executor);

    scheduler.submit(task("A"), NO_DEPS).unwrap();
    scheduler.submit(task("B"), ["A"]).unwrap();
    wait_for_status(&scheduler, "A", TaskStatus::Running).await;

    let outcome = scheduler.cancel_task("A").unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Signalled {
            cascaded: vec!["B".to_string()]
        }
    );
    assert_eq!(scheduler.status_of("B"), Some(TaskStatus::Cancelled));

    with_timeout(scheduler.wait_idle()).await;
    assert_eq!(scheduler.status_of("A"), Some(TaskStatus::Cancelled));
    assert_eq!(executor.attempts("B"), 0);
}

#[tokio::test]
async fn cancelling_queued_task_removes_it_from_ready_queue() {
    let executor = Arc::new(ScriptedExecutor::new().script("blocker", [Step::UntilCancelled]));
    let scheduler = start(1, &executor);

    scheduler.submit(task_at("blocker", 100, 0), NO_DEPS).unwrap();
    wait_for_status(&scheduler, "blocker", TaskStatus::Running).await;

    scheduler.submit(task("B"), NO_DEPS).unwrap();
    scheduler.submit(task("C"), ["B"]).unwrap();
    assert_eq!(scheduler.ready_len(), 1);

    match scheduler.cancel_task("B").unwrap() {
        CancelOutcome::Cancelled { cascaded } => assert_eq!(cascaded, vec!["C"]),
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert_eq!(scheduler.ready_len(), 0);

    assert!(matches!(
        scheduler.cancel_task("B"),
        Err(SchedulerError::InvalidState { status: TaskStatus::Cancelled, .. })
    ));

    scheduler.cancel_task("blocker").unwrap();
    with_timeout(scheduler.wait_idle()).await;
    assert_eq!(executor.started(), vec!["blocker"]);
}

#[tokio::test]
async fn late_dependency_reorders_queued_work() {
    let executor = Arc::new(ScriptedExecutor::new().script("blocker", [Step::UntilCancelled]));
    let scheduler = start(1, &executor);

    scheduler.submit(task_at("blocker", 100, 0), NO_DEPS).unwrap();
    wait_for_status(&scheduler, "blocker", TaskStatus::Running).await;

    // X would run first on priority alone.
    scheduler.submit(task_at("X", 9, 0), NO_DEPS).unwrap();
    scheduler.submit(task_at("Y", 1, 0), NO_DEPS).unwrap();

    assert!(scheduler.add_dependency("X", "Y").unwrap());
    assert_eq!(scheduler.status_of("X"), Some(TaskStatus::Pending));
    assert_eq!(scheduler.ready_len(), 1);

    assert!(matches!(
        scheduler.add_dependency("Y", "X"),
        Err(SchedulerError::Cycle { .. })
    ));
    assert!(matches!(
        scheduler.add_dependency("blocker", "Y"),
        Err(SchedulerError::InvalidState { status: TaskStatus::Running, .. })
    ));

    scheduler.cancel_task("blocker").unwrap();
    with_timeout(scheduler.wait_idle()).await;
    assert_eq!(executor.started(), vec!["blocker", "Y", "X"]);
}

#[tokio::test]
async fn rejected_submissions_leave_no_trace() {
    let executor = Arc::new(ScriptedExecutor::new().script("A", [Step::UntilCancelled]));
    let scheduler = start(1, &executor);
    scheduler.submit(task("A"), NO_DEPS).unwrap();

    assert!(matches!(
        scheduler.submit(task("A"), NO_DEPS),
        Err(SchedulerError::DuplicateTask(id)) if id == "A"
    ));
    assert!(matches!(
        scheduler.submit(task("B"), ["A", "ghost"]),
        Err(SchedulerError::UnknownTask(id)) if id == "ghost"
    ));
    assert!(matches!(
        scheduler.submit(task("C"), ["C"]),
        Err(SchedulerError::Cycle { .. })
    ));
    assert!(matches!(
        scheduler.submit_batch(vec![spec(task("D"), &[]), spec(task("E"), &["nowhere"])]),
        Err(SchedulerError::UnknownTask(_))
    ));

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.edges().is_empty());

    scheduler.cancel_task("A").unwrap();
    with_timeout(scheduler.wait_idle()).await;
}

#[tokio::test]
async fn stop_waits_for_running_tasks_and_rejects_new_work() {
    let executor = Arc::new(
        ScriptedExecutor::new().script("A", [Step::Sleep(Duration::from_millis(50))]),
    );
    let scheduler = start(1, &executor);

    scheduler.submit(task("A"), NO_DEPS).unwrap();
    scheduler.submit(task("B"), ["A"]).unwrap();
    wait_for_status(&scheduler, "A", TaskStatus::Running).await;

    let unfinished = with_timeout(scheduler.stop(Duration::from_secs(2))).await;

    assert!(unfinished.is_empty());
    assert_eq!(scheduler.status_of("A"), Some(TaskStatus::Completed));
    // Draining never starts new work.
    assert_eq!(scheduler.status_of("B"), Some(TaskStatus::Ready));
    assert_eq!(executor.attempts("B"), 0);

    assert!(matches!(
        scheduler.submit(task("late"), NO_DEPS),
        Err(SchedulerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn stop_timeout_cancels_stuck_tasks() {
    let executor = Arc::new(
        ScriptedExecutor::new().script("stuck", [Step::IgnoreCancel(Duration::from_secs(30))]),
    );
    let scheduler = start(2, &executor);

    scheduler.submit(task("stuck"), NO_DEPS).unwrap();
    scheduler.submit(task("after"), ["stuck"]).unwrap();
    wait_for_status(&scheduler, "stuck", TaskStatus::Running).await;

    let unfinished = with_timeout(scheduler.stop(Duration::from_millis(50))).await;

    assert_eq!(unfinished, vec!["stuck"]);
    assert_eq!(scheduler.status_of("stuck"), Some(TaskStatus::Cancelled));
    assert_eq!(scheduler.status_of("after"), Some(TaskStatus::Cancelled));
    assert!(scheduler.get_running_tasks().is_empty());
}

#[tokio::test]
async fn store_receives_every_transition_in_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(InMemoryStore::new());
    let scheduler = start_with_store(2, &executor, Some(store.clone()));

    scheduler.submit(task("A"), NO_DEPS).unwrap();
    scheduler.submit(task("B"), ["A"]).unwrap();
    with_timeout(scheduler.wait_idle()).await;

    let history_of = |id: &str| -> Vec<TaskStatus> {
        store
            .status_history()
            .into_iter()
            .filter(|(task, _)| task == id)
            .map(|(_, status)| status)
            .collect()
    };

    use TaskStatus::*;
    assert_eq!(history_of("A"), vec![Pending, Ready, Running, Completed]);
    assert_eq!(history_of("B"), vec![Pending, Ready, Running, Completed]);
    assert_eq!(store.status_of("B"), Some(Completed));
}

#[tokio::test]
async fn restart_from_stored_graph_skips_completed_work() {
    let mut done = task("A");
    done.status = TaskStatus::Completed;
    let mut next = task("B");
    next.dependencies.insert("A".to_string());
    let graph = DependencyGraph::bulk_load([done, next]).unwrap();

    init_tracing();
    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = Scheduler::start_with_graph(
        graph,
        SchedulerOptions::new(2),
        executor.clone(),
        None,
    );

    with_timeout(scheduler.wait_idle()).await;
    assert_eq!(executor.started(), vec!["B"]);
    assert_eq!(scheduler.summary().completed, 2);
}

#[tokio::test]
async fn restored_graph_with_failed_upstream_settles() {
    let mut broken = task("A");
    broken.status = TaskStatus::Failed;
    let mut orphan = task("B");
    orphan.dependencies.insert("A".to_string());
    let graph = DependencyGraph::bulk_load([broken, orphan]).unwrap();

    init_tracing();
    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = Scheduler::start_with_graph(
        graph,
        SchedulerOptions::new(1),
        executor.clone(),
        None,
    );

    with_timeout(scheduler.wait_idle()).await;
    assert_eq!(scheduler.status_of("B"), Some(TaskStatus::Failed));
    assert!(executor.started().is_empty());
}

#[tokio::test]
async fn purge_removes_finished_tasks() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = start(1, &executor);

    scheduler.submit(task("A"), NO_DEPS).unwrap();
    scheduler.submit(task("B"), ["A"]).unwrap();
    with_timeout(scheduler.wait_idle()).await;

    scheduler.purge("B").unwrap();
    scheduler.purge("A").unwrap();
    assert!(scheduler.snapshot().is_empty());
    assert!(matches!(
        scheduler.purge("A"),
        Err(SchedulerError::UnknownTask(_))
    ));
}
