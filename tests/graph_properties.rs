// tests/graph_properties.rs

use std::collections::HashSet;

use proptest::prelude::*;

use dagsched::dag::{DependencyGraph, TaskStatus};
use dagsched::errors::SchedulerError;
use dagsched::queue::{ReadyEntry, ReadyQueue};
use dagsched_test_utils::builders::{graph_with, task_at};

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("t{i}")).collect()
}

// Acyclic by construction: task i may only depend on tasks 0..i.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1..=max_tasks).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..(n * 2));
        edges.prop_map(move |raw| {
            let edges = raw
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| if a > b { (a, b) } else { (b, a) })
                .collect();
            (n, edges)
        })
    })
}

fn build(n: usize, edges: &[(usize, usize)]) -> DependencyGraph {
    let names = ids(n);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let edge_refs: Vec<(&str, &str)> = edges
        .iter()
        .map(|(a, b)| (refs[*a], refs[*b]))
        .collect();
    graph_with(&refs, &edge_refs)
}

proptest! {
    #[test]
    fn arbitrary_edges_never_create_a_cycle(
        n in 2usize..8,
        raw in proptest::collection::vec((0usize..8, 0usize..8), 0..40),
    ) {
        let names = ids(n);
        let mut graph = build(n, &[]);

        for (a, b) in raw {
            let (dependent, dependency) = (&names[a % n], &names[b % n]);
            let before = graph.edges();

            match graph.add_dependency(dependent, dependency) {
                Ok(_) => {}
                Err(SchedulerError::Cycle { path }) => {
                    prop_assert_eq!(path.first(), path.last());
                    prop_assert_eq!(graph.edges(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
            prop_assert!(graph.verify_acyclic().is_none());
        }
    }

    #[test]
    fn every_task_runs_after_its_dependencies(
        (n, edges) in dag_strategy(10),
        picks in proptest::collection::vec(any::<usize>(), 10),
    ) {
        let mut graph = build(n, &edges);
        let mut ready: Vec<String> = graph.promote_all_ready();
        let mut done: HashSet<String> = HashSet::new();
        let mut pick = picks.into_iter().cycle();

        while !ready.is_empty() {
            let idx = pick.next().unwrap_or(0) % ready.len();
            let id = ready.swap_remove(idx);

            let record = graph.get(&id).unwrap().clone();
            for dep in &record.dependencies {
                prop_assert!(done.contains(dep), "{id} started before {dep}");
            }

            graph.start_task(&id).unwrap();
            ready.extend(graph.on_task_completed(&id).unwrap());
            done.insert(id);
        }

        prop_assert_eq!(done.len(), n);
        prop_assert_eq!(graph.summary().completed, n);
    }

    #[test]
    fn failure_cascade_reaches_exactly_the_descendants(
        (n, edges) in dag_strategy(10),
        root in any::<usize>(),
    ) {
        let mut graph = build(n, &edges);
        graph.promote_all_ready();
        let roots: Vec<String> = graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.id.clone())
            .collect();
        let root = roots[root % roots.len()].clone();

        // Expected: everything reachable from root along dependents.
        let mut expected: HashSet<String> = HashSet::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            for dep in &graph.get(&id).unwrap().dependents {
                if expected.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }

        graph.start_task(&root).unwrap();
        let cascaded: HashSet<String> =
            graph.on_task_failed_permanently(&root).unwrap().into_iter().collect();

        prop_assert_eq!(&cascaded, &expected);
        for id in &expected {
            prop_assert_eq!(graph.status_of(id), Some(TaskStatus::Failed));
        }
    }

    #[test]
    fn ready_queue_pops_in_total_order(
        entries in proptest::collection::vec((-5i64..5, 0i64..4), 1..30),
    ) {
        let queue = ReadyQueue::new();
        for (i, (priority, offset)) in entries.iter().enumerate() {
            queue.push(ReadyEntry::from(&task_at(&format!("e{i:02}"), *priority, *offset)));
        }

        let popped: Vec<ReadyEntry> = std::iter::from_fn(|| queue.pop()).collect();
        prop_assert_eq!(popped.len(), entries.len());
        for pair in popped.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(
                a.priority > b.priority
                    || (a.priority == b.priority && a.scheduled_time < b.scheduled_time)
                    || (a.priority == b.priority
                        && a.scheduled_time == b.scheduled_time
                        && a.task_id < b.task_id)
            );
        }
    }
}
