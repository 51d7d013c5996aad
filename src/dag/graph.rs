// src/dag/graph.rs

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque, btree_set};

use tracing::debug;

use crate::dag::task::{Task, TaskStatus};
use crate::errors::{Result, SchedulerError};
use crate::types::TaskId;

/// In-memory DAG of tasks keyed by id.
///
/// Edges point from a dependency to its dependents. Adjacency lives in each
/// task's `dependencies` / `dependents` sets; `in_degree` counts, per task,
/// the dependencies that have not reached `Completed` yet.
///
/// Every mutation either succeeds completely or returns an error with the
/// graph left exactly as it was.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub(crate) tasks: BTreeMap<TaskId, Task>,
    pub(crate) in_degree: HashMap<TaskId, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// Number of dependencies of `id` that have not completed yet.
    pub fn in_degree_of(&self, id: &str) -> Option<usize> {
        self.in_degree.get(id).copied()
    }

    /// All tasks, ordered by id.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// All edges as `(dependency, dependent)` pairs, ordered.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.tasks
            .values()
            .flat_map(|t| t.dependents.iter().map(|d| (t.id.clone(), d.clone())))
            .collect()
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))
    }

    pub(crate) fn task(&self, id: &str) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))
    }

    /// Register a new task in `Pending`.
    ///
    /// Whatever status and edge sets the caller filled in are discarded; edges
    /// are only ever created through [`add_dependency`](Self::add_dependency).
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }

        task.status = TaskStatus::Pending;
        task.dependencies.clear();
        task.dependents.clear();
        task.cancel_requested = false;

        debug!(task = %task.id, priority = task.priority, "task registered");
        self.in_degree.insert(task.id.clone(), 0);
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Make `dependent_id` wait on `dependency_id`.
    ///
    /// Returns `Ok(false)` when the edge already existed. A `Ready` dependent
    /// that gains an unfinished dependency drops back to `Pending`; callers
    /// that hold it in a ready queue must take it out.
    pub fn add_dependency(&mut self, dependent_id: &str, dependency_id: &str) -> Result<bool> {
        let dependent = self.task(dependent_id)?;
        let dependency = self.task(dependency_id)?;

        if dependent.dependencies.contains(dependency_id) {
            return Ok(false);
        }

        if let Some(path) = self.find_path(dependent_id, dependency_id) {
            // The new edge dependency -> dependent closes the existing path.
            let mut cycle = path;
            cycle.push(dependent_id.to_string());
            return Err(SchedulerError::Cycle { path: cycle });
        }

        if !matches!(dependent.status, TaskStatus::Pending | TaskStatus::Ready) {
            return Err(SchedulerError::invalid_state(
                dependent_id,
                dependent.status,
                "dependencies can only be added before dispatch",
            ));
        }

        if matches!(dependency.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(SchedulerError::invalid_state(
                dependency_id,
                dependency.status,
                "cannot depend on a task that will never complete",
            ));
        }

        let dependency_done = dependency.status == TaskStatus::Completed;

        self.task_mut(dependency_id)?
            .dependents
            .insert(dependent_id.to_string());

        let dependent = self.task_mut(dependent_id)?;
        dependent.dependencies.insert(dependency_id.to_string());

        if !dependency_done {
            if dependent.status == TaskStatus::Ready {
                dependent.transition(TaskStatus::Pending)?;
            }
            *self.in_degree.entry(dependent_id.to_string()).or_insert(0) += 1;
        }

        debug!(
            dependent = %dependent_id,
            dependency = %dependency_id,
            "dependency edge added"
        );
        Ok(true)
    }

    /// Breadth-first search along dependent edges. Returns the path
    /// `[from, .., to]` if `to` is reachable from `from`.
    fn find_path(&self, from: &str, to: &str) -> Option<Vec<TaskId>> {
        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        visited.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![current.to_string()];
                let mut cursor = current;
                while let Some(&prev) = parent.get(cursor) {
                    path.push(prev.to_string());
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }

            if let Some(task) = self.tasks.get(current) {
                for next in task.dependents.iter() {
                    if visited.insert(next.as_str()) {
                        parent.insert(next.as_str(), current);
                        queue.push_back(next.as_str());
                    }
                }
            }
        }

        None
    }

    fn children(&self, id: &str) -> Option<btree_set::Iter<'_, TaskId>> {
        self.tasks.get(id).map(|t| t.dependents.iter())
    }

    /// Full-graph cycle check.
    ///
    /// Depth-first search with three colours (unvisited, on the stack, done).
    /// Returns the first cycle found as `[a, b, .., a]`, or `None` when the
    /// graph is acyclic. The incremental path never needs this because
    /// [`add_dependency`](Self::add_dependency) refuses cycle-closing edges;
    /// it exists for bulk-loaded graphs and diagnostics.
    pub fn verify_acyclic(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Colour {
            Unvisited,
            InStack,
            Done,
        }

        let mut colour: HashMap<&str, Colour> = self
            .tasks
            .keys()
            .map(|id| (id.as_str(), Colour::Unvisited))
            .collect();

        for root in self.tasks.keys() {
            if colour[root.as_str()] != Colour::Unvisited {
                continue;
            }

            // Explicit stack of (node, remaining children).
            let mut stack: Vec<(&str, Option<btree_set::Iter<'_, TaskId>>)> =
                vec![(root.as_str(), self.children(root))];
            colour.insert(root.as_str(), Colour::InStack);

            while let Some((node, children)) = stack.last_mut() {
                let node = *node;
                let Some(child) = children.as_mut().and_then(Iterator::next) else {
                    colour.insert(node, Colour::Done);
                    stack.pop();
                    continue;
                };

                match colour.get(child.as_str()).copied() {
                    Some(Colour::Unvisited) => {
                        colour.insert(child.as_str(), Colour::InStack);
                        stack.push((child.as_str(), self.children(child)));
                    }
                    Some(Colour::InStack) => {
                        let start = stack
                            .iter()
                            .position(|(id, _)| *id == child.as_str())
                            .unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            stack[start..].iter().map(|(id, _)| id.to_string()).collect();
                        cycle.push(child.clone());
                        return Some(cycle);
                    }
                    Some(Colour::Done) | None => {}
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_acyclic_reports_cycle_in_raw_adjacency() {
        let mut graph = DependencyGraph::new();
        for (id, next) in [("a", "b"), ("b", "c"), ("c", "a")] {
            let mut task = Task::new(id, 0);
            task.dependents.insert(next.to_string());
            graph.tasks.insert(id.to_string(), task);
        }

        assert_eq!(
            graph.verify_acyclic(),
            Some(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "a".to_string()
            ])
        );
    }

    #[test]
    fn verify_acyclic_resumes_each_fan_out_after_finished_children() {
        let mut graph = DependencyGraph::new();
        let mut hub = Task::new("hub", 0);
        for i in 0..200 {
            let leaf = format!("leaf{i:03}");
            hub.dependents.insert(leaf.clone());
            graph.tasks.insert(leaf.clone(), Task::new(&leaf, 0));
        }
        // Only the last child leads back to the hub.
        let mut closer = Task::new("zz", 0);
        closer.dependents.insert("hub".to_string());
        hub.dependents.insert("zz".to_string());
        graph.tasks.insert("zz".to_string(), closer);
        graph.tasks.insert("hub".to_string(), hub);

        assert_eq!(
            graph.verify_acyclic(),
            Some(vec!["hub".to_string(), "zz".to_string(), "hub".to_string()])
        );

        graph.tasks.get_mut("zz").unwrap().dependents.clear();
        assert_eq!(graph.verify_acyclic(), None);
    }

    #[test]
    fn find_path_follows_dependents() {
        let mut graph = DependencyGraph::new();
        for id in ["a", "b", "c"] {
            graph.add_task(Task::new(id, 0)).unwrap();
        }
        graph.add_dependency("b", "a").unwrap();
        graph.add_dependency("c", "b").unwrap();

        assert_eq!(
            graph.find_path("a", "c"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(graph.find_path("c", "a"), None);
    }
}
