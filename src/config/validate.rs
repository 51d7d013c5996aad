// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{Manifest, RawManifest};
use crate::errors::{Result, SchedulerError};

impl TryFrom<RawManifest> for Manifest {
    type Error = SchedulerError;

    fn try_from(raw: RawManifest) -> std::result::Result<Self, Self::Error> {
        validate_manifest(&raw)?;
        Ok(Manifest::new_unchecked(raw.scheduler, raw.task))
    }
}

/// Run every manifest check, stopping at the first failure.
pub fn validate_manifest(manifest: &RawManifest) -> Result<()> {
    ensure_has_tasks(manifest)?;
    validate_scheduler_section(manifest)?;
    validate_task_dependencies(manifest)?;
    validate_dag(manifest)?;
    Ok(())
}

fn ensure_has_tasks(manifest: &RawManifest) -> Result<()> {
    if manifest.task.is_empty() {
        return Err(SchedulerError::ConfigError(
            "manifest must contain at least one [task.<id>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_scheduler_section(manifest: &RawManifest) -> Result<()> {
    let section = &manifest.scheduler;

    if section.workers == 0 {
        return Err(SchedulerError::ConfigError(
            "[scheduler].workers must be >= 1 (got 0)".to_string(),
        ));
    }

    if section.backoff_base_ms > section.backoff_max_ms {
        return Err(SchedulerError::ConfigError(format!(
            "[scheduler].backoff_base_ms ({}) must not exceed backoff_max_ms ({})",
            section.backoff_base_ms, section.backoff_max_ms
        )));
    }

    Ok(())
}

fn validate_task_dependencies(manifest: &RawManifest) -> Result<()> {
    for (id, task) in manifest.task.iter() {
        for dep in task.after.iter() {
            if dep == id {
                return Err(SchedulerError::ConfigError(format!(
                    "task '{id}' cannot depend on itself in `after`"
                )));
            }
            if !manifest.task.contains_key(dep) {
                return Err(SchedulerError::ConfigError(format!(
                    "task '{id}' has unknown dependency '{dep}' in `after`"
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(manifest: &RawManifest) -> Result<()> {
    // Edge direction: dependency -> dependent, as in the scheduler graph.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for id in manifest.task.keys() {
        graph.add_node(id.as_str());
    }

    for (id, task) in manifest.task.iter() {
        for dep in task.after.iter() {
            graph.add_edge(dep.as_str(), id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(SchedulerError::ConfigError(format!(
            "dependency cycle in manifest involving task '{}'",
            cycle.node_id()
        ))),
    }
}
