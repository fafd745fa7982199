//! Cross-record consistency checks (corruption stage 4) and their repairs.
//!
//! Checks report stable messages like the schema stage does. Repairable
//! violations are fixed in place by [`repair`]; the rest leave the snapshot
//! flagged as recovered.

use std::collections::HashSet;

use crate::core::graph::{dependencies_completed, find_cycle, sync_dependents};
use crate::core::types::{Snapshot, TaskStatus};

/// One cross-record violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub message: String,
    pub repairable: bool,
}

impl Violation {
    fn repairable(message: String) -> Self {
        Self {
            message,
            repairable: true,
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            message,
            repairable: false,
        }
    }
}

/// Check semantic invariants not expressible in JSON Schema.
///
/// `exists` answers whether a workspace-relative path is present on disk.
pub fn check_consistency<F: Fn(&str) -> bool>(snapshot: &Snapshot, exists: F) -> Vec<Violation> {
    let mut out = Vec::new();
    let graph = &snapshot.tasks;

    let mut seen = HashSet::new();
    for task in &graph.tasks {
        if !seen.insert(task.id.as_str()) {
            out.push(Violation::fatal(format!("duplicate task id '{}'", task.id)));
        }
    }
    for task in &graph.tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                out.push(Violation::fatal(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
        }
    }
    if let Some(path) = find_cycle(graph) {
        out.push(Violation::fatal(format!(
            "dependency cycle: {}",
            path.join(" -> ")
        )));
    }

    let mut synced = graph.clone();
    for id in sync_dependents(&mut synced) {
        out.push(Violation::repairable(format!(
            "task '{id}': dependents out of sync with dependencies"
        )));
    }

    for task in &graph.tasks {
        for target in &task.targets {
            if !snapshot.xref.contains(target) {
                out.push(Violation::repairable(format!(
                    "task '{}': target '{}' missing from cross-reference map",
                    task.id, target
                )));
            }
        }
        for service in &task.services {
            if !snapshot.manifest.services.contains_key(service) {
                out.push(Violation::repairable(format!(
                    "task '{}': service '{}' missing from dependency manifest",
                    task.id, service
                )));
            }
        }
        if task.status == TaskStatus::Ready && !dependencies_completed(graph, task) {
            out.push(Violation::repairable(format!(
                "task '{}': marked ready with incomplete dependencies",
                task.id
            )));
        }
        if task.status == TaskStatus::Completed && !dependencies_completed(graph, task) {
            out.push(Violation::fatal(format!(
                "task '{}': completed before its dependencies",
                task.id
            )));
        }
    }

    let indexed: HashSet<&str> = snapshot.xref.files.keys().map(String::as_str).collect();
    for (source, entry) in &snapshot.xref.files {
        for rel in &entry.relations {
            let resolves = indexed.contains(rel.target.as_str()) || exists(&rel.target);
            if resolves == rel.broken {
                out.push(Violation::repairable(format!(
                    "xref '{}' -> '{}': broken flag is stale",
                    source, rel.target
                )));
            }
        }
    }

    let max_phase = graph.max_phase().unwrap_or(0);
    if snapshot.session.phase > max_phase {
        out.push(Violation::repairable(format!(
            "session phase {} beyond last task phase {}",
            snapshot.session.phase, max_phase
        )));
    }

    if let Some(active) = &snapshot.session.active {
        match graph.get(&active.task_id) {
            None => out.push(Violation::repairable(format!(
                "session active task '{}' does not exist",
                active.task_id
            ))),
            Some(task) if task.status != TaskStatus::InProgress => {
                out.push(Violation::repairable(format!(
                    "session active task '{}' is {}",
                    active.task_id,
                    task.status.as_str()
                )))
            }
            Some(_) => {}
        }
    }

    for task in graph
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::InProgress)
    {
        let tracked = snapshot
            .session
            .active
            .as_ref()
            .is_some_and(|active| active.task_id == task.id);
        if !tracked {
            out.push(Violation::repairable(format!(
                "task '{}' in progress without an active session pointer",
                task.id
            )));
        }
    }

    out
}

/// Apply every safe repair. Returns a description per action taken.
pub fn repair<F: Fn(&str) -> bool>(snapshot: &mut Snapshot, exists: F) -> Vec<String> {
    let mut actions = Vec::new();

    for id in sync_dependents(&mut snapshot.tasks) {
        actions.push(format!("recomputed dependents of '{id}'"));
    }

    let targets: Vec<(String, String)> = snapshot
        .tasks
        .tasks
        .iter()
        .flat_map(|task| task.targets.iter().map(|t| (task.id.clone(), t.clone())))
        .collect();
    for (task_id, target) in targets {
        if !snapshot.xref.contains(&target) {
            snapshot.xref.files.entry(target.clone()).or_default();
            actions.push(format!("indexed target '{target}' of task '{task_id}'"));
        }
    }

    let services: Vec<String> = snapshot
        .tasks
        .tasks
        .iter()
        .flat_map(|task| task.services.iter().cloned())
        .collect();
    for service in services {
        if !snapshot.manifest.services.contains_key(&service) {
            snapshot
                .manifest
                .services
                .insert(service.clone(), Default::default());
            actions.push(format!("registered unknown service '{service}' as unavailable"));
        }
    }

    let changed = snapshot.xref.mark_broken_edges(&exists);
    if changed > 0 {
        actions.push(format!("updated broken flag on {changed} cross-reference edge(s)"));
    }

    let demote: Vec<String> = snapshot
        .tasks
        .tasks
        .iter()
        .filter(|task| {
            task.status == TaskStatus::Ready && !dependencies_completed(&snapshot.tasks, task)
        })
        .map(|task| task.id.clone())
        .collect();
    for id in demote {
        if let Some(task) = snapshot.tasks.get_mut(&id) {
            task.status = TaskStatus::Pending;
            actions.push(format!("demoted '{id}' from ready to pending"));
        }
    }

    let max_phase = snapshot.tasks.max_phase().unwrap_or(0);
    if snapshot.session.phase > max_phase {
        actions.push(format!(
            "clamped session phase {} to {}",
            snapshot.session.phase, max_phase
        ));
        snapshot.session.phase = max_phase;
    }

    let active_ok = snapshot.session.active.as_ref().is_some_and(|active| {
        snapshot
            .tasks
            .get(&active.task_id)
            .is_some_and(|task| task.status == TaskStatus::InProgress)
    });
    if snapshot.session.active.is_some() && !active_ok {
        if let Some(active) = snapshot.session.active.take() {
            actions.push(format!("cleared stale active task '{}'", active.task_id));
        }
    }

    let active_id = snapshot
        .session
        .active
        .as_ref()
        .map(|active| active.task_id.clone());
    for task in &mut snapshot.tasks.tasks {
        if task.status == TaskStatus::InProgress && active_id.as_deref() != Some(task.id.as_str()) {
            task.status = TaskStatus::Pending;
            actions.push(format!("reset orphaned in-progress task '{}' to pending", task.id));
        }
    }

    snapshot.tasks.canonicalize();
    actions
}
