//! Deterministic scheduling over the task graph.
//!
//! Readiness: a non-terminal, not-running task whose dependencies are all
//! completed and whose required services are validated and available.
//! Tie-break: highest priority, then fewest unresolved dependents, then lowest id.

use std::cmp::Reverse;
use std::collections::HashSet;

use serde::Serialize;

use crate::core::error::StructuralError;
use crate::core::graph::{dependencies_completed, unresolved_dependents, validate_structure};
use crate::core::manifest::DependencyManifest;
use crate::core::types::{Task, TaskGraph, TaskStatus};

/// Why no task can run although work remains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// Every remaining task waits on a service that is unavailable or unvalidated.
    UnavailableServices { services: Vec<String>, tasks: Vec<String> },
    /// Remaining tasks depend (transitively) on failed tasks.
    FailedDependencies { failed: Vec<String>, tasks: Vec<String> },
}

impl BlockReason {
    pub fn describe(&self) -> String {
        match self {
            BlockReason::UnavailableServices { services, tasks } => format!(
                "tasks [{}] wait on unavailable services [{}]",
                tasks.join(", "),
                services.join(", ")
            ),
            BlockReason::FailedDependencies { failed, tasks } => format!(
                "tasks [{}] depend on failed tasks [{}]",
                tasks.join(", "),
                failed.join(", ")
            ),
        }
    }
}

/// Result of one scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// An `in_progress` task is resumed.
    Resume(String),
    /// A ready task was selected.
    Selected(String),
    /// Every task in `completed` is done; `next` is the next phase with tasks.
    PhaseComplete { completed: u32, next: u32 },
    /// Every task in the graph is completed.
    AllComplete,
    /// No task can run without outside intervention; escalate.
    Blocked(BlockReason),
    /// Work remains but its prerequisites are still moving.
    Waiting { tasks: Vec<String> },
}

fn services_usable(task: &Task, manifest: &DependencyManifest) -> bool {
    manifest.unusable(&task.services).is_empty()
}

fn is_schedulable_status(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked
    )
}

/// Every task ready to run, in graph order.
///
/// Fails with a structural error on duplicate ids, dangling dependencies, or
/// cycles; never returns a partial answer for a malformed graph.
pub fn ready_tasks<'a>(
    graph: &'a TaskGraph,
    manifest: &DependencyManifest,
) -> Result<Vec<&'a Task>, StructuralError> {
    validate_structure(graph)?;
    Ok(graph
        .tasks
        .iter()
        .filter(|task| {
            is_schedulable_status(task.status)
                && dependencies_completed(graph, task)
                && services_usable(task, manifest)
        })
        .collect())
}

/// Pick the next task among `ready`.
pub fn select<'a>(graph: &TaskGraph, ready: &[&'a Task]) -> Option<&'a Task> {
    ready
        .iter()
        .copied()
        .min_by_key(|task| {
            (
                Reverse(task.priority),
                unresolved_dependents(graph, task),
                task.id.as_str(),
            )
        })
}

/// Recompute `pending`/`ready`/`blocked` for schedulable tasks.
///
/// Running and terminal tasks are left alone. Returns ids whose status changed.
pub fn refresh_statuses(graph: &mut TaskGraph, manifest: &DependencyManifest) -> Vec<String> {
    let mut updates = Vec::new();
    for task in &graph.tasks {
        if !is_schedulable_status(task.status) {
            continue;
        }
        let (status, reason) = if !dependencies_completed(graph, task) {
            (TaskStatus::Pending, None)
        } else {
            let unusable = manifest.unusable(&task.services);
            if unusable.is_empty() {
                (TaskStatus::Ready, None)
            } else {
                (
                    TaskStatus::Blocked,
                    Some(format!("waiting on services: {}", unusable.join(", "))),
                )
            }
        };
        if status != task.status || reason != task.blocked_reason {
            updates.push((task.id.clone(), status, reason));
        }
    }
    let mut changed = Vec::new();
    for (id, status, reason) in updates {
        if let Some(task) = graph.get_mut(&id) {
            if task.status != status {
                changed.push(id.clone());
            }
            task.status = status;
            task.blocked_reason = reason;
        }
    }
    changed
}

/// True when every task of `phase` is completed.
pub fn phase_complete(graph: &TaskGraph, phase: u32) -> bool {
    graph
        .tasks
        .iter()
        .filter(|task| task.phase == phase)
        .all(|task| task.status == TaskStatus::Completed)
}

/// Decide what the current cycle should do.
///
/// Only tasks up to `phase` are eligible. A running task is always resumed
/// first so tasks execute strictly one at a time.
pub fn schedule(
    graph: &TaskGraph,
    manifest: &DependencyManifest,
    phase: u32,
) -> Result<ScheduleOutcome, StructuralError> {
    let ready = ready_tasks(graph, manifest)?;

    if let Some(running) = graph
        .tasks
        .iter()
        .find(|task| task.status == TaskStatus::InProgress)
    {
        return Ok(ScheduleOutcome::Resume(running.id.clone()));
    }

    let in_phase: Vec<&Task> = ready.into_iter().filter(|task| task.phase <= phase).collect();
    if let Some(task) = select(graph, &in_phase) {
        return Ok(ScheduleOutcome::Selected(task.id.clone()));
    }

    let remaining: Vec<&Task> = graph
        .tasks
        .iter()
        .filter(|task| task.phase <= phase && task.status != TaskStatus::Completed)
        .collect();

    if remaining.is_empty() {
        let next = graph
            .tasks
            .iter()
            .filter(|task| task.phase > phase)
            .map(|task| task.phase)
            .min();
        return Ok(match next {
            Some(next) => ScheduleOutcome::PhaseComplete {
                completed: phase,
                next,
            },
            None => ScheduleOutcome::AllComplete,
        });
    }

    Ok(diagnose_stall(graph, manifest, &remaining))
}

fn diagnose_stall(
    graph: &TaskGraph,
    manifest: &DependencyManifest,
    remaining: &[&Task],
) -> ScheduleOutcome {
    let open: Vec<&Task> = remaining
        .iter()
        .copied()
        .filter(|task| task.status != TaskStatus::Failed)
        .collect();
    let service_blocked: Vec<&Task> = open
        .iter()
        .copied()
        .filter(|task| dependencies_completed(graph, task) && !services_usable(task, manifest))
        .collect();
    let stuck_on_failure: Vec<&Task> = open
        .iter()
        .copied()
        .filter(|task| depends_on(graph, task, |dep| dep.status == TaskStatus::Failed))
        .collect();
    // Tasks behind a service-blocked task stall with it.
    let service_stalled: Vec<&Task> = open
        .iter()
        .copied()
        .filter(|task| {
            service_blocked.iter().any(|b| b.id == task.id)
                || depends_on(graph, task, |dep| {
                    service_blocked.iter().any(|b| b.id == dep.id)
                })
        })
        .collect();

    let waiting: Vec<String> = open
        .iter()
        .filter(|task| {
            !service_stalled.iter().any(|b| b.id == task.id)
                && !stuck_on_failure.iter().any(|s| s.id == task.id)
        })
        .map(|task| task.id.clone())
        .collect();
    if !waiting.is_empty() {
        return ScheduleOutcome::Waiting { tasks: waiting };
    }

    if !stuck_on_failure.is_empty() || open.is_empty() {
        let failed: Vec<String> = graph
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(|task| task.id.clone())
            .collect();
        return ScheduleOutcome::Blocked(BlockReason::FailedDependencies {
            failed,
            tasks: stuck_on_failure.iter().map(|task| task.id.clone()).collect(),
        });
    }

    let mut services: Vec<String> = service_blocked
        .iter()
        .flat_map(|task| manifest.unusable(&task.services))
        .map(str::to_string)
        .collect();
    services.sort();
    services.dedup();
    ScheduleOutcome::Blocked(BlockReason::UnavailableServices {
        services,
        tasks: service_stalled.iter().map(|task| task.id.clone()).collect(),
    })
}

/// True when any transitive dependency of `task` satisfies `pred`.
fn depends_on<F: Fn(&Task) -> bool>(graph: &TaskGraph, task: &Task, pred: F) -> bool {
    let mut stack: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(dep) = graph.get(id) else { continue };
        if pred(dep) {
            return true;
        }
        stack.extend(dep.dependencies.iter().map(String::as_str));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::{ServiceCheck, ServiceEntry};
    use crate::test_support::{graph_of, task_with_deps, timestamp};

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|task| task.id.clone()).collect()
    }

    #[test]
    fn completed_dependency_unlocks_dependent() {
        let mut graph = graph_of(vec![task_with_deps("A", &[]), task_with_deps("B", &["A"])]);
        graph.get_mut("A").expect("A").status = TaskStatus::Completed;
        let ready = ready_tasks(&graph, &DependencyManifest::default()).expect("ready");
        assert_eq!(ids(&ready), vec!["B"]);
    }

    #[test]
    fn cycle_is_structural_error_not_subset() {
        let graph = graph_of(vec![
            task_with_deps("free", &[]),
            task_with_deps("x", &["y"]),
            task_with_deps("y", &["x"]),
        ]);
        let err = ready_tasks(&graph, &DependencyManifest::default()).unwrap_err();
        assert!(matches!(err, StructuralError::Cycle { .. }));
    }

    #[test]
    fn tie_break_priority_then_dependents_then_id() {
        let mut graph = graph_of(vec![
            task_with_deps("a", &[]),
            task_with_deps("b", &[]),
            task_with_deps("c", &[]),
            task_with_deps("d", &["a"]),
            task_with_deps("e", &["a"]),
            task_with_deps("f", &["b"]),
        ]);
        graph.get_mut("c").expect("c").priority = -1;
        let manifest = DependencyManifest::default();

        let ready = ready_tasks(&graph, &manifest).expect("ready");
        // a and b share priority 0; b has fewer unresolved dependents.
        assert_eq!(select(&graph, &ready).expect("selected").id, "b");

        graph.get_mut("a").expect("a").priority = 5;
        let ready = ready_tasks(&graph, &manifest).expect("ready");
        assert_eq!(select(&graph, &ready).expect("selected").id, "a");
    }

    #[test]
    fn selection_is_deterministic() {
        let graph = graph_of(vec![
            task_with_deps("z", &[]),
            task_with_deps("m", &[]),
            task_with_deps("k", &[]),
        ]);
        let manifest = DependencyManifest::default();
        let first = select(&graph, &ready_tasks(&graph, &manifest).expect("ready"))
            .expect("selected")
            .id
            .clone();
        for _ in 0..10 {
            let again = select(&graph, &ready_tasks(&graph, &manifest).expect("ready"))
                .expect("selected");
            assert_eq!(again.id, first);
        }
        assert_eq!(first, "k");
    }

    #[test]
    fn unvalidated_service_keeps_task_unready() {
        let mut task = task_with_deps("call-api", &[]);
        task.services = vec!["billing".to_string()];
        task.evidence.external_validation = true;
        let mut graph = graph_of(vec![task]);
        let mut manifest = DependencyManifest::default();
        manifest
            .services
            .insert("billing".to_string(), ServiceEntry::default());

        assert!(ready_tasks(&graph, &manifest).expect("ready").is_empty());
        assert_eq!(
            schedule(&graph, &manifest, 0).expect("schedule"),
            ScheduleOutcome::Blocked(BlockReason::UnavailableServices {
                services: vec!["billing".to_string()],
                tasks: vec!["call-api".to_string()],
            })
        );
        assert_eq!(refresh_statuses(&mut graph, &manifest), vec!["call-api"]);
        assert_eq!(graph.tasks[0].status, TaskStatus::Blocked);

        manifest.apply_check(&ServiceCheck {
            service: "billing".to_string(),
            ok: true,
            detail: String::new(),
            at: timestamp(0),
        });
        assert_eq!(
            schedule(&graph, &manifest, 0).expect("schedule"),
            ScheduleOutcome::Selected("call-api".to_string())
        );
        refresh_statuses(&mut graph, &manifest);
        assert_eq!(graph.tasks[0].status, TaskStatus::Ready);
        assert!(graph.tasks[0].blocked_reason.is_none());
    }

    #[test]
    fn running_task_is_resumed_first() {
        let mut graph = graph_of(vec![task_with_deps("a", &[]), task_with_deps("b", &[])]);
        graph.get_mut("b").expect("b").status = TaskStatus::InProgress;
        assert_eq!(
            schedule(&graph, &DependencyManifest::default(), 0).expect("schedule"),
            ScheduleOutcome::Resume("b".to_string())
        );
    }

    #[test]
    fn phase_transition_and_completion() {
        let mut first = task_with_deps("p0", &[]);
        first.status = TaskStatus::Completed;
        let mut second = task_with_deps("p2", &[]);
        second.phase = 2;
        let mut graph = graph_of(vec![first, second]);
        let manifest = DependencyManifest::default();

        assert!(phase_complete(&graph, 0));
        assert!(!phase_complete(&graph, 2));
        assert_eq!(
            schedule(&graph, &manifest, 0).expect("schedule"),
            ScheduleOutcome::PhaseComplete {
                completed: 0,
                next: 2
            }
        );
        graph.get_mut("p2").expect("p2").status = TaskStatus::Completed;
        assert_eq!(
            schedule(&graph, &manifest, 2).expect("schedule"),
            ScheduleOutcome::AllComplete
        );
    }

    #[test]
    fn failed_dependency_blocks() {
        let mut graph = graph_of(vec![task_with_deps("a", &[]), task_with_deps("b", &["a"])]);
        graph.get_mut("a").expect("a").status = TaskStatus::Failed;
        assert_eq!(
            schedule(&graph, &DependencyManifest::default(), 0).expect("schedule"),
            ScheduleOutcome::Blocked(BlockReason::FailedDependencies {
                failed: vec!["a".to_string()],
                tasks: vec!["b".to_string()],
            })
        );
    }

    #[test]
    fn dependency_in_later_phase_waits() {
        let mut later = task_with_deps("later", &[]);
        later.phase = 1;
        let graph = graph_of(vec![later, task_with_deps("now", &["later"])]);
        assert_eq!(
            schedule(&graph, &DependencyManifest::default(), 0).expect("schedule"),
            ScheduleOutcome::Waiting {
                tasks: vec!["now".to_string()]
            }
        );
    }
}
