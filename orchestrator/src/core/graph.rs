//! Structural checks and mutations for the task graph.
//!
//! Every mutation re-runs cycle detection; a cycle is reported as a
//! [`StructuralError`] and the mutation is rolled back.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::error::StructuralError;
use crate::core::types::{Task, TaskGraph, TaskStatus};

/// Check ids are unique and every dependency resolves.
pub fn check_references(graph: &TaskGraph) -> Result<(), StructuralError> {
    let mut seen = HashSet::new();
    for task in &graph.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(StructuralError::DuplicateTask(task.id.clone()));
        }
    }
    for task in &graph.tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(StructuralError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first cycle search with an explicit recursion stack.
///
/// Returns the first cycle found as a closed path (`a -> b -> a`). Tasks are
/// visited in id order so the reported cycle is deterministic.
pub fn find_cycle(graph: &TaskGraph) -> Option<Vec<String>> {
    let edges: BTreeMap<&str, Vec<&str>> = graph
        .tasks
        .iter()
        .map(|task| {
            let mut deps: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
            deps.sort_unstable();
            (task.id.as_str(), deps)
        })
        .collect();
    let mut marks: HashMap<&str, Mark> = edges.keys().map(|id| (*id, Mark::Unvisited)).collect();
    let mut stack: Vec<&str> = Vec::new();

    for &start in edges.keys() {
        if marks[start] == Mark::Unvisited
            && let Some(cycle) = visit(start, &edges, &mut marks, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    edges: &BTreeMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(id, Mark::OnStack);
    stack.push(id);
    for &dep in edges.get(id).map(Vec::as_slice).unwrap_or_default() {
        match marks.get(dep).copied() {
            // Dangling edges are reported by `check_references`.
            None | Some(Mark::Done) => {}
            Some(Mark::OnStack) => {
                let start = stack.iter().position(|entry| *entry == dep).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            Some(Mark::Unvisited) => {
                if let Some(cycle) = visit(dep, edges, marks, stack) {
                    return Some(cycle);
                }
            }
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    None
}

/// Full structural validation: unique ids, resolvable dependencies, acyclic.
pub fn validate_structure(graph: &TaskGraph) -> Result<(), StructuralError> {
    check_references(graph)?;
    if let Some(path) = find_cycle(graph) {
        return Err(StructuralError::Cycle { path });
    }
    Ok(())
}

/// Recompute every task's `dependents` from the `dependencies` relation.
///
/// Returns the ids of tasks whose `dependents` changed.
pub fn sync_dependents(graph: &mut TaskGraph) -> Vec<String> {
    let mut derived: HashMap<String, Vec<String>> = HashMap::new();
    for task in &graph.tasks {
        for dep in &task.dependencies {
            derived.entry(dep.clone()).or_default().push(task.id.clone());
        }
    }
    let mut changed = Vec::new();
    for task in &mut graph.tasks {
        let mut next = derived.remove(&task.id).unwrap_or_default();
        next.sort();
        next.dedup();
        if next != task.dependents {
            task.dependents = next;
            changed.push(task.id.clone());
        }
    }
    changed.sort();
    changed
}

/// Dependents of `task` that have not completed yet.
pub fn unresolved_dependents(graph: &TaskGraph, task: &Task) -> usize {
    task.dependents
        .iter()
        .filter(|id| {
            graph
                .get(id)
                .is_some_and(|dependent| dependent.status != TaskStatus::Completed)
        })
        .count()
}

/// True when every dependency of `task` is completed.
pub fn dependencies_completed(graph: &TaskGraph, task: &Task) -> bool {
    task.dependencies.iter().all(|dep| {
        graph
            .get(dep)
            .is_some_and(|found| found.status == TaskStatus::Completed)
    })
}

impl TaskGraph {
    /// Insert a task, rejecting duplicates, dangling dependencies, and cycles.
    pub fn insert_task(&mut self, task: Task) -> Result<(), StructuralError> {
        if self.get(&task.id).is_some() {
            return Err(StructuralError::DuplicateTask(task.id));
        }
        self.tasks.push(task);
        if let Err(err) = validate_structure(self) {
            self.tasks.pop();
            return Err(err);
        }
        sync_dependents(self);
        self.canonicalize();
        Ok(())
    }

    /// Add `task -> dependency`, rejecting the edge if it closes a cycle.
    pub fn add_dependency(&mut self, task: &str, dependency: &str) -> Result<(), StructuralError> {
        if self.get(dependency).is_none() {
            return Err(StructuralError::DanglingDependency {
                task: task.to_string(),
                dependency: dependency.to_string(),
            });
        }
        let entry = self
            .get_mut(task)
            .ok_or_else(|| StructuralError::UnknownTask(task.to_string()))?;
        if entry.dependencies.iter().any(|dep| dep == dependency) {
            return Ok(());
        }
        entry.dependencies.push(dependency.to_string());
        if let Some(path) = find_cycle(self) {
            if let Some(entry) = self.get_mut(task) {
                entry.dependencies.retain(|dep| dep != dependency);
            }
            return Err(StructuralError::Cycle { path });
        }
        sync_dependents(self);
        self.canonicalize();
        Ok(())
    }
}
