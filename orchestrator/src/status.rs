//! `orchestrator status`: a read-only summary of the session and graph.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{ActiveTask, Halt, Snapshot, TaskStatus};
use crate::io::config::load_config;
use crate::io::init::OrchestratorPaths;
use crate::io::store::{LoadStatus, StateStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    pub state: LoadStatus,
    pub phase: u32,
    pub step: u32,
    pub iteration: u32,
    pub max_iterations: u32,
    pub escalations_used: u32,
    pub escalation_budget: u32,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<Halt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveTask>,
    /// Task count per status; statuses with no tasks are omitted.
    pub tasks: BTreeMap<&'static str, usize>,
    pub failed: Vec<String>,
    pub unusable_services: Vec<String>,
    pub backups: usize,
}

pub fn summarize(snapshot: &Snapshot, state: LoadStatus, backups: usize) -> StatusReport {
    let session = &snapshot.session;
    let mut tasks = BTreeMap::new();
    for task in &snapshot.tasks.tasks {
        *tasks.entry(task.status.as_str()).or_insert(0) += 1;
    }
    let failed = snapshot
        .tasks
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Failed)
        .map(|task| task.id.clone())
        .collect();
    let unusable_services = snapshot
        .manifest
        .services
        .iter()
        .filter(|(_, entry)| !entry.is_usable())
        .map(|(name, _)| name.clone())
        .collect();
    StatusReport {
        session_id: session.id.clone(),
        state,
        phase: session.phase,
        step: session.step,
        iteration: session.iteration,
        max_iterations: session.config.max_iterations,
        escalations_used: session.escalations_used,
        escalation_budget: session.config.escalation.budget,
        blocked: session.blocked,
        blocked_reason: session.blocked_reason.clone(),
        halted: session.halted.clone(),
        active: session.active.clone(),
        tasks,
        failed,
        unusable_services,
        backups,
    }
}

pub fn status_from_root(root: &Path) -> Result<StatusReport> {
    let paths = OrchestratorPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let store = StateStore::new(paths, config);
    let loaded = store.load().context("load state for status")?;
    Ok(summarize(
        &loaded.snapshot,
        loaded.status,
        store.list_backups().len(),
    ))
}
