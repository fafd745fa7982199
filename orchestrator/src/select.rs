//! Read-only scheduling preview for `orchestrator select`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::error::OrchestratorError;
use crate::core::selector::{BlockReason, ScheduleOutcome, refresh_statuses, schedule};
use crate::core::types::Snapshot;
use crate::exit_codes;
use crate::io::config::load_config;
use crate::io::init::OrchestratorPaths;
use crate::io::store::StateStore;

/// What the next cycle would work on. Nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectOutcome {
    /// A task would be dispatched (resumed when already in progress).
    Task(SelectedTask),
    Complete,
    /// The graph has no tasks; `recovered` when loading fell back to a fresh session.
    Empty { recovered: bool },
    /// Cycles are refused until the session is resumed.
    Halted { class: String, reason: String },
    Blocked { reason: BlockReason, description: String },
    Waiting { tasks: Vec<String> },
}

impl SelectOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SelectOutcome::Task(_) => exit_codes::OK,
            SelectOutcome::Complete => exit_codes::COMPLETE,
            SelectOutcome::Halted { .. } => exit_codes::HALTED,
            SelectOutcome::Empty { .. }
            | SelectOutcome::Blocked { .. }
            | SelectOutcome::Waiting { .. } => exit_codes::BLOCKED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedTask {
    pub id: String,
    pub title: String,
    pub phase: u32,
    pub priority: i32,
    pub resumed: bool,
    pub failure_count: u32,
}

/// Select from an in-memory snapshot, advancing through completed phases.
pub fn select_task(snapshot: &Snapshot) -> Result<SelectOutcome, OrchestratorError> {
    if let Some(halt) = &snapshot.session.halted {
        return Ok(SelectOutcome::Halted {
            class: halt.class.clone(),
            reason: halt.reason.clone(),
        });
    }
    if snapshot.tasks.tasks.is_empty() {
        return Ok(SelectOutcome::Empty { recovered: false });
    }
    let mut graph = snapshot.tasks.clone();
    refresh_statuses(&mut graph, &snapshot.manifest);
    let mut phase = snapshot.session.phase;
    loop {
        let (id, resumed) = match schedule(&graph, &snapshot.manifest, phase)? {
            ScheduleOutcome::Resume(id) => (id, true),
            ScheduleOutcome::Selected(id) => (id, false),
            ScheduleOutcome::PhaseComplete { next, .. } => {
                phase = next;
                continue;
            }
            ScheduleOutcome::AllComplete => return Ok(SelectOutcome::Complete),
            ScheduleOutcome::Blocked(reason) => {
                let description = reason.describe();
                return Ok(SelectOutcome::Blocked {
                    reason,
                    description,
                });
            }
            ScheduleOutcome::Waiting { tasks } => return Ok(SelectOutcome::Waiting { tasks }),
        };
        let task = graph
            .get(&id)
            .ok_or_else(|| OrchestratorError::StateConsistency {
                violations: vec![format!("selected task '{id}' missing from graph")],
            })?;
        return Ok(SelectOutcome::Task(SelectedTask {
            id: task.id.clone(),
            title: task.title.clone(),
            phase: task.phase,
            priority: task.priority,
            resumed,
            failure_count: task.failure_count,
        }));
    }
}

/// Load state from disk and preview the next selection.
pub fn select_from_root(root: &Path) -> Result<SelectOutcome> {
    let paths = OrchestratorPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let loaded = StateStore::new(paths, config)
        .load()
        .context("load state for selection")?;
    let outcome = select_task(&loaded.snapshot)?;
    Ok(match outcome {
        SelectOutcome::Empty { .. } => SelectOutcome::Empty {
            recovered: loaded.is_recovered(),
        },
        other => other,
    })
}
