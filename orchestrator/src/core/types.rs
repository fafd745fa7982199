//! Shared deterministic types for the orchestration core.
//!
//! These are the in-memory forms of the persisted state documents. They carry
//! no I/O and serialize deterministically (vectors sorted, maps ordered).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::core::manifest::DependencyManifest;
use crate::core::xref::CrossReferenceMap;

/// Current on-disk schema version for every state document.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

impl TaskStatus {
    /// Terminal tasks are never scheduled again; they stay in the graph for audit.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Kinds of proof a task must produce before it can complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceRequirements {
    pub test_pass: bool,
    pub file_existence: bool,
    pub external_validation: bool,
    pub integration_proof: bool,
}

/// A unit of work in the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub phase: u32,
    /// Higher runs first.
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Derived from other tasks' `dependencies`; kept in sync by the store.
    #[serde(default)]
    pub dependents: Vec<String>,
    /// Artifacts the task produces or edits.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Extra files the decision needs to see.
    #[serde(default)]
    pub context: Vec<String>,
    /// External services (Dependency Manifest names) the task validates against.
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub evidence: EvidenceRequirements,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Why the task is blocked, when `status == blocked`.
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, phase: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            phase,
            priority: 0,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            targets: Vec::new(),
            context: Vec::new(),
            services: Vec::new(),
            evidence: EvidenceRequirements::default(),
            failure_count: 0,
            last_error: None,
            blocked_reason: None,
        }
    }
}

/// Persisted task graph document (`tasks.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub schema_version: u32,
    pub tasks: Vec<Task>,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tasks: Vec::new(),
        }
    }
}

impl TaskGraph {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Canonical ordering: tasks by id, id lists sorted and deduplicated.
    pub fn canonicalize(&mut self) {
        self.tasks.sort_by(|a, b| a.id.cmp(&b.id));
        for task in &mut self.tasks {
            for list in [
                &mut task.dependencies,
                &mut task.dependents,
                &mut task.services,
            ] {
                list.sort();
                list.dedup();
            }
        }
    }

    /// Highest phase that has at least one task.
    pub fn max_phase(&self) -> Option<u32> {
        self.tasks.iter().map(|task| task.phase).max()
    }
}

/// The task currently handed to the external executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: String,
    /// Gateway request id of the instruction that started this attempt.
    pub request_id: String,
    pub dispatched_at: DateTime<Utc>,
}

/// Why a session stopped. Persisted so later cycles refuse to run until an
/// operator resumes the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halt {
    /// Classification of the error that halted the session.
    pub class: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Persisted session record (`session.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub schema_version: u32,
    pub id: String,
    pub phase: u32,
    pub step: u32,
    pub blocked: bool,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    pub iteration: u32,
    #[serde(default)]
    pub escalations_used: u32,
    #[serde(default)]
    pub active: Option<ActiveTask>,
    #[serde(default)]
    pub halted: Option<Halt>,
    pub created_at: DateTime<Utc>,
    pub config: OrchestratorConfig,
}

impl Session {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, config: OrchestratorConfig) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id: id.into(),
            phase: 0,
            step: 0,
            blocked: false,
            blocked_reason: None,
            iteration: 0,
            escalations_used: 0,
            active: None,
            halted: None,
            created_at,
            config,
        }
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.blocked = true;
        self.blocked_reason = Some(reason.into());
    }

    pub fn unblock(&mut self) {
        self.blocked = false;
        self.blocked_reason = None;
    }

    /// Stop the session until [`Session::resume`] is called.
    pub fn halt(&mut self, class: impl Into<String>, reason: impl Into<String>, at: DateTime<Utc>) {
        let reason = reason.into();
        self.block(reason.clone());
        self.halted = Some(Halt {
            class: class.into(),
            reason,
            at,
        });
    }

    /// Clear a halt. Returns the halt that was cleared, if any.
    pub fn resume(&mut self) -> Option<Halt> {
        let halt = self.halted.take()?;
        self.unblock();
        Some(halt)
    }
}

/// Consistent view of all four state documents.
///
/// Components receive a snapshot per cycle and hand the mutated copy back to
/// the State Store; nothing outlives the cycle in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub session: Session,
    pub tasks: TaskGraph,
    pub xref: CrossReferenceMap,
    pub manifest: DependencyManifest,
}

impl Snapshot {
    /// Fresh, empty snapshot for a new session.
    pub fn initial(session_id: impl Into<String>, now: DateTime<Utc>, config: OrchestratorConfig) -> Self {
        Self {
            session: Session::new(session_id, now, config),
            tasks: TaskGraph::default(),
            xref: CrossReferenceMap::default(),
            manifest: DependencyManifest::default(),
        }
    }
}
