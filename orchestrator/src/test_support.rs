//! Test-only builders, scripted collaborators, and a temporary workspace.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::config::OrchestratorConfig;
use crate::core::context_pack::ContextSource;
use crate::core::escalation::{EscalationVerdict, Evaluator, EvidencePackage};
use crate::core::evidence::{EvidenceKind, EvidenceRecord};
use crate::core::graph::sync_dependents;
use crate::core::types::{Snapshot, Task, TaskGraph};
use crate::io::audit::{AuditEntry, AuditSink};
use crate::io::config::{load_config, write_config};
use crate::io::gateway::{DispatchError, DispatchRequest, Dispatcher};
use crate::io::init::{InitOptions, OrchestratorPaths, init_orchestrator};
use crate::io::store::StateStore;

/// 2026-01-01T00:00:00Z plus `secs`.
pub fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600 + secs, 0).expect("valid test timestamp")
}

/// Phase-0 task with the given dependencies.
pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    let mut task = Task::new(id, format!("{id} title"), 0);
    task.dependencies = deps.iter().map(|dep| (*dep).to_string()).collect();
    task
}

/// Graph with dependents filled in. Not validated, so malformed graphs can
/// be built on purpose.
pub fn graph_of(tasks: Vec<Task>) -> TaskGraph {
    let mut graph = TaskGraph {
        tasks,
        ..TaskGraph::default()
    };
    sync_dependents(&mut graph);
    graph.canonicalize();
    graph
}

pub fn snapshot_with(tasks: Vec<Task>) -> Snapshot {
    let mut snapshot = Snapshot::initial("session-test", timestamp(0), OrchestratorConfig::default());
    snapshot.tasks = graph_of(tasks);
    snapshot
}

pub fn evidence_record(
    task_id: &str,
    sequence: u64,
    kind: EvidenceKind,
    at: DateTime<Utc>,
) -> EvidenceRecord {
    EvidenceRecord {
        id: format!("{task_id}-{sequence:04}"),
        task_id: task_id.to_string(),
        sequence,
        kind,
        collected_at: Some(at),
        test_run: None,
        files: None,
        service_calls: Vec::new(),
        note: None,
        verdict: None,
    }
}

/// In-memory context source. Modification times are unknown.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: BTreeMap<String, String>,
}

impl MemorySource {
    pub fn with(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }
}

impl ContextSource for MemorySource {
    fn read(&self, path: &str) -> Option<String> {
        self.files.get(path).cloned()
    }

    fn modified(&self, _path: &str) -> Option<DateTime<Utc>> {
        None
    }
}

/// Evaluator returning canned verdicts in order.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    verdicts: RefCell<VecDeque<EscalationVerdict>>,
    seen: RefCell<Vec<String>>,
}

impl ScriptedEvaluator {
    pub fn new(verdicts: Vec<EscalationVerdict>) -> Self {
        Self {
            verdicts: RefCell::new(verdicts.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    /// Package ids evaluated so far.
    pub fn seen(&self) -> Vec<String> {
        self.seen.borrow().clone()
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, package: &EvidencePackage) -> Result<EscalationVerdict> {
        self.seen.borrow_mut().push(package.id.clone());
        self.verdicts
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted evaluator has no verdict left"))
    }
}

/// Dispatcher replaying scripted results in order; fails fatally once drained.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    responses: RefCell<VecDeque<Result<String, DispatchError>>>,
    requests: RefCell<Vec<DispatchRequest>>,
}

impl ScriptedDispatcher {
    pub fn new(responses: Vec<Result<String, DispatchError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.borrow().clone()
    }
}

impl Dispatcher for ScriptedDispatcher {
    fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(DispatchError::Fatal("script exhausted".to_string())))
    }
}

#[derive(Debug, Default)]
pub struct MemoryAudit {
    entries: RefCell<Vec<AuditEntry>>,
}

impl MemoryAudit {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.borrow().clone()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.borrow_mut().push(entry.clone());
        Ok(())
    }
}

/// Temporary project with an initialized `.orchestrator/`.
pub struct TestWorkspace {
    _temp: tempfile::TempDir,
    root: PathBuf,
    paths: OrchestratorPaths,
}

impl TestWorkspace {
    /// Initialized workspace with millisecond backoff so retries stay fast.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let paths = init_orchestrator(&root, &InitOptions { force: false })?;
        let workspace = Self {
            _temp: temp,
            root,
            paths,
        };
        workspace.configure(|config| {
            config.gateway.backoff_base_ms = 1;
            config.gateway.backoff_max_ms = 5;
        })?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> &OrchestratorPaths {
        &self.paths
    }

    pub fn config(&self) -> Result<OrchestratorConfig> {
        load_config(&self.paths.config_path)
    }

    pub fn configure(&self, edit: impl FnOnce(&mut OrchestratorConfig)) -> Result<()> {
        let mut config = self.config()?;
        edit(&mut config);
        write_config(&self.paths.config_path, &config)
    }

    pub fn store(&self) -> Result<StateStore> {
        Ok(StateStore::new(self.paths.clone(), self.config()?))
    }

    /// Write a project file relative to the root.
    pub fn write_file(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Replace the task graph (and index task targets) in stored state.
    pub fn seed(&self, tasks: Vec<Task>) -> Result<Snapshot> {
        let store = self.store()?;
        let mut snapshot = store.load()?.snapshot;
        snapshot.tasks = graph_of(tasks);
        for task in &snapshot.tasks.tasks {
            for target in &task.targets {
                snapshot.xref.files.entry(target.clone()).or_default();
            }
            for service in &task.services {
                snapshot.manifest.services.entry(service.clone()).or_default();
            }
        }
        store.save(&snapshot)?;
        Ok(snapshot)
    }
}
