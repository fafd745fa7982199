//! `orchestrator validate`: report every stage of the state checks without
//! repairing anything.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::core::chain::{ChainReport, verify};
use crate::core::invariants::check_consistency;
use crate::core::types::Snapshot;
use crate::io::config::load_config;
use crate::io::init::{COMMIT_FILE, OrchestratorPaths};
use crate::io::store::{Document, StateStore, commit_problems};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Layout, config, and document presence.
    Presence,
    Parse,
    Schema,
    Consistency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Problem {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<&'static str>,
    pub message: String,
    /// Whether loading would repair it in place.
    pub repairable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidateReport {
    pub ok: bool,
    /// Stages that ran; later stages are skipped once one fails.
    pub stages: Vec<Stage>,
    pub problems: Vec<Problem>,
}

impl ValidateReport {
    fn push(&mut self, stage: Stage, document: Option<&'static str>, message: impl Into<String>) {
        self.problems.push(Problem {
            stage,
            document,
            message: message.into(),
            repairable: false,
        });
    }
}

/// Validate `.orchestrator/` under `root`.
pub fn validate_orchestrator(root: &Path) -> Result<ValidateReport> {
    let paths = OrchestratorPaths::new(root);
    let mut report = ValidateReport {
        ok: true,
        stages: vec![Stage::Presence],
        problems: Vec::new(),
    };

    for dir in [&paths.dir, &paths.state_dir, &paths.evidence_dir, &paths.audit_dir] {
        if !dir.is_dir() {
            report.push(Stage::Presence, None, format!("missing directory {}", dir.display()));
        }
    }
    if let Err(err) = load_config(&paths.config_path) {
        report.push(Stage::Presence, None, format!("{err:#}"));
    }
    for doc in Document::ALL {
        if !paths.state_dir.join(doc.file_name()).is_file() {
            report.push(Stage::Presence, Some(doc.file_name()), "missing");
        }
    }
    if !report.problems.is_empty() {
        return Ok(finish(report));
    }

    report.stages.push(Stage::Parse);
    let mut values = Vec::with_capacity(Document::ALL.len());
    for doc in Document::ALL {
        let path = paths.state_dir.join(doc.file_name());
        let parsed = fs::read_to_string(&path)
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => "missing".to_string(),
                _ => format!("unreadable: {err}"),
            })
            .and_then(|raw| {
                serde_json::from_str::<Value>(&raw).map_err(|err| format!("invalid json: {err}"))
            });
        match parsed {
            Ok(value) => values.push((doc, value)),
            Err(message) => report.push(Stage::Parse, Some(doc.file_name()), message),
        }
    }
    if !report.problems.is_empty() {
        return Ok(finish(report));
    }

    report.stages.push(Stage::Schema);
    for (doc, value) in &values {
        for violation in doc.violations(value) {
            report.push(Stage::Schema, Some(doc.file_name()), violation);
        }
    }
    if !report.problems.is_empty() {
        return Ok(finish(report));
    }

    report.stages.push(Stage::Consistency);
    let snapshot = match assemble(values) {
        Ok(snapshot) => snapshot,
        Err(message) => {
            report.push(Stage::Consistency, None, message);
            return Ok(finish(report));
        }
    };
    for message in commit_problems(&paths.state_dir) {
        report.push(Stage::Consistency, Some(COMMIT_FILE), message);
    }
    for violation in check_consistency(&snapshot, |path| root.join(path).exists()) {
        report.problems.push(Problem {
            stage: Stage::Consistency,
            document: None,
            message: violation.message,
            repairable: violation.repairable,
        });
    }
    Ok(finish(report))
}

/// Re-derive the evidence chain of `task_id` from its stored records.
pub fn verify_evidence(root: &Path, task_id: &str) -> Result<ChainReport> {
    let paths = OrchestratorPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let store = StateStore::new(paths, config);
    let records = store.read_evidence(task_id)?;
    let chain = store.read_chain(task_id)?;
    Ok(verify(&chain, &records))
}

fn finish(mut report: ValidateReport) -> ValidateReport {
    report.ok = report.problems.is_empty();
    report
}

fn assemble(values: Vec<(Document, Value)>) -> Result<Snapshot, String> {
    let mut object = serde_json::Map::new();
    for (doc, value) in values {
        let key = match doc {
            Document::Session => "session",
            Document::Tasks => "tasks",
            Document::Xref => "xref",
            Document::Manifest => "manifest",
        };
        object.insert(key.to_string(), value);
    }
    serde_json::from_value(Value::Object(object)).map_err(|err| format!("decode state: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::evidence::EvidenceKind;
    use crate::core::types::TaskStatus;
    use crate::test_support::{TestWorkspace, evidence_record, task_with_deps, timestamp};

    #[test]
    fn fresh_workspace_is_valid() {
        let ws = TestWorkspace::new().expect("workspace");
        let report = validate_orchestrator(ws.root()).expect("validate");
        assert!(report.ok, "{:?}", report.problems);
        assert_eq!(
            report.stages,
            vec![Stage::Presence, Stage::Parse, Stage::Schema, Stage::Consistency]
        );
    }

    #[test]
    fn missing_layout_stops_at_presence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = validate_orchestrator(temp.path()).expect("validate");
        assert!(!report.ok);
        assert_eq!(report.stages, vec![Stage::Presence]);
    }

    #[test]
    fn corrupt_document_is_a_parse_problem() {
        let ws = TestWorkspace::new().expect("workspace");
        fs::write(&ws.paths().xref_path, "{ not json").expect("write");

        let report = validate_orchestrator(ws.root()).expect("validate");
        assert_eq!(report.stages.last(), Some(&Stage::Parse));
        assert_eq!(report.problems[0].document, Some("xref.json"));
    }

    #[test]
    fn schema_violation_is_reported_not_repaired() {
        let ws = TestWorkspace::new().expect("workspace");
        fs::write(&ws.paths().tasks_path, "{\"schema_version\": 1, \"tasks\": 7}\n").expect("write");

        let report = validate_orchestrator(ws.root()).expect("validate");
        assert!(report.problems.iter().all(|p| p.stage == Stage::Schema));
        assert!(!report.problems.is_empty());
        let raw = fs::read_to_string(&ws.paths().tasks_path).expect("read");
        assert!(raw.contains("\"tasks\": 7"));
    }

    #[test]
    fn documents_from_another_save_are_reported() {
        let ws = TestWorkspace::new().expect("workspace");
        let stale = fs::read(&ws.paths().commit_path).expect("marker");
        ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
        fs::write(&ws.paths().commit_path, stale).expect("stale marker");

        let report = validate_orchestrator(ws.root()).expect("validate");
        assert!(!report.ok);
        let torn: Vec<&Problem> = report
            .problems
            .iter()
            .filter(|p| p.document == Some(COMMIT_FILE))
            .collect();
        assert!(!torn.is_empty());
        assert!(torn.iter().all(|p| p.stage == Stage::Consistency && !p.repairable));
        assert!(torn.iter().any(|p| p.message.starts_with("tasks.json: does not match")));
    }

    #[test]
    fn orphaned_in_progress_task_is_repairable() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut task = task_with_deps("lexer", &[]);
        task.status = TaskStatus::InProgress;
        ws.seed(vec![task]).expect("seed");

        let report = validate_orchestrator(ws.root()).expect("validate");
        assert!(!report.ok);
        assert!(report.problems.iter().all(|p| p.repairable));
    }

    #[test]
    fn edited_evidence_breaks_chain() {
        let ws = TestWorkspace::new().expect("workspace");
        let store = ws.store().expect("store");
        let records = vec![
            evidence_record("lexer", 1, EvidenceKind::Progress, timestamp(10)),
            evidence_record("lexer", 2, EvidenceKind::Completion, timestamp(20)),
        ];
        store.append_evidence("lexer", &records).expect("append");
        assert!(verify_evidence(ws.root(), "lexer").expect("verify").intact);

        let path = ws.paths().evidence_path("lexer");
        let raw = fs::read_to_string(&path).expect("read");
        fs::write(&path, raw.replacen("progress", "validation", 1)).expect("write");
        let report = verify_evidence(ws.root(), "lexer").expect("verify");
        assert!(!report.intact);
        assert_eq!(report.break_at, Some(0));
    }
}
