//! Evidence records submitted for task attempts and the verdicts attached to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Completion,
    Progress,
    Validation,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunEvidence {
    pub command: String,
    pub exit_status: i32,
    pub passed: u32,
    pub failed: u32,
    /// Literal expected value asserted by the run, when reported.
    #[serde(default)]
    pub expected: Option<String>,
    /// Literal actual value observed by the run, when reported.
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
}

impl TestRunEvidence {
    pub fn is_passing(&self) -> bool {
        self.exit_status == 0 && self.failed == 0 && self.passed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemEvidence {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallEvidence {
    pub service: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub dns_ms: Option<f64>,
    #[serde(default)]
    pub connect_ms: Option<f64>,
    #[serde(default)]
    pub total_ms: Option<f64>,
    #[serde(default)]
    pub response_excerpt: Option<String>,
}

/// Which authenticity strategy raised an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Pattern,
    Temporal,
    Structural,
    Chain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub check: CheckKind,
    /// Stable machine-readable code, e.g. `implausible_timing`.
    pub code: String,
    pub detail: String,
    #[serde(default)]
    pub evidence_id: Option<String>,
}

impl Indicator {
    pub fn new(check: CheckKind, code: &str, detail: impl Into<String>, evidence_id: Option<&str>) -> Self {
        Self {
            check,
            code: code.to_string(),
            detail: detail.into(),
            evidence_id: evidence_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticityVerdict {
    pub authentic: bool,
    pub score: f64,
    pub indicators: Vec<Indicator>,
    /// Evidence ids that sit at or after a chain break.
    #[serde(default)]
    pub unverifiable: Vec<String>,
}

/// Evidence as submitted by the external executor (no id yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub task_id: String,
    pub kind: EvidenceKind,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub test_run: Option<TestRunEvidence>,
    #[serde(default)]
    pub files: Option<FileSystemEvidence>,
    #[serde(default)]
    pub service_calls: Vec<ServiceCallEvidence>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Stored evidence. Immutable once written except for the appended verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: String,
    pub task_id: String,
    /// Logical execution order within the task (1-based, gap-free).
    pub sequence: u64,
    pub kind: EvidenceKind,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub test_run: Option<TestRunEvidence>,
    #[serde(default)]
    pub files: Option<FileSystemEvidence>,
    #[serde(default)]
    pub service_calls: Vec<ServiceCallEvidence>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub verdict: Option<AuthenticityVerdict>,
}

impl EvidenceRecord {
    pub fn from_item(item: EvidenceItem, sequence: u64) -> Self {
        Self {
            id: format!("{}-{:04}", item.task_id, sequence),
            task_id: item.task_id,
            sequence,
            kind: item.kind,
            collected_at: item.collected_at,
            test_run: item.test_run,
            files: item.files,
            service_calls: item.service_calls,
            note: item.note,
            verdict: None,
        }
    }

    /// Failure record produced by the orchestrator itself (timeouts, gateway errors).
    pub fn failure(task_id: &str, sequence: u64, at: DateTime<Utc>, note: impl Into<String>) -> Self {
        Self {
            id: format!("{task_id}-{sequence:04}"),
            task_id: task_id.to_string(),
            sequence,
            kind: EvidenceKind::Failure,
            collected_at: Some(at),
            test_run: None,
            files: None,
            service_calls: Vec::new(),
            note: Some(note.into()),
            verdict: None,
        }
    }

    /// Every free-text field, for signature scanning.
    pub fn text_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(note) = &self.note {
            out.push(note.as_str());
        }
        if let Some(run) = &self.test_run {
            out.push(run.command.as_str());
            out.extend(run.expected.as_deref());
            out.extend(run.actual.as_deref());
        }
        for call in &self.service_calls {
            out.push(call.endpoint.as_str());
            out.extend(call.response_excerpt.as_deref());
        }
        if let Some(files) = &self.files {
            out.extend(files.created.iter().map(String::as_str));
            out.extend(files.modified.iter().map(String::as_str));
        }
        out
    }
}
