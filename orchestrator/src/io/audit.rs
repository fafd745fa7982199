//! Append-only JSONL audit trails under `.orchestrator/audit/`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One gateway dispatch attempt, or a request refused before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub request_id: String,
    pub operation: String,
    pub task_id: String,
    /// Zero when the request never reached the endpoint.
    pub attempt: u32,
    pub outcome: AuditOutcome,
    /// sha256 of the prompt; prompts themselves are not retained.
    pub prompt_digest: String,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Accepted,
    Malformed,
    Timeout,
    Transient,
    Fatal,
    PolicyViolation,
}

/// Destination for gateway audit entries.
pub trait AuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<()>;
}

/// File-backed audit log, one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlAudit {
    path: PathBuf,
}

impl JsonlAudit {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        read_jsonl(&self.path)
    }
}

impl AuditSink for JsonlAudit {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        append_jsonl(&self.path, entry)
    }
}

/// Append `value` as one line, creating the file and its parent as needed.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("serialize audit entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

pub fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).with_context(|| format!("parse {}", path.display())))
        .collect()
}

/// Cut `text` to at most `limit` bytes on a char boundary.
pub fn excerpt(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
