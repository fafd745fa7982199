//! Orchestrator-owned task transitions driven by ingested evidence.
//!
//! Only this module moves a task to `completed` or `failed`; decisions and
//! submitted evidence never set status directly.

use serde::Serialize;

use crate::core::error::StructuralError;
use crate::core::evidence::{AuthenticityVerdict, EvidenceKind, EvidenceRecord};
use crate::core::types::{TaskGraph, TaskStatus};

/// What ingesting one evidence batch did to its task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Authentic completion evidence with every requirement met.
    Completed,
    /// Authentic evidence that does not finish the task.
    Progress,
    /// Authentic completion claim with unmet requirements.
    Incomplete { unmet: Vec<String> },
    /// Evidence failed authenticity scoring.
    Rejected { score: f64, indicators: Vec<String> },
    /// The executor reported a failure.
    ReportedFailure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub task_id: String,
    pub outcome: IngestOutcome,
    pub failure_count: u32,
    /// Set when the failure bound was reached and the task is now `failed`.
    pub exhausted: bool,
}

impl IngestSummary {
    /// True when the task left `in_progress` for a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.exhausted || self.outcome == IngestOutcome::Completed
    }
}

/// Apply one verified evidence batch to `task_id`.
///
/// Rejection and reported failures count toward `max_failures`; reaching it
/// marks the task `failed`. Unmet requirements leave the count untouched.
pub fn apply_ingestion(
    graph: &mut TaskGraph,
    task_id: &str,
    batch: &[EvidenceRecord],
    verdict: &AuthenticityVerdict,
    unmet: &[String],
    max_failures: u32,
) -> Result<IngestSummary, StructuralError> {
    let task = graph
        .get_mut(task_id)
        .ok_or_else(|| StructuralError::UnknownTask(task_id.to_string()))?;

    let reported_failure = batch
        .iter()
        .find(|record| record.kind == EvidenceKind::Failure)
        .map(|record| {
            record
                .note
                .clone()
                .unwrap_or_else(|| format!("failure reported in '{}'", record.id))
        });
    let claims_completion = batch
        .iter()
        .any(|record| record.kind == EvidenceKind::Completion);

    let outcome = if !verdict.authentic {
        IngestOutcome::Rejected {
            score: verdict.score,
            indicators: verdict
                .indicators
                .iter()
                .map(|indicator| indicator.code.clone())
                .collect(),
        }
    } else if let Some(reason) = reported_failure {
        IngestOutcome::ReportedFailure { reason }
    } else if claims_completion && unmet.is_empty() {
        IngestOutcome::Completed
    } else if claims_completion {
        IngestOutcome::Incomplete {
            unmet: unmet.to_vec(),
        }
    } else {
        IngestOutcome::Progress
    };

    let mut exhausted = false;
    match &outcome {
        IngestOutcome::Completed => {
            task.status = TaskStatus::Completed;
            task.last_error = None;
            task.blocked_reason = None;
        }
        IngestOutcome::Progress => {}
        IngestOutcome::Incomplete { unmet } => {
            task.last_error = Some(format!("unmet evidence requirements: {}", unmet.join("; ")));
        }
        IngestOutcome::Rejected { score, indicators } => {
            task.failure_count += 1;
            task.last_error = Some(format!(
                "evidence rejected (score {score:.2}): {}",
                indicators.join(", ")
            ));
        }
        IngestOutcome::ReportedFailure { reason } => {
            task.failure_count += 1;
            task.last_error = Some(reason.clone());
        }
    }

    if task.status != TaskStatus::Completed && task.failure_count >= max_failures {
        task.status = TaskStatus::Failed;
        exhausted = true;
    }

    Ok(IngestSummary {
        task_id: task_id.to_string(),
        outcome,
        failure_count: task.failure_count,
        exhausted,
    })
}

/// Count a failure that produced no evidence batch (gateway error, timeout).
///
/// Returns true when the bound was reached and the task is now `failed`.
pub fn record_failure(
    graph: &mut TaskGraph,
    task_id: &str,
    reason: &str,
    max_failures: u32,
) -> Result<bool, StructuralError> {
    let task = graph
        .get_mut(task_id)
        .ok_or_else(|| StructuralError::UnknownTask(task_id.to_string()))?;
    task.failure_count += 1;
    task.last_error = Some(reason.to_string());
    if task.failure_count >= max_failures {
        task.status = TaskStatus::Failed;
        return Ok(true);
    }
    Ok(false)
}
