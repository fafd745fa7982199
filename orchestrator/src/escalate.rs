//! Conflict handling for a cycle: decide, evaluate, resolve, and log.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::escalation::{
    Conflict, EscalationVerdict, Evaluator, EvidencePackage, Resolution, should_escalate,
};
use crate::core::types::Session;
use crate::io::audit::append_jsonl;

/// One line of `audit/escalations.jsonl`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EscalationEvent<'a> {
    Declined {
        at: DateTime<Utc>,
        task_id: &'a str,
        artifact: &'a str,
        reason: &'a str,
    },
    Package {
        at: DateTime<Utc>,
        package: &'a EvidencePackage,
    },
    Verdict {
        at: DateTime<Utc>,
        package_id: &'a str,
        verdict: &'a EscalationVerdict,
    },
    Resolution {
        at: DateTime<Utc>,
        package_id: &'a str,
        resolution: &'a Resolution,
    },
    EvaluationFailed {
        at: DateTime<Utc>,
        package_id: &'a str,
        error: &'a str,
    },
}

/// What the cycle reports about a conflict it received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationReport {
    pub task_id: String,
    pub escalated: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EscalationReport {
    /// Text handed to the next instruction prompt for the conflicting task.
    pub fn guidance(&self) -> Option<String> {
        match &self.resolution {
            Some(Resolution::ReturnToLoop { rationale }) => Some(format!(
                "An independent review found no defect in the artifact; it stands. {rationale}"
            )),
            Some(Resolution::Revise { revision }) => Some(format!(
                "An independent review confirmed a defect in '{}'. Apply this revision and nothing else: {}",
                revision.artifact, revision.revision
            )),
            Some(Resolution::Rejected { reason }) => Some(format!(
                "The escalation was not accepted ({reason}); the artifact stands."
            )),
            None if !self.escalated => Some(format!("Conflict not escalated: {}.", self.reason)),
            None => None,
        }
    }
}

/// Route `conflict` through the escalation policy.
///
/// Consumes one unit of `session.escalations_used` per package sent to the
/// evaluator. A spent budget surfaces as a session-level error. Evaluator
/// failures are logged and reported; the cycle carries on without guidance.
#[instrument(skip_all, fields(task_id = %conflict.task_id, artifact = %conflict.artifact))]
pub fn handle_conflict(
    conflict: &Conflict,
    session: &mut Session,
    budget: u32,
    evaluator: &dyn Evaluator,
    log_path: &Path,
    now: DateTime<Utc>,
) -> Result<EscalationReport> {
    let decision = should_escalate(conflict, session.escalations_used, budget, now)?;
    let Some(package) = decision.package else {
        info!(reason = %decision.reason, "conflict not escalated");
        append_jsonl(
            log_path,
            &EscalationEvent::Declined {
                at: now,
                task_id: &conflict.task_id,
                artifact: &conflict.artifact,
                reason: &decision.reason,
            },
        )?;
        return Ok(EscalationReport {
            task_id: conflict.task_id.clone(),
            escalated: false,
            reason: decision.reason,
            package_id: None,
            resolution: None,
            error: None,
        });
    };

    session.escalations_used += 1;
    info!(
        package = %package.id,
        used = session.escalations_used,
        budget,
        "escalating conflict"
    );
    append_jsonl(
        log_path,
        &EscalationEvent::Package {
            at: now,
            package: &package,
        },
    )?;

    let mut report = EscalationReport {
        task_id: conflict.task_id.clone(),
        escalated: true,
        reason: decision.reason,
        package_id: Some(package.id.clone()),
        resolution: None,
        error: None,
    };

    let verdict = match evaluator.evaluate(&package) {
        Ok(verdict) => verdict,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(err = %message, "escalation evaluation failed");
            append_jsonl(
                log_path,
                &EscalationEvent::EvaluationFailed {
                    at: Utc::now(),
                    package_id: &package.id,
                    error: &message,
                },
            )?;
            report.error = Some(message);
            return Ok(report);
        }
    };
    append_jsonl(
        log_path,
        &EscalationEvent::Verdict {
            at: Utc::now(),
            package_id: &package.id,
            verdict: &verdict,
        },
    )?;

    let resolution = crate::core::escalation::resolve(&package, &verdict, Utc::now());
    append_jsonl(
        log_path,
        &EscalationEvent::Resolution {
            at: Utc::now(),
            package_id: &package.id,
            resolution: &resolution,
        },
    )?;
    report.resolution = Some(resolution);
    Ok(report)
}
