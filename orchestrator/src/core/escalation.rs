//! Escalation Coordinator: routes suspected planning-artifact defects to an
//! independent evaluator instead of letting the implementer edit locked
//! artifacts.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{OrchestratorError, SafetyLimit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictNature {
    /// The artifact states incompatible things.
    Contradictory,
    /// No implementation can satisfy the artifact.
    Unsatisfiable,
    /// Satisfiable but hard. Never escalated.
    Difficult,
}

impl ConflictNature {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictNature::Contradictory => "contradictory",
            ConflictNature::Unsatisfiable => "unsatisfiable",
            ConflictNature::Difficult => "difficult",
        }
    }
}

/// A conflict reported by an implementation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub task_id: String,
    pub artifact: String,
    #[serde(default)]
    pub artifact_locked: bool,
    pub nature: ConflictNature,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub contradiction: String,
    #[serde(default)]
    pub attempted_remedies: Vec<String>,
    #[serde(default)]
    pub blocked_impact: String,
}

/// Everything the independent evaluator sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidencePackage {
    pub id: String,
    pub task_id: String,
    pub artifact: String,
    pub excerpt: String,
    pub contradiction: String,
    pub attempted_remedies: Vec<String>,
    pub blocked_impact: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationDecision {
    pub escalate: bool,
    pub reason: String,
    pub package: Option<EvidencePackage>,
}

impl EscalationDecision {
    fn decline(reason: impl Into<String>) -> Self {
        Self {
            escalate: false,
            reason: reason.into(),
            package: None,
        }
    }
}

/// Decide whether `conflict` warrants independent re-evaluation.
///
/// Conflicts that qualify but arrive with the budget spent are
/// [`OrchestratorError::SafetyLimitExceeded`]; the session halts for review.
pub fn should_escalate(
    conflict: &Conflict,
    escalations_used: u32,
    budget: u32,
    now: DateTime<Utc>,
) -> Result<EscalationDecision, OrchestratorError> {
    if conflict.nature == ConflictNature::Difficult {
        return Ok(EscalationDecision::decline(
            "difficulty is not a specification defect",
        ));
    }
    if !conflict.artifact_locked {
        return Ok(EscalationDecision::decline(format!(
            "artifact '{}' is not locked; revise it in the normal loop",
            conflict.artifact
        )));
    }
    if conflict.contradiction.trim().is_empty() {
        return Ok(EscalationDecision::decline("no concrete contradiction given"));
    }
    if conflict.attempted_remedies.is_empty() {
        return Ok(EscalationDecision::decline("no attempted remedies given"));
    }
    if escalations_used >= budget {
        return Err(OrchestratorError::SafetyLimitExceeded {
            limit: SafetyLimit::Escalations,
            used: escalations_used,
            max: budget,
        });
    }

    let package = EvidencePackage {
        id: format!("esc-{}-{}", conflict.task_id, escalations_used + 1),
        task_id: conflict.task_id.clone(),
        artifact: conflict.artifact.clone(),
        excerpt: conflict.excerpt.clone(),
        contradiction: conflict.contradiction.clone(),
        attempted_remedies: conflict.attempted_remedies.clone(),
        blocked_impact: conflict.blocked_impact.clone(),
        created_at: now,
    };
    Ok(EscalationDecision {
        escalate: true,
        reason: format!(
            "locked artifact '{}' reported {}",
            conflict.artifact,
            conflict.nature.as_str()
        ),
        package: Some(package),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    ImplementationProblem,
    SpecificationDefect,
}

/// The independent evaluator's ruling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationVerdict {
    pub classification: Classification,
    pub rationale: String,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

/// Independent re-evaluation capability.
pub trait Evaluator {
    fn evaluate(&self, package: &EvidencePackage) -> Result<EscalationVerdict>;
}

/// A scoped, auditable change to one implicated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub package_id: String,
    pub task_id: String,
    pub artifact: String,
    pub revision: String,
    pub rationale: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    /// Back to the normal loop; the artifact stands.
    ReturnToLoop { rationale: String },
    Revise { revision: RevisionRecord },
    /// The verdict tried to revise something outside the package's scope.
    Rejected { reason: String },
}

/// Turn a verdict into a resolution scoped to the package's artifact.
pub fn resolve(
    package: &EvidencePackage,
    verdict: &EscalationVerdict,
    now: DateTime<Utc>,
) -> Resolution {
    match verdict.classification {
        Classification::ImplementationProblem => Resolution::ReturnToLoop {
            rationale: verdict.rationale.clone(),
        },
        Classification::SpecificationDefect => {
            let artifact = verdict.artifact.as_deref().unwrap_or(package.artifact.as_str());
            if artifact != package.artifact {
                return Resolution::Rejected {
                    reason: format!(
                        "revision targets '{artifact}' but only '{}' is implicated",
                        package.artifact
                    ),
                };
            }
            let revision = verdict.revision.as_deref().map(str::trim);
            let Some(revision) = revision.filter(|r| !r.is_empty()) else {
                return Resolution::Rejected {
                    reason: "specification defect without a revision".to_string(),
                };
            };
            Resolution::Revise {
                revision: RevisionRecord {
                    package_id: package.id.clone(),
                    task_id: package.task_id.clone(),
                    artifact: package.artifact.clone(),
                    revision: revision.to_string(),
                    rationale: verdict.rationale.clone(),
                    at: now,
                },
            }
        }
    }
}
