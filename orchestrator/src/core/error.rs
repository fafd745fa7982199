//! Classified failures surfaced by the orchestration core.
//!
//! These travel inside `anyhow::Error` and are recovered with `downcast_ref` by
//! the cycle and the CLI. Session-level classes (`Structural`,
//! `SafetyLimitExceeded`, `Halted`) abort the cycle; the rest are handled by
//! degrading the current task.

use std::time::Duration;

use thiserror::Error;

/// Structural defects in the task graph. Never auto-retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency { task: String, dependency: String },
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
    #[error("unknown task '{0}'")]
    UnknownTask(String),
}

/// Failures of the Decision Gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("security policy violation: {reason}")]
    PolicyViolation { reason: String },
    #[error("decision call timed out after {attempts} attempt(s) (per-call timeout {timeout:?})")]
    Timeout { attempts: u32, timeout: Duration },
    #[error("malformed decision response after {attempts} attempt(s)")]
    MalformedResponse { attempts: u32, raw: String },
    #[error("decision call failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("decision endpoint unusable: {0}")]
    Fatal(String),
    #[error("cycle deadline exceeded before dispatch")]
    DeadlineExceeded,
}

/// The error taxonomy of the orchestration core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("structural error: {0}")]
    Structural(#[from] StructuralError),
    #[error("state consistency error: {}", violations.join("; "))]
    StateConsistency { violations: Vec<String> },
    #[error("external dependency unavailable: {}", services.join(", "))]
    ExternalDependency { services: Vec<String> },
    #[error("context budget exceeded for task '{task}': {detail}")]
    ContextBudget { task: String, detail: String },
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("authenticity failure for task '{task}': score {score:.3}, {indicators} indicator(s)")]
    Authenticity {
        task: String,
        score: f64,
        indicators: usize,
    },
    #[error("safety limit exceeded: {limit} ({used}/{max})")]
    SafetyLimitExceeded {
        limit: SafetyLimit,
        used: u32,
        max: u32,
    },
    #[error("session halted ({class}): {reason}; run `orchestrator resume` after review")]
    Halted { class: String, reason: String },
}

/// Budgets whose exhaustion halts the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyLimit {
    Iterations,
    Escalations,
}

impl std::fmt::Display for SafetyLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyLimit::Iterations => f.write_str("iteration budget"),
            SafetyLimit::Escalations => f.write_str("escalation budget"),
        }
    }
}

impl OrchestratorError {
    /// Session-level errors abort the cycle and halt the session.
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Structural(_)
                | OrchestratorError::SafetyLimitExceeded { .. }
                | OrchestratorError::Halted { .. }
        )
    }

    /// Stable classification label used in reports and logs.
    pub fn class(&self) -> &'static str {
        match self {
            OrchestratorError::Structural(_) => "structural",
            OrchestratorError::StateConsistency { .. } => "state_consistency",
            OrchestratorError::ExternalDependency { .. } => "external_dependency",
            OrchestratorError::ContextBudget { .. } => "context_budget",
            OrchestratorError::Gateway(_) => "gateway",
            OrchestratorError::Authenticity { .. } => "authenticity",
            OrchestratorError::SafetyLimitExceeded { .. } => "safety_limit_exceeded",
            OrchestratorError::Halted { .. } => "halted",
        }
    }
}
