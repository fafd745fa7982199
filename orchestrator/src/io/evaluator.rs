//! Gateway-backed independent evaluator for escalations.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::config::GatewaySettings;
use crate::core::decision::ResponseKind;
use crate::core::escalation::{EscalationVerdict, Evaluator, EvidencePackage};
use crate::io::audit::AuditSink;
use crate::io::gateway::{Dispatcher, Gateway, GatewayRequest};
use crate::io::prompt::PromptEngine;

/// Operation name the security policy must allow for reviews.
pub const ESCALATION_REVIEW: &str = "escalation_review";

/// Routes packages through their own dispatcher so the reviewer never shares
/// a session with the implementer.
pub struct GatewayEvaluator<'a> {
    gateway: Gateway<'a>,
    prompts: PromptEngine,
    deadline: Instant,
}

impl<'a> GatewayEvaluator<'a> {
    pub fn new(
        dispatcher: &'a dyn Dispatcher,
        audit: &'a dyn AuditSink,
        settings: &GatewaySettings,
        deadline: Instant,
    ) -> Result<Self> {
        Ok(Self {
            gateway: Gateway::new(dispatcher, audit, settings)?,
            prompts: PromptEngine::new(),
            deadline,
        })
    }

    /// Evaluator bounded by `budget` from now instead of a cycle deadline.
    pub fn with_budget(
        dispatcher: &'a dyn Dispatcher,
        audit: &'a dyn AuditSink,
        settings: &GatewaySettings,
        budget: Duration,
    ) -> Result<Self> {
        Self::new(dispatcher, audit, settings, Instant::now() + budget)
    }
}

impl Evaluator for GatewayEvaluator<'_> {
    #[instrument(skip_all, fields(package = %package.id, artifact = %package.artifact))]
    fn evaluate(&self, package: &EvidencePackage) -> Result<EscalationVerdict> {
        let prompt = self.prompts.render_escalation_review(package)?;
        let response = self
            .gateway
            .execute::<EscalationVerdict>(&GatewayRequest {
                operation: ESCALATION_REVIEW.to_string(),
                task_id: package.task_id.clone(),
                prompt,
                expected: ResponseKind::EscalationVerdict,
                deadline: self.deadline,
            })
            .with_context(|| format!("evaluate escalation {}", package.id))?;
        info!(
            classification = ?response.value.classification,
            attempts = response.attempts,
            "escalation evaluated"
        );
        Ok(response.value)
    }
}
