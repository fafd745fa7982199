//! Prompt rendering for gateway operations.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::context_pack::{ContextBundle, LoadMode};
use crate::core::decision::ResponseKind;
use crate::core::escalation::EvidencePackage;
use crate::core::state_update::IngestSummary;
use crate::core::types::{Session, Task};

const NEXT_ACTION_TEMPLATE: &str = include_str!("prompts/next_action.md");
const ESCALATION_REVIEW_TEMPLATE: &str = include_str!("prompts/escalation_review.md");

/// Everything the `next_action` prompt shows the decision endpoint.
#[derive(Debug, Clone, Copy)]
pub struct NextActionInputs<'a> {
    pub session: &'a Session,
    pub task: &'a Task,
    pub bundle: &'a ContextBundle,
    /// Outcome of this cycle's escalation, if one ran.
    pub guidance: Option<&'a str>,
    /// Outcome of this cycle's evidence ingestion for the task.
    pub ingest: Option<&'a IngestSummary>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("next_action", NEXT_ACTION_TEMPLATE)
            .expect("next_action template should be valid");
        env.add_template("escalation_review", ESCALATION_REVIEW_TEMPLATE)
            .expect("escalation_review template should be valid");
        Self { env }
    }

    pub fn render_next_action(&self, input: &NextActionInputs<'_>) -> Result<String> {
        let files: Vec<_> = input.bundle.loaded().collect();
        let omitted: Vec<&str> = input
            .bundle
            .files
            .iter()
            .filter(|file| matches!(file.mode, LoadMode::Dropped | LoadMode::Missing))
            .map(|file| file.path.as_str())
            .collect();
        let evidence = &input.task.evidence;
        let requirements: Vec<&str> = [
            (evidence.test_pass, "passing test run"),
            (evidence.file_existence, "target files exist"),
            (evidence.external_validation, "validated service call"),
            (evidence.integration_proof, "integration proof"),
        ]
        .into_iter()
        .filter_map(|(required, label)| required.then_some(label))
        .collect();

        let template = self.env.get_template("next_action")?;
        let rendered = template.render(context! {
            session_id => input.session.id,
            phase => input.session.phase,
            step => input.session.step,
            iteration => input.session.iteration,
            task => input.task,
            requirements => requirements,
            ingest => input.ingest,
            guidance => input.guidance.map(str::trim).filter(|s| !s.is_empty()),
            used => input.bundle.used,
            budget => input.bundle.budget,
            files => files,
            omitted => omitted,
            schema => ResponseKind::Decision.schema().trim(),
        })?;
        Ok(rendered)
    }

    pub fn render_escalation_review(&self, package: &EvidencePackage) -> Result<String> {
        let template = self.env.get_template("escalation_review")?;
        let rendered = template.render(context! {
            package => package,
            schema => ResponseKind::EscalationVerdict.schema().trim(),
        })?;
        Ok(rendered)
    }
}
