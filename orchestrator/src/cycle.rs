//! One bounded orchestration cycle per external trigger.
//!
//! load -> iteration limit -> service checks -> evidence ingestion ->
//! conflict handling -> scheduling -> context -> decision -> save.
//!
//! Nothing is kept in memory between cycles: every invocation reloads state
//! from the store and hands the mutated snapshot back before returning.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::core::context_pack::{ContextBundle, ContextSource, LoadMode, candidates, load_context};
use crate::core::decision::{Decision, ResponseKind};
use crate::core::error::{OrchestratorError, SafetyLimit};
use crate::core::escalation::{Conflict, Evaluator};
use crate::core::evidence::{EvidenceItem, EvidenceRecord};
use crate::core::manifest::ServiceCheck;
use crate::core::requirements::unmet_requirements;
use crate::core::selector::{BlockReason, ScheduleOutcome, refresh_statuses, schedule};
use crate::core::state_update::{IngestOutcome, IngestSummary, apply_ingestion, record_failure};
use crate::core::types::{ActiveTask, Snapshot, TaskStatus};
use crate::core::authenticity::{ValidationInput, Validator};
use crate::escalate::{EscalationReport, handle_conflict};
use crate::exit_codes;
use crate::io::audit::AuditSink;
use crate::io::config::load_config;
use crate::io::gateway::{Dispatcher, Gateway, GatewayRequest};
use crate::io::init::OrchestratorPaths;
use crate::io::prompt::{NextActionInputs, PromptEngine};
use crate::io::store::{LoadStatus, StateStore};

/// Operation name for instruction requests.
pub const NEXT_ACTION: &str = "next_action";

/// Structured input for one cycle. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trigger {
    pub trigger_id: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    /// Evidence collected while executing the active task's instruction.
    pub evidence: Vec<EvidenceItem>,
    pub conflict: Option<Conflict>,
    pub service_checks: Vec<ServiceCheck>,
}

/// Collaborators a cycle talks to.
#[derive(Clone, Copy)]
pub struct CycleDeps<'a> {
    pub dispatcher: &'a dyn Dispatcher,
    pub evaluator: &'a dyn Evaluator,
    pub audit: &'a dyn AuditSink,
    pub source: &'a dyn ContextSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMeta {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub iteration: u32,
    pub phase: u32,
    pub step: u32,
    pub state: LoadStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub state_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSummary {
    pub budget: usize,
    pub used: usize,
    pub full: usize,
    pub skeleton: usize,
    pub truncated: usize,
    pub dropped: usize,
    pub missing: usize,
}

impl From<&ContextBundle> for ContextSummary {
    fn from(bundle: &ContextBundle) -> Self {
        Self {
            budget: bundle.budget,
            used: bundle.used,
            full: bundle.count(LoadMode::Full),
            skeleton: bundle.count(LoadMode::Skeleton),
            truncated: bundle.count(LoadMode::Truncated),
            dropped: bundle.count(LoadMode::Dropped),
            missing: bundle.count(LoadMode::Missing),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Instruction for the external executor.
    Continue {
        task_id: String,
        request_id: String,
        /// Decision kind that produced the instruction.
        decision: String,
        instruction: String,
        actions: Vec<String>,
        attempts: u32,
        context: ContextSummary,
    },
    /// Nothing can proceed without intervention, or work is waiting.
    Blocked {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        class: String,
        reason: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        needs: Vec<String>,
    },
    Complete { summary: String },
}

/// Structured output of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub meta: ReportMeta,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

impl CycleReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            CycleOutcome::Continue { .. } => exit_codes::OK,
            CycleOutcome::Blocked { .. } => exit_codes::BLOCKED,
            CycleOutcome::Complete { .. } => exit_codes::COMPLETE,
        }
    }
}

/// Exit code for a failed cycle.
pub fn error_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<OrchestratorError>() {
        Some(classified) if classified.is_session_level() => exit_codes::HALTED,
        _ => exit_codes::INVALID,
    }
}

fn blocked(task_id: Option<&str>, class: &str, reason: impl Into<String>) -> CycleOutcome {
    CycleOutcome::Blocked {
        task_id: task_id.map(str::to_string),
        class: class.to_string(),
        reason: reason.into(),
        needs: Vec::new(),
    }
}

struct Cycle<'a> {
    root: &'a Path,
    paths: OrchestratorPaths,
    config: OrchestratorConfig,
    store: StateStore,
    snapshot: Snapshot,
    meta: ReportMeta,
    deps: CycleDeps<'a>,
}

/// Run one cycle for the project at `root`.
///
/// Session-level failures (structural graph errors, exhausted safety limits)
/// halt the session, persist it, and return the classified error. A halted
/// session is refused without touching state until it is resumed.
#[instrument(skip_all, fields(root = %root.display(), trigger = trigger.trigger_id.as_deref().unwrap_or("-")))]
pub fn run_cycle(root: &Path, trigger: &Trigger, deps: &CycleDeps<'_>) -> Result<CycleReport> {
    let paths = OrchestratorPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let store = StateStore::new(paths.clone(), config.clone());
    let loaded = store.load().context("load state")?;
    if loaded.status != LoadStatus::Clean {
        warn!(status = ?loaded.status, actions = loaded.actions.len(), "state was not clean");
    }

    if let Some(halt) = &loaded.snapshot.session.halted {
        warn!(class = %halt.class, at = %halt.at, "session is halted; refusing to run");
        return Err(OrchestratorError::Halted {
            class: halt.class.clone(),
            reason: halt.reason.clone(),
        }
        .into());
    }

    let mut snapshot = loaded.snapshot;
    snapshot.session.unblock();
    snapshot.session.config = config.clone();
    let meta = ReportMeta {
        session_id: snapshot.session.id.clone(),
        trigger_id: trigger.trigger_id.clone(),
        iteration: snapshot.session.iteration,
        phase: snapshot.session.phase,
        step: snapshot.session.step,
        state: loaded.status,
        state_actions: loaded.actions,
        ingest: None,
        escalation: None,
    };
    let mut cycle = Cycle {
        root,
        paths,
        config,
        store,
        snapshot,
        meta,
        deps: *deps,
    };
    cycle.run(trigger)
}

impl Cycle<'_> {
    fn run(&mut self, trigger: &Trigger) -> Result<CycleReport> {
        if self.meta.state == LoadStatus::Recovered && self.snapshot.tasks.tasks.is_empty() {
            // Recovery fell back to a fresh session; the stored documents stay
            // untouched for the operator.
            let reason = "state was recovered without a task graph; restore a backup or re-plan";
            warn!(actions = ?self.meta.state_actions, "{reason}");
            return Ok(self.report(blocked(None, "state_recovered", reason)));
        }

        let used = self.snapshot.session.iteration;
        if used >= self.config.max_iterations {
            return self.halt(OrchestratorError::SafetyLimitExceeded {
                limit: SafetyLimit::Iterations,
                used,
                max: self.config.max_iterations,
            });
        }
        self.snapshot.session.iteration = used + 1;
        self.meta.iteration = used + 1;
        if let Some(received_at) = trigger.received_at {
            debug!(%received_at, "trigger received");
        }
        let deadline = Instant::now() + Duration::from_secs(self.config.cycle_timeout_secs);
        let now = Utc::now();

        for check in &trigger.service_checks {
            debug!(service = %check.service, ok = check.ok, "applying service check");
            self.snapshot.manifest.apply_check(check);
        }

        if let Some(summary) = self.ingest(&trigger.evidence, now)? {
            let exhausted = summary.exhausted;
            let task_id = summary.task_id.clone();
            self.meta.ingest = Some(summary);
            if exhausted {
                let reason = format!(
                    "task '{task_id}' failed after {} attempt(s); plan review required",
                    self.config.max_task_failures
                );
                self.snapshot.session.block(reason.clone());
                return self.finish(blocked(Some(&task_id), "task_failed", reason));
            }
        }

        let mut guidance = None;
        if let Some(conflict) = &trigger.conflict {
            let report = match handle_conflict(
                conflict,
                &mut self.snapshot.session,
                self.config.escalation.budget,
                self.deps.evaluator,
                &self.paths.escalation_audit_path,
                now,
            ) {
                Ok(report) => report,
                Err(err) => return self.fail(err),
            };
            guidance = report.guidance().map(|text| (report.task_id.clone(), text));
            self.meta.escalation = Some(report);
        }

        let task_id = match self.schedule()? {
            Ok(task_id) => task_id,
            Err(outcome) => return self.finish(outcome),
        };
        let guidance = guidance
            .filter(|(conflict_task, _)| *conflict_task == task_id)
            .map(|(_, text)| text);
        self.dispatch(&task_id, guidance.as_deref(), deadline)
    }

    /// Verify and record evidence for the active task.
    fn ingest(&mut self, items: &[EvidenceItem], now: DateTime<Utc>) -> Result<Option<IngestSummary>> {
        if items.is_empty() {
            return Ok(None);
        }
        let Some(active) = self.snapshot.session.active.clone() else {
            warn!(items = items.len(), "evidence received with no active task; ignoring");
            return Ok(None);
        };
        let (accepted, ignored): (Vec<&EvidenceItem>, Vec<&EvidenceItem>) = items
            .iter()
            .partition(|item| item.task_id == active.task_id);
        for item in ignored {
            warn!(task_id = %item.task_id, active = %active.task_id, "ignoring evidence for inactive task");
        }
        if accepted.is_empty() {
            return Ok(None);
        }

        let task_id = active.task_id.as_str();
        let prior = self.store.read_evidence(task_id)?;
        let chain = self.store.read_chain(task_id)?;
        let mut next = prior.last().map_or(1, |record| record.sequence + 1);
        let mut records: Vec<EvidenceRecord> = accepted
            .into_iter()
            .map(|item| {
                let record = EvidenceRecord::from_item(item.clone(), next);
                next += 1;
                record
            })
            .collect();

        let validator = Validator::from_settings(&self.config.validator)?;
        let verdict = validator.validate(&ValidationInput {
            items: &records,
            prior: &prior,
            chain: &chain,
            dispatched_at: Some(active.dispatched_at),
            now,
        });
        info!(
            task_id,
            authentic = verdict.authentic,
            score = verdict.score,
            indicators = verdict.indicators.len(),
            "evidence validated"
        );
        for record in &mut records {
            record.verdict = Some(verdict.clone());
        }
        self.store.append_evidence(task_id, &records)?;

        let task = self
            .snapshot
            .tasks
            .get(task_id)
            .ok_or_else(|| anyhow!("active task '{task_id}' missing from graph"))?;
        let counted: Vec<&EvidenceRecord> = prior
            .iter()
            .chain(records.iter())
            .filter(|record| record.verdict.as_ref().is_some_and(|v| v.authentic))
            .collect();
        let root = self.root;
        let unmet = unmet_requirements(task, &counted, |path| root.join(path).exists());

        let summary = apply_ingestion(
            &mut self.snapshot.tasks,
            task_id,
            &records,
            &verdict,
            &unmet,
            self.config.max_task_failures,
        )
        .map_err(OrchestratorError::from)?;
        if summary.is_terminal() {
            self.snapshot.session.active = None;
        }
        if summary.outcome == IngestOutcome::Completed {
            self.snapshot.session.step += 1;
            info!(task_id, "task completed");
        }
        Ok(Some(summary))
    }

    /// Pick the task to work on, advancing phases as they complete. The
    /// inner `Err` is a terminal outcome for this cycle.
    fn schedule(&mut self) -> Result<Result<String, CycleOutcome>> {
        if self.snapshot.tasks.tasks.is_empty() {
            let reason = "task graph is empty; nothing has been planned".to_string();
            self.snapshot.session.block(reason.clone());
            return Ok(Err(blocked(None, "empty_graph", reason)));
        }
        refresh_statuses(&mut self.snapshot.tasks, &self.snapshot.manifest);
        loop {
            let outcome = match schedule(
                &self.snapshot.tasks,
                &self.snapshot.manifest,
                self.snapshot.session.phase,
            ) {
                Ok(outcome) => outcome,
                Err(err) => return self.halt(OrchestratorError::Structural(err)),
            };
            debug!(outcome = ?outcome, "scheduled");
            match outcome {
                ScheduleOutcome::Resume(task_id) => return Ok(Ok(task_id)),
                ScheduleOutcome::Selected(task_id) => {
                    if let Some(task) = self.snapshot.tasks.get_mut(&task_id) {
                        task.status = TaskStatus::InProgress;
                        task.blocked_reason = None;
                    }
                    return Ok(Ok(task_id));
                }
                ScheduleOutcome::PhaseComplete { completed, next } => {
                    info!(completed, next, "phase complete");
                    self.snapshot.session.phase = next;
                    self.snapshot.session.step = 0;
                    refresh_statuses(&mut self.snapshot.tasks, &self.snapshot.manifest);
                }
                ScheduleOutcome::AllComplete => {
                    let summary = format!(
                        "all {} task(s) completed",
                        self.snapshot.tasks.tasks.len()
                    );
                    return Ok(Err(CycleOutcome::Complete { summary }));
                }
                ScheduleOutcome::Blocked(reason) => {
                    let class = match &reason {
                        BlockReason::UnavailableServices { services, .. } => {
                            OrchestratorError::ExternalDependency {
                                services: services.clone(),
                            }
                            .class()
                        }
                        BlockReason::FailedDependencies { .. } => "failed_dependencies",
                    };
                    let description = reason.describe();
                    warn!(reason = %description, "session blocked");
                    self.snapshot.session.block(description.clone());
                    return Ok(Err(blocked(None, class, description)));
                }
                ScheduleOutcome::Waiting { tasks } => {
                    return Ok(Err(blocked(
                        None,
                        "waiting",
                        format!("waiting on prerequisites of [{}]", tasks.join(", ")),
                    )));
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        task_id: &str,
        guidance: Option<&str>,
        deadline: Instant,
    ) -> Result<CycleReport> {
        let task = self
            .snapshot
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| anyhow!("scheduled task '{task_id}' missing from graph"))?;

        let ranked = candidates(
            &task,
            &self.snapshot.xref,
            self.config.context.hop_depth,
            self.deps.source,
        );
        let bundle = match load_context(&task, &ranked, &self.config.context, self.deps.source) {
            Ok(bundle) => bundle,
            Err(err) => {
                warn!(task_id, err = %err, "context does not fit");
                self.task_failure(task_id, &err.to_string())?;
                return self.finish(blocked(Some(task_id), err.class(), err.to_string()));
            }
        };
        debug!(task_id, used = bundle.used, budget = bundle.budget, "context loaded");

        let ingest = self
            .meta
            .ingest
            .as_ref()
            .filter(|summary| summary.task_id == task_id);
        let prompt = PromptEngine::new().render_next_action(&NextActionInputs {
            session: &self.snapshot.session,
            task: &task,
            bundle: &bundle,
            guidance,
            ingest,
        })?;

        let gateway = Gateway::new(self.deps.dispatcher, self.deps.audit, &self.config.gateway)?;
        let response = match gateway.execute::<Decision>(&GatewayRequest {
            operation: NEXT_ACTION.to_string(),
            task_id: task_id.to_string(),
            prompt,
            expected: ResponseKind::Decision,
            deadline,
        }) {
            Ok(response) => response,
            Err(err) => {
                let classified = OrchestratorError::Gateway(err);
                warn!(task_id, err = %classified, "no decision this cycle");
                let next = self
                    .store
                    .read_evidence(task_id)?
                    .last()
                    .map_or(1, |record| record.sequence + 1);
                let failure =
                    EvidenceRecord::failure(task_id, next, Utc::now(), classified.to_string());
                self.store.append_evidence(task_id, &[failure])?;
                self.task_failure(task_id, &classified.to_string())?;
                return self.finish(blocked(
                    Some(task_id),
                    classified.class(),
                    classified.to_string(),
                ));
            }
        };
        info!(
            task_id,
            decision = response.value.kind(),
            attempts = response.attempts,
            "decision received"
        );

        let context = ContextSummary::from(&bundle);
        let decision = response.value.kind();
        let (instruction, actions) = match response.value {
            Decision::Continue {
                instruction,
                actions,
            } => (instruction, actions),
            Decision::Complete { summary } => (
                format!("Collect and submit completion evidence for '{task_id}': {summary}"),
                Vec::new(),
            ),
            Decision::Block { reason, needs } => {
                if let Some(task) = self.snapshot.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Blocked;
                    task.blocked_reason = Some(reason.clone());
                }
                self.clear_active(task_id);
                self.snapshot
                    .session
                    .block(format!("task '{task_id}' blocked: {reason}"));
                return self.finish(CycleOutcome::Blocked {
                    task_id: Some(task_id.to_string()),
                    class: "decision".to_string(),
                    reason,
                    needs,
                });
            }
        };

        self.snapshot.session.active = Some(ActiveTask {
            task_id: task_id.to_string(),
            request_id: response.request_id.clone(),
            dispatched_at: response.dispatched_at,
        });
        self.finish(CycleOutcome::Continue {
            task_id: task_id.to_string(),
            request_id: response.request_id,
            decision: decision.to_string(),
            instruction,
            actions,
            attempts: response.attempts,
            context,
        })
    }

    /// Count a failure that produced no decision; the task goes back to the
    /// pool unless it exhausted its failures.
    fn task_failure(&mut self, task_id: &str, reason: &str) -> Result<()> {
        let exhausted = record_failure(
            &mut self.snapshot.tasks,
            task_id,
            reason,
            self.config.max_task_failures,
        )
        .map_err(OrchestratorError::from)?;
        self.clear_active(task_id);
        if !exhausted {
            if let Some(task) = self.snapshot.tasks.get_mut(task_id) {
                task.status = TaskStatus::Pending;
            }
        } else {
            self.snapshot.session.block(format!(
                "task '{task_id}' failed after {} attempt(s): {reason}",
                self.config.max_task_failures
            ));
        }
        Ok(())
    }

    fn clear_active(&mut self, task_id: &str) {
        if self
            .snapshot
            .session
            .active
            .as_ref()
            .is_some_and(|active| active.task_id == task_id)
        {
            self.snapshot.session.active = None;
        }
    }

    fn finish(&mut self, outcome: CycleOutcome) -> Result<CycleReport> {
        self.store.save(&self.snapshot).context("save state")?;
        Ok(self.report(outcome))
    }

    fn report(&mut self, outcome: CycleOutcome) -> CycleReport {
        self.meta.phase = self.snapshot.session.phase;
        self.meta.step = self.snapshot.session.step;
        CycleReport {
            meta: self.meta.clone(),
            outcome,
        }
    }

    /// Halt the session on a session-level error, persist, and surface it.
    fn halt<T>(&mut self, err: OrchestratorError) -> Result<T> {
        warn!(class = err.class(), err = %err, "halting session");
        self.snapshot
            .session
            .halt(err.class(), err.to_string(), Utc::now());
        self.store.save(&self.snapshot).context("save halted state")?;
        Err(err.into())
    }

    fn fail<T>(&mut self, err: anyhow::Error) -> Result<T> {
        match err.downcast::<OrchestratorError>() {
            Ok(classified) if classified.is_session_level() => self.halt(classified),
            Ok(classified) => Err(classified.into()),
            Err(err) => Err(err),
        }
    }
}
