//! Decision Gateway: the only path to the decision-making endpoint.
//!
//! A request passes the security policy, then is dispatched with a hard
//! per-call timeout capped by the cycle deadline. Timeouts, transient
//! failures, and malformed responses are retried with exponential backoff up
//! to `max_attempts` total attempts. Every attempt is audited.

use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::GatewaySettings;
use crate::core::budget::call_timeout;
use crate::core::decision::{Extraction, ResponseKind, parse_response};
use crate::core::error::GatewayError;
use crate::core::policy::SecurityPolicy;
use crate::io::audit::{AuditEntry, AuditOutcome, AuditSink, excerpt};
use crate::io::process::run_command_with_timeout;

/// One isolated call to the endpoint.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: String,
    pub operation: String,
    pub attempt: u32,
    pub prompt: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("endpoint timed out")]
    Timeout,
    /// Worth retrying.
    #[error("transient endpoint failure: {0}")]
    Transient(String),
    /// Retrying cannot help (e.g. the endpoint cannot be started).
    #[error("fatal endpoint failure: {0}")]
    Fatal(String),
}

/// Transport to the decision endpoint. Returns the raw response text.
pub trait Dispatcher {
    fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError>;
}

/// Dispatcher that runs a command with the prompt on stdin and reads the
/// response from stdout.
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    command: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
}

impl ProcessDispatcher {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            output_limit_bytes,
        }
    }
}

impl Dispatcher for ProcessDispatcher {
    #[instrument(skip_all, fields(request_id = %request.request_id, attempt = request.attempt))]
    fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(DispatchError::Fatal("gateway command is empty".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("ORCHESTRATOR_OPERATION", &request.operation)
            .env("ORCHESTRATOR_REQUEST_ID", &request.request_id);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| DispatchError::Fatal(format!("{err:#}")))?;

        if output.timed_out {
            return Err(DispatchError::Timeout);
        }
        if !output.status.success() {
            return Err(DispatchError::Transient(format!(
                "exit status {:?}: {}",
                output.status.code(),
                output.stderr_summary()
            )));
        }
        Ok(output.stdout_text())
    }
}

/// What the cycle asks of the gateway.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub operation: String,
    pub task_id: String,
    pub prompt: String,
    pub expected: ResponseKind,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct GatewayResponse<T> {
    pub request_id: String,
    pub value: T,
    pub strategy: Extraction,
    pub attempts: u32,
    pub elapsed: Duration,
    /// When the accepted attempt was dispatched.
    pub dispatched_at: DateTime<Utc>,
}

enum Failure {
    Timeout(Duration),
    Transient(String),
    Malformed(String),
}

pub struct Gateway<'a> {
    dispatcher: &'a dyn Dispatcher,
    audit: &'a dyn AuditSink,
    policy: SecurityPolicy,
    settings: GatewaySettings,
}

impl<'a> Gateway<'a> {
    pub fn new(
        dispatcher: &'a dyn Dispatcher,
        audit: &'a dyn AuditSink,
        settings: &GatewaySettings,
    ) -> Result<Self> {
        Ok(Self {
            dispatcher,
            audit,
            policy: SecurityPolicy::from_settings(settings)?,
            settings: settings.clone(),
        })
    }

    /// Dispatch `request` and recover a schema-valid `T` from the response.
    #[instrument(skip_all, fields(operation = %request.operation, task_id = %request.task_id))]
    pub fn execute<T: DeserializeOwned>(
        &self,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse<T>, GatewayError> {
        let started = Instant::now();
        let prompt_digest = sha256_hex(request.prompt.as_bytes());
        let request_id = request_id(request, &prompt_digest, Utc::now());
        let entry = |attempt: u32, outcome: AuditOutcome| AuditEntry {
            at: Utc::now(),
            request_id: request_id.clone(),
            operation: request.operation.clone(),
            task_id: request.task_id.clone(),
            attempt,
            outcome,
            prompt_digest: prompt_digest.clone(),
            elapsed_ms: elapsed_ms(started),
            response_excerpt: None,
            error: None,
        };

        if let Err(err) = self.policy.check(&request.operation, &request.prompt) {
            warn!(err = %err, "request refused by security policy");
            self.record(&AuditEntry {
                error: Some(err.to_string()),
                ..entry(0, AuditOutcome::PolicyViolation)
            })?;
            return Err(err);
        }

        let max_attempts = self.settings.max_attempts;
        let per_call = Duration::from_secs(self.settings.call_timeout_secs);
        let mut last_failure = None;
        for attempt in 1..=max_attempts {
            let timeout = match call_timeout(request.deadline, per_call) {
                Ok(timeout) => timeout,
                Err(err) if last_failure.is_none() => return Err(err),
                Err(_) => break,
            };
            let dispatched_at = Utc::now();
            let dispatch = DispatchRequest {
                request_id: request_id.clone(),
                operation: request.operation.clone(),
                attempt,
                prompt: request.prompt.clone(),
                timeout,
            };
            let attempt_started = Instant::now();
            let result = self.dispatcher.dispatch(&dispatch);
            info!(
                attempt,
                max_attempts,
                elapsed_ms = elapsed_ms(started),
                call_ms = elapsed_ms(attempt_started),
                ok = result.is_ok(),
                "gateway attempt finished"
            );

            let failure = match result {
                Ok(raw) => match parse_response::<T>(&raw, request.expected) {
                    Ok(parsed) => {
                        self.record(&AuditEntry {
                            response_excerpt: Some(self.excerpt(&raw)),
                            ..entry(attempt, AuditOutcome::Accepted)
                        })?;
                        debug!(strategy = ?parsed.strategy, "response accepted");
                        return Ok(GatewayResponse {
                            request_id: request_id.clone(),
                            value: parsed.value,
                            strategy: parsed.strategy,
                            attempts: attempt,
                            elapsed: started.elapsed(),
                            dispatched_at,
                        });
                    }
                    Err(reasons) => {
                        warn!(attempt, reasons = reasons.len(), "malformed response");
                        self.record(&AuditEntry {
                            response_excerpt: Some(self.excerpt(&raw)),
                            error: Some(reasons.join("; ")),
                            ..entry(attempt, AuditOutcome::Malformed)
                        })?;
                        Failure::Malformed(raw)
                    }
                },
                Err(DispatchError::Timeout) => {
                    warn!(attempt, timeout_ms = timeout.as_millis() as u64, "gateway call timed out");
                    self.record(&AuditEntry {
                        error: Some(format!("timed out after {timeout:?}")),
                        ..entry(attempt, AuditOutcome::Timeout)
                    })?;
                    Failure::Timeout(timeout)
                }
                Err(DispatchError::Transient(message)) => {
                    warn!(attempt, err = %message, "transient gateway failure");
                    self.record(&AuditEntry {
                        error: Some(message.clone()),
                        ..entry(attempt, AuditOutcome::Transient)
                    })?;
                    Failure::Transient(message)
                }
                Err(DispatchError::Fatal(message)) => {
                    warn!(attempt, err = %message, "fatal gateway failure");
                    self.record(&AuditEntry {
                        error: Some(message.clone()),
                        ..entry(attempt, AuditOutcome::Fatal)
                    })?;
                    return Err(GatewayError::Fatal(message));
                }
            };
            last_failure = Some((attempt, failure));

            if attempt < max_attempts {
                let delay = self.backoff(attempt);
                let remaining = request
                    .deadline
                    .checked_duration_since(Instant::now())
                    .unwrap_or_default();
                if delay >= remaining {
                    debug!(delay_ms = delay.as_millis() as u64, "no time left for another attempt");
                    break;
                }
                thread::sleep(delay);
            }
        }

        Err(match last_failure {
            Some((attempts, Failure::Timeout(timeout))) => {
                GatewayError::Timeout { attempts, timeout }
            }
            Some((attempts, Failure::Malformed(raw))) => {
                GatewayError::MalformedResponse { attempts, raw }
            }
            Some((attempts, Failure::Transient(last_error))) => GatewayError::RetriesExhausted {
                attempts,
                last_error,
            },
            None => GatewayError::DeadlineExceeded,
        })
    }

    /// `base * 2^(attempt-1)`, capped at `backoff_max_ms`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.settings.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.settings.backoff_max_ms))
    }

    fn excerpt(&self, raw: &str) -> String {
        excerpt(raw, self.settings.audit_response_limit_bytes)
    }

    fn record(&self, entry: &AuditEntry) -> Result<(), GatewayError> {
        self.audit
            .record(entry)
            .map_err(|err| GatewayError::Fatal(format!("audit log unavailable: {err:#}")))
    }
}

fn request_id(request: &GatewayRequest, prompt_digest: &str, now: DateTime<Utc>) -> String {
    let seed = format!(
        "{}\n{}\n{}\n{}",
        request.operation,
        request.task_id,
        prompt_digest,
        now.timestamp_nanos_opt().unwrap_or_default()
    );
    format!("req-{}", &sha256_hex(seed.as_bytes())[..16])
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
