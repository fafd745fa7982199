//! Orchestrator configuration model (`.orchestrator/config.toml`).
//!
//! Every tunable bound of the core lives here; nothing else hardcodes them.
//! Loading and atomic writes live in [`crate::io::config`].

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// Missing fields default to the values below, so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard bound on cycles per session; past it the session halts.
    pub max_iterations: u32,

    /// Wall-clock budget for one cycle in seconds.
    pub cycle_timeout_secs: u64,

    /// Failures a task may accumulate before it is marked failed and escalated.
    pub max_task_failures: u32,

    pub gateway: GatewaySettings,
    pub context: ContextSettings,
    pub validator: ValidatorSettings,
    pub escalation: EscalationSettings,
    pub store: StoreSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            cycle_timeout_secs: 30 * 60,
            max_task_failures: 3,
            gateway: GatewaySettings::default(),
            context: ContextSettings::default(),
            validator: ValidatorSettings::default(),
            escalation: EscalationSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewaySettings {
    /// Decision endpoint command; the prompt is written to its stdin.
    pub command: Vec<String>,
    /// Maximum retries per gateway call, counted as total dispatch attempts.
    pub max_attempts: u32,
    /// Hard per-call timeout in seconds.
    pub call_timeout_secs: u64,
    /// First backoff delay; doubles on every retry.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Operation types the gateway may dispatch.
    pub allowed_operations: Vec<String>,
    /// Regexes that must not match request content.
    pub denied_patterns: Vec<String>,
    /// Truncate captured endpoint stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Bytes of raw response kept per audit entry.
    pub audit_response_limit_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            max_attempts: 3,
            call_timeout_secs: 5 * 60,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            allowed_operations: vec![
                "next_action".to_string(),
                "escalation_review".to_string(),
            ],
            denied_patterns: vec![
                r"rm\s+-rf\s+/(\s|$)".to_string(),
                r"-----BEGIN [A-Z ]*PRIVATE KEY-----".to_string(),
                r"(?i)\b(api[_-]?key|secret[_-]?key|password)\s*[:=]\s*\S{8,}".to_string(),
                r"curl[^|\n]*\|\s*(ba|z)?sh\b".to_string(),
            ],
            output_limit_bytes: 1_000_000,
            audit_response_limit_bytes: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextSettings {
    /// Context budget per decision call, in abstract size units.
    pub budget: usize,
    /// Cross-reference expansion depth from declared files.
    pub hop_depth: usize,
    /// Loading stops once the remaining budget drops below this.
    pub reserve_min: usize,
    /// Bytes per size unit used by the (over-)estimator.
    pub bytes_per_unit: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            budget: 24_000,
            hop_depth: 2,
            reserve_min: 256,
            bytes_per_unit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidatorSettings {
    /// Minimum score for a verdict to count as authentic.
    pub authenticity_threshold: f64,
    /// Maximum indicators tolerated in an authentic verdict.
    pub max_indicators: usize,
    /// Future timestamps within this skew are accepted.
    pub clock_skew_secs: i64,
    /// Service calls faster than this are physically implausible.
    pub min_service_call_ms: f64,
    /// Regexes for placeholder or sample data signatures.
    pub placeholder_patterns: Vec<String>,
    pub penalties: Penalties,
}

/// Confidence multipliers applied per indicator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Penalties {
    pub placeholder: f64,
    pub implausible_timing: f64,
    pub hardcoded_response: f64,
    pub missing_timestamp: f64,
    pub future_timestamp: f64,
    pub out_of_order: f64,
    pub identical_timestamps: f64,
    pub precedes_dispatch: f64,
    pub missing_timing_fields: f64,
    pub chain_break: f64,
}

impl Default for Penalties {
    fn default() -> Self {
        Self {
            placeholder: 0.6,
            implausible_timing: 0.5,
            hardcoded_response: 0.5,
            missing_timestamp: 0.7,
            future_timestamp: 0.5,
            out_of_order: 0.7,
            identical_timestamps: 0.8,
            precedes_dispatch: 0.7,
            missing_timing_fields: 0.7,
            chain_break: 0.2,
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            authenticity_threshold: 0.7,
            max_indicators: 2,
            clock_skew_secs: 5,
            min_service_call_ms: 1.0,
            placeholder_patterns: vec![
                r"(?i)lorem ipsum".to_string(),
                r"(?i)\bplaceholder\b".to_string(),
                r"(?i)\bsample[ _-]?data\b".to_string(),
                r"(?i)\b(dummy|fake|mock)[ _-]?(data|response|value|result)\b".to_string(),
                r"(?i)\bexample\.(com|org)\b".to_string(),
                r"(?i)\btest@test\b".to_string(),
                r"(?i)\bfoo\b.*\bbar\b".to_string(),
                r"\b(xxx+|XXX+)\b".to_string(),
            ],
            penalties: Penalties::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscalationSettings {
    /// Escalations allowed per session.
    pub budget: u32,
    /// Command backing the independent evaluator. Empty uses the gateway command.
    pub evaluator_command: Vec<String>,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            budget: 3,
            evaluator_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    pub backup_retention_count: usize,
    pub backup_retention_age_secs: u64,
    /// Locks older than this are considered abandoned and reclaimed.
    pub lock_stale_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backup_retention_count: 10,
            backup_retention_age_secs: 7 * 24 * 60 * 60,
            lock_stale_secs: 5,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.cycle_timeout_secs == 0 {
            return Err(anyhow!("cycle_timeout_secs must be > 0"));
        }
        if self.max_task_failures == 0 {
            return Err(anyhow!("max_task_failures must be > 0"));
        }
        self.gateway.validate()?;
        self.context.validate()?;
        self.validator.validate()?;
        if self.store.backup_retention_count == 0 {
            return Err(anyhow!("store.backup_retention_count must be > 0"));
        }
        Ok(())
    }
}

impl GatewaySettings {
    fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("gateway.command must be a non-empty array"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("gateway.max_attempts must be > 0"));
        }
        if self.call_timeout_secs == 0 {
            return Err(anyhow!("gateway.call_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("gateway.output_limit_bytes must be > 0"));
        }
        for pattern in &self.denied_patterns {
            Regex::new(pattern)
                .map_err(|err| anyhow!("gateway.denied_patterns: invalid regex '{pattern}': {err}"))?;
        }
        Ok(())
    }
}

impl ContextSettings {
    fn validate(&self) -> Result<()> {
        if self.budget == 0 {
            return Err(anyhow!("context.budget must be > 0"));
        }
        if self.bytes_per_unit == 0 {
            return Err(anyhow!("context.bytes_per_unit must be > 0"));
        }
        if self.reserve_min >= self.budget {
            return Err(anyhow!("context.reserve_min must be < context.budget"));
        }
        Ok(())
    }
}

impl ValidatorSettings {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.authenticity_threshold) {
            return Err(anyhow!("validator.authenticity_threshold must be within 0..=1"));
        }
        if self.clock_skew_secs < 0 {
            return Err(anyhow!("validator.clock_skew_secs must be >= 0"));
        }
        for pattern in &self.placeholder_patterns {
            Regex::new(pattern).map_err(|err| {
                anyhow!("validator.placeholder_patterns: invalid regex '{pattern}': {err}")
            })?;
        }
        let p = &self.penalties;
        for (name, value) in [
            ("placeholder", p.placeholder),
            ("implausible_timing", p.implausible_timing),
            ("hardcoded_response", p.hardcoded_response),
            ("missing_timestamp", p.missing_timestamp),
            ("future_timestamp", p.future_timestamp),
            ("out_of_order", p.out_of_order),
            ("identical_timestamps", p.identical_timestamps),
            ("precedes_dispatch", p.precedes_dispatch),
            ("missing_timing_fields", p.missing_timing_fields),
            ("chain_break", p.chain_break),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("validator.penalties.{name} must be within 0..=1"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        OrchestratorConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_reserve_at_or_above_budget() {
        let mut cfg = OrchestratorConfig::default();
        cfg.context.reserve_min = cfg.context.budget;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("reserve_min"));
    }

    #[test]
    fn rejects_invalid_denied_pattern() {
        let mut cfg = OrchestratorConfig::default();
        cfg.gateway.denied_patterns.push("(unclosed".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("denied_patterns"));
    }

    #[test]
    fn rejects_out_of_range_penalty() {
        let mut cfg = OrchestratorConfig::default();
        cfg.validator.penalties.chain_break = 1.5;
        assert!(cfg.validate().is_err());
    }
}
