//! Evidence & Anti-Fabrication Validator.
//!
//! The validator runs an ordered list of [`AuthenticityCheck`] strategies.
//! Each returns a confidence factor in `0..=1` and the indicators it raised;
//! the verdict score is the product of all factors, starting from 1.0.
//! New strategies plug in through [`Validator::with_check`].

mod chain_check;
mod pattern;
mod structural;
mod temporal;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::{Penalties, ValidatorSettings};
use crate::core::chain::EvidenceChain;
use crate::core::evidence::{AuthenticityVerdict, CheckKind, EvidenceRecord, Indicator};

pub use chain_check::ChainCheck;
pub use pattern::PatternCheck;
pub use structural::StructuralCheck;
pub use temporal::TemporalCheck;

/// Everything a strategy may look at for one submission.
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    /// Newly submitted records, in sequence order, not yet chained.
    pub items: &'a [EvidenceRecord],
    /// Records already stored for the task.
    pub prior: &'a [EvidenceRecord],
    /// Stored chain covering `prior`.
    pub chain: &'a EvidenceChain,
    /// When the instruction these items answer was dispatched.
    pub dispatched_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// What one strategy concluded.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub factor: f64,
    pub indicators: Vec<Indicator>,
    pub unverifiable: Vec<String>,
}

impl CheckOutcome {
    pub fn clean() -> Self {
        Self {
            factor: 1.0,
            indicators: Vec::new(),
            unverifiable: Vec::new(),
        }
    }

    /// Record an indicator and apply its penalty multiplier.
    pub fn flag(&mut self, indicator: Indicator, penalty: f64) {
        self.factor *= penalty.clamp(0.0, 1.0);
        self.indicators.push(indicator);
    }
}

/// One pluggable authenticity strategy.
pub trait AuthenticityCheck {
    fn kind(&self) -> CheckKind;
    fn check(&self, input: &ValidationInput<'_>) -> CheckOutcome;
}

pub struct Validator {
    checks: Vec<Box<dyn AuthenticityCheck>>,
    threshold: f64,
    max_indicators: usize,
}

impl Validator {
    /// Validator with no strategies; every submission scores 1.0.
    pub fn empty(threshold: f64, max_indicators: usize) -> Self {
        Self {
            checks: Vec::new(),
            threshold,
            max_indicators,
        }
    }

    /// The four default strategies in order: pattern, temporal, structural, chain.
    pub fn from_settings(settings: &ValidatorSettings) -> Result<Self> {
        let penalties: Penalties = settings.penalties.clone();
        Ok(Self::empty(settings.authenticity_threshold, settings.max_indicators)
            .with_check(PatternCheck::new(
                &settings.placeholder_patterns,
                settings.min_service_call_ms,
                penalties.clone(),
            )?)
            .with_check(TemporalCheck::new(settings.clock_skew_secs, penalties.clone()))
            .with_check(StructuralCheck::new(penalties.clone()))
            .with_check(ChainCheck::new(penalties)))
    }

    pub fn with_check<C: AuthenticityCheck + 'static>(mut self, check: C) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    pub fn check_kinds(&self) -> Vec<CheckKind> {
        self.checks.iter().map(|check| check.kind()).collect()
    }

    pub fn validate(&self, input: &ValidationInput<'_>) -> AuthenticityVerdict {
        let mut score = 1.0_f64;
        let mut indicators = Vec::new();
        let mut unverifiable = Vec::new();
        for check in &self.checks {
            let outcome = check.check(input);
            score *= outcome.factor.clamp(0.0, 1.0);
            indicators.extend(outcome.indicators);
            for id in outcome.unverifiable {
                if !unverifiable.contains(&id) {
                    unverifiable.push(id);
                }
            }
        }
        let authentic = score >= self.threshold && indicators.len() <= self.max_indicators;
        AuthenticityVerdict {
            authentic,
            score,
            indicators,
            unverifiable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::evidence::{EvidenceKind, ServiceCallEvidence};
    use crate::test_support::{evidence_record, timestamp};

    struct Fixed(f64, usize);

    impl AuthenticityCheck for Fixed {
        fn kind(&self) -> CheckKind {
            CheckKind::Pattern
        }

        fn check(&self, _input: &ValidationInput<'_>) -> CheckOutcome {
            let mut outcome = CheckOutcome::clean();
            outcome.factor = self.0;
            for n in 0..self.1 {
                outcome
                    .indicators
                    .push(Indicator::new(CheckKind::Pattern, "fixed", format!("{n}"), None));
            }
            outcome
        }
    }

    fn input<'a>(items: &'a [EvidenceRecord], chain: &'a EvidenceChain) -> ValidationInput<'a> {
        ValidationInput {
            items,
            prior: &[],
            chain,
            dispatched_at: Some(timestamp(0)),
            now: timestamp(100),
        }
    }

    #[test]
    fn score_is_product_of_factors() {
        let chain = EvidenceChain::new("t");
        let items = vec![evidence_record("t", 1, EvidenceKind::Progress, timestamp(10))];
        let validator = Validator::empty(0.5, 5)
            .with_check(Fixed(0.8, 0))
            .with_check(Fixed(0.5, 1));
        let verdict = validator.validate(&input(&items, &chain));
        assert!((verdict.score - 0.4).abs() < 1e-9);
        assert!(!verdict.authentic);
        assert_eq!(verdict.indicators.len(), 1);
    }

    #[test]
    fn indicator_count_bound_applies_independently_of_score() {
        let chain = EvidenceChain::new("t");
        let items = vec![evidence_record("t", 1, EvidenceKind::Progress, timestamp(10))];
        let validator = Validator::empty(0.1, 2).with_check(Fixed(1.0, 3));
        let verdict = validator.validate(&input(&items, &chain));
        assert_eq!(verdict.score, 1.0);
        assert!(!verdict.authentic);
    }

    #[test]
    fn default_strategies_accept_plausible_evidence() {
        let chain = EvidenceChain::new("t");
        let mut record = evidence_record("t", 1, EvidenceKind::Completion, timestamp(10));
        record.service_calls.push(ServiceCallEvidence {
            service: "billing".to_string(),
            endpoint: "/v1/invoices".to_string(),
            status: Some(200),
            dns_ms: Some(3.2),
            connect_ms: Some(11.0),
            total_ms: Some(84.5),
            response_excerpt: Some("{\"id\":\"inv_81\"}".to_string()),
        });
        let items = vec![record];
        let validator = Validator::from_settings(&ValidatorSettings::default()).expect("validator");
        assert_eq!(
            validator.check_kinds(),
            vec![
                CheckKind::Pattern,
                CheckKind::Temporal,
                CheckKind::Structural,
                CheckKind::Chain
            ]
        );
        let verdict = validator.validate(&input(&items, &chain));
        assert!(verdict.authentic, "{verdict:?}");
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn zero_millisecond_service_call_is_not_authentic() {
        let chain = EvidenceChain::new("t");
        let mut record = evidence_record("t", 1, EvidenceKind::Completion, timestamp(10));
        record.service_calls.push(ServiceCallEvidence {
            service: "billing".to_string(),
            endpoint: "/v1/invoices".to_string(),
            status: Some(200),
            dns_ms: Some(0.0),
            connect_ms: Some(0.0),
            total_ms: Some(0.0),
            response_excerpt: None,
        });
        let items = vec![record];
        let validator = Validator::from_settings(&ValidatorSettings::default()).expect("validator");
        let verdict = validator.validate(&input(&items, &chain));
        assert!(!verdict.authentic);
        assert!(
            verdict
                .indicators
                .iter()
                .any(|i| i.check == CheckKind::Pattern && i.code == "implausible_timing")
        );
    }
}
