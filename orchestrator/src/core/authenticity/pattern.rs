//! Placeholder signatures, impossibly fast calls, and hardcoded responses.

use anyhow::{Context, Result};
use regex::Regex;

use super::{AuthenticityCheck, CheckOutcome, ValidationInput};
use crate::config::Penalties;
use crate::core::evidence::{CheckKind, Indicator};

pub struct PatternCheck {
    placeholders: Vec<Regex>,
    min_service_call_ms: f64,
    penalties: Penalties,
}

impl PatternCheck {
    pub fn new(patterns: &[String], min_service_call_ms: f64, penalties: Penalties) -> Result<Self> {
        let placeholders = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("compile placeholder pattern '{pattern}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            placeholders,
            min_service_call_ms,
            penalties,
        })
    }
}

impl AuthenticityCheck for PatternCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Pattern
    }

    fn check(&self, input: &ValidationInput<'_>) -> CheckOutcome {
        let mut outcome = CheckOutcome::clean();
        for record in input.items {
            let id = Some(record.id.as_str());

            // One placeholder indicator per record, naming the first signature hit.
            let hit = record.text_fields().into_iter().find_map(|text| {
                self.placeholders
                    .iter()
                    .find_map(|re| re.find(text).map(|m| m.as_str().to_string()))
            });
            if let Some(matched) = hit {
                outcome.flag(
                    Indicator::new(
                        CheckKind::Pattern,
                        "placeholder",
                        format!("placeholder signature '{matched}'"),
                        id,
                    ),
                    self.penalties.placeholder,
                );
            }

            for call in &record.service_calls {
                if let Some(total) = call.total_ms
                    && total < self.min_service_call_ms
                {
                    outcome.flag(
                        Indicator::new(
                            CheckKind::Pattern,
                            "implausible_timing",
                            format!(
                                "call to '{}' took {total}ms (minimum plausible {}ms)",
                                call.service, self.min_service_call_ms
                            ),
                            id,
                        ),
                        self.penalties.implausible_timing,
                    );
                }
            }

            if let Some(expected) = record
                .test_run
                .as_ref()
                .and_then(|run| run.expected.as_deref())
                .map(str::trim)
                .filter(|expected| !expected.is_empty())
            {
                let echoed = record.service_calls.iter().any(|call| {
                    call.response_excerpt
                        .as_deref()
                        .is_some_and(|excerpt| excerpt.trim() == expected)
                });
                if echoed {
                    outcome.flag(
                        Indicator::new(
                            CheckKind::Pattern,
                            "hardcoded_response",
                            "service response is the literal value the test expects",
                            id,
                        ),
                        self.penalties.hardcoded_response,
                    );
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorSettings;
    use crate::core::chain::EvidenceChain;
    use crate::core::evidence::{EvidenceKind, ServiceCallEvidence, TestRunEvidence};
    use crate::test_support::{evidence_record, timestamp};

    fn check() -> PatternCheck {
        let settings = ValidatorSettings::default();
        PatternCheck::new(
            &settings.placeholder_patterns,
            settings.min_service_call_ms,
            settings.penalties,
        )
        .expect("pattern check")
    }

    fn run(items: &[crate::core::evidence::EvidenceRecord]) -> CheckOutcome {
        let chain = EvidenceChain::new("t");
        check().check(&ValidationInput {
            items,
            prior: &[],
            chain: &chain,
            dispatched_at: None,
            now: timestamp(100),
        })
    }

    fn call(total_ms: Option<f64>, excerpt: Option<&str>) -> ServiceCallEvidence {
        ServiceCallEvidence {
            service: "geo".to_string(),
            endpoint: "/lookup".to_string(),
            status: Some(200),
            dns_ms: Some(2.0),
            connect_ms: Some(4.0),
            total_ms,
            response_excerpt: excerpt.map(str::to_string),
        }
    }

    #[test]
    fn placeholder_text_is_flagged_once_per_record() {
        let mut record = evidence_record("t", 1, EvidenceKind::Progress, timestamp(1));
        record.note = Some("Lorem ipsum placeholder output".to_string());
        let outcome = run(&[record]);
        assert_eq!(outcome.indicators.len(), 1);
        assert_eq!(outcome.indicators[0].code, "placeholder");
        assert!((outcome.factor - 0.6).abs() < 1e-9);
    }

    #[test]
    fn sub_millisecond_call_is_flagged() {
        let mut record = evidence_record("t", 1, EvidenceKind::Validation, timestamp(1));
        record.service_calls = vec![call(Some(0.4), None), call(Some(38.0), None)];
        let outcome = run(&[record]);
        assert_eq!(outcome.indicators.len(), 1);
        assert_eq!(outcome.indicators[0].code, "implausible_timing");
        assert_eq!(outcome.indicators[0].evidence_id.as_deref(), Some("t-0001"));
    }

    #[test]
    fn echoed_expected_literal_is_flagged() {
        let mut record = evidence_record("t", 1, EvidenceKind::Completion, timestamp(1));
        record.test_run = Some(TestRunEvidence {
            command: "pytest tests/test_geo.py".to_string(),
            exit_status: 0,
            passed: 3,
            failed: 0,
            expected: Some("{\"city\":\"Lyon\"}".to_string()),
            actual: Some("{\"city\":\"Lyon\"}".to_string()),
            duration_ms: Some(900.0),
        });
        record.service_calls = vec![call(Some(41.0), Some(" {\"city\":\"Lyon\"} "))];
        let outcome = run(&[record]);
        assert_eq!(
            outcome.indicators.iter().map(|i| i.code.as_str()).collect::<Vec<_>>(),
            vec!["hardcoded_response"]
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = PatternCheck::new(&["(".to_string()], 1.0, Penalties::default())
            .err()
            .expect("invalid regex");
        assert!(err.to_string().contains("placeholder pattern"));
    }
}
