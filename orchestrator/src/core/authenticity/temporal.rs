//! Timestamp presence, clock skew, ordering, and coincidence.

use chrono::Duration;

use super::{AuthenticityCheck, CheckOutcome, ValidationInput};
use crate::config::Penalties;
use crate::core::evidence::{CheckKind, Indicator};

pub struct TemporalCheck {
    skew: Duration,
    penalties: Penalties,
}

impl TemporalCheck {
    pub fn new(clock_skew_secs: i64, penalties: Penalties) -> Self {
        Self {
            skew: Duration::seconds(clock_skew_secs.max(0)),
            penalties,
        }
    }
}

impl AuthenticityCheck for TemporalCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Temporal
    }

    fn check(&self, input: &ValidationInput<'_>) -> CheckOutcome {
        let mut outcome = CheckOutcome::clean();
        let horizon = input.now + self.skew;

        // Ordering continues from the last stored record with a timestamp.
        let mut previous = input
            .prior
            .iter()
            .rev()
            .find_map(|record| record.collected_at.map(|at| (record.id.as_str(), at)));

        let mut items: Vec<_> = input.items.iter().collect();
        items.sort_by_key(|record| record.sequence);

        for record in &items {
            let id = Some(record.id.as_str());
            let Some(at) = record.collected_at else {
                outcome.flag(
                    Indicator::new(
                        CheckKind::Temporal,
                        "missing_timestamp",
                        "evidence has no collection time",
                        id,
                    ),
                    self.penalties.missing_timestamp,
                );
                continue;
            };

            if at > horizon {
                outcome.flag(
                    Indicator::new(
                        CheckKind::Temporal,
                        "future_timestamp",
                        format!(
                            "collected at {} which is after {}",
                            at.to_rfc3339(),
                            horizon.to_rfc3339()
                        ),
                        id,
                    ),
                    self.penalties.future_timestamp,
                );
            }

            if let Some(dispatched) = input.dispatched_at
                && at < dispatched
            {
                outcome.flag(
                    Indicator::new(
                        CheckKind::Temporal,
                        "precedes_dispatch",
                        format!(
                            "collected at {} before the instruction was dispatched at {}",
                            at.to_rfc3339(),
                            dispatched.to_rfc3339()
                        ),
                        id,
                    ),
                    self.penalties.precedes_dispatch,
                );
            }

            if let Some((prev_id, prev_at)) = previous
                && at < prev_at
            {
                outcome.flag(
                    Indicator::new(
                        CheckKind::Temporal,
                        "out_of_order",
                        format!("collected before earlier-sequenced '{prev_id}'"),
                        id,
                    ),
                    self.penalties.out_of_order,
                );
            }
            previous = Some((record.id.as_str(), at));
        }

        // Identical timestamps across different kinds, counted once per new record.
        for record in &items {
            let Some(at) = record.collected_at else {
                continue;
            };
            let twin = input.prior.iter().chain(input.items).find(|other| {
                other.id != record.id && other.kind != record.kind && other.collected_at == Some(at)
            });
            if let Some(other) = twin {
                outcome.flag(
                    Indicator::new(
                        CheckKind::Temporal,
                        "identical_timestamps",
                        format!("same collection time as '{}' of a different kind", other.id),
                        Some(record.id.as_str()),
                    ),
                    self.penalties.identical_timestamps,
                );
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::EvidenceChain;
    use crate::core::evidence::{EvidenceKind, EvidenceRecord};
    use crate::test_support::{evidence_record, timestamp};

    fn codes(prior: &[EvidenceRecord], items: &[EvidenceRecord], dispatched: i64) -> Vec<String> {
        let chain = EvidenceChain::new("t");
        TemporalCheck::new(5, Penalties::default())
            .check(&ValidationInput {
                items,
                prior,
                chain: &chain,
                dispatched_at: Some(timestamp(dispatched)),
                now: timestamp(1_000),
            })
            .indicators
            .into_iter()
            .map(|indicator| indicator.code)
            .collect()
    }

    #[test]
    fn well_ordered_evidence_passes() {
        let items = vec![
            evidence_record("t", 1, EvidenceKind::Progress, timestamp(10)),
            evidence_record("t", 2, EvidenceKind::Completion, timestamp(20)),
        ];
        assert!(codes(&[], &items, 5).is_empty());
    }

    #[test]
    fn missing_and_future_timestamps_are_flagged() {
        let mut missing = evidence_record("t", 1, EvidenceKind::Progress, timestamp(10));
        missing.collected_at = None;
        let future = evidence_record("t", 2, EvidenceKind::Completion, timestamp(1_006));
        assert_eq!(
            codes(&[], &[missing, future], 0),
            vec!["missing_timestamp", "future_timestamp"]
        );
    }

    #[test]
    fn skew_tolerance_allows_small_drift() {
        let items = vec![evidence_record("t", 1, EvidenceKind::Completion, timestamp(1_004))];
        assert!(codes(&[], &items, 0).is_empty());
    }

    #[test]
    fn ordering_continues_from_prior_records() {
        let prior = vec![evidence_record("t", 1, EvidenceKind::Progress, timestamp(50))];
        let items = vec![evidence_record("t", 2, EvidenceKind::Completion, timestamp(40))];
        assert_eq!(codes(&prior, &items, 0), vec!["out_of_order"]);
    }

    #[test]
    fn identical_times_across_kinds_and_pre_dispatch_are_flagged() {
        let items = vec![
            evidence_record("t", 1, EvidenceKind::Validation, timestamp(30)),
            evidence_record("t", 2, EvidenceKind::Completion, timestamp(30)),
        ];
        assert_eq!(
            codes(&[], &items, 35),
            vec![
                "precedes_dispatch",
                "precedes_dispatch",
                "identical_timestamps",
                "identical_timestamps"
            ]
        );
    }
}
