//! Re-derives the stored chain and checks new items extend it without gaps.

use super::{AuthenticityCheck, CheckOutcome, ValidationInput};
use crate::config::Penalties;
use crate::core::chain::verify;
use crate::core::evidence::{CheckKind, Indicator};

pub struct ChainCheck {
    penalties: Penalties,
}

impl ChainCheck {
    pub fn new(penalties: Penalties) -> Self {
        Self { penalties }
    }
}

impl AuthenticityCheck for ChainCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Chain
    }

    fn check(&self, input: &ValidationInput<'_>) -> CheckOutcome {
        let mut outcome = CheckOutcome::clean();
        let report = verify(input.chain, input.prior);
        let new_ids = input.items.iter().map(|record| record.id.clone());

        if !report.intact {
            // Everything after a break is unverifiable, new items included.
            outcome.unverifiable = report.unverifiable.clone();
            outcome.unverifiable.extend(new_ids);
            outcome.flag(
                Indicator::new(
                    CheckKind::Chain,
                    "chain_break",
                    report.reason.unwrap_or_else(|| "chain does not re-derive".to_string()),
                    None,
                ),
                self.penalties.chain_break,
            );
            return outcome;
        }

        let mut expected = input.prior.len() as u64 + 1;
        for record in input.items {
            if record.sequence != expected || record.task_id != input.chain.task_id {
                outcome.unverifiable = input
                    .items
                    .iter()
                    .filter(|item| item.sequence >= record.sequence)
                    .map(|item| item.id.clone())
                    .collect();
                outcome.flag(
                    Indicator::new(
                        CheckKind::Chain,
                        "chain_break",
                        format!(
                            "record '{}' does not extend the chain at sequence {expected}",
                            record.id
                        ),
                        Some(record.id.as_str()),
                    ),
                    self.penalties.chain_break,
                );
                break;
            }
            expected += 1;
        }
        outcome
    }
}
