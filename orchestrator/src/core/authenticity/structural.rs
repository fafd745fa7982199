//! External-call evidence must carry corroborating timing fields.

use super::{AuthenticityCheck, CheckOutcome, ValidationInput};
use crate::config::Penalties;
use crate::core::evidence::{CheckKind, Indicator, ServiceCallEvidence};

pub struct StructuralCheck {
    penalties: Penalties,
}

impl StructuralCheck {
    pub fn new(penalties: Penalties) -> Self {
        Self { penalties }
    }
}

fn missing_timing(call: &ServiceCallEvidence) -> Vec<&'static str> {
    [
        ("dns_ms", call.dns_ms),
        ("connect_ms", call.connect_ms),
        ("total_ms", call.total_ms),
    ]
    .into_iter()
    .filter(|(_, value)| value.is_none_or(|ms| !ms.is_finite() || ms <= 0.0))
    .map(|(name, _)| name)
    .collect()
}

impl AuthenticityCheck for StructuralCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Structural
    }

    fn check(&self, input: &ValidationInput<'_>) -> CheckOutcome {
        let mut outcome = CheckOutcome::clean();
        for record in input.items {
            for call in &record.service_calls {
                let missing = missing_timing(call);
                if missing.is_empty() {
                    continue;
                }
                outcome.flag(
                    Indicator::new(
                        CheckKind::Structural,
                        "missing_timing_fields",
                        format!(
                            "call to '{}' lacks non-zero {}",
                            call.service,
                            missing.join(", ")
                        ),
                        Some(record.id.as_str()),
                    ),
                    self.penalties.missing_timing_fields,
                );
            }
        }
        outcome
    }
}
