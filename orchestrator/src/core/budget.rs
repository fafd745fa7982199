//! Cycle time budget helpers.

use std::time::{Duration, Instant};

use crate::core::error::GatewayError;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration, GatewayError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(GatewayError::DeadlineExceeded);
    }
    Ok(remaining)
}

/// Timeout for the next gateway call: the configured per-call timeout,
/// capped by what is left of the cycle.
pub fn call_timeout(deadline: Instant, per_call: Duration) -> Result<Duration, GatewayError> {
    Ok(remaining_budget(deadline)?.min(per_call))
}
