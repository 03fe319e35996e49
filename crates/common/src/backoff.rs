//! Exponential backoff shared by every retrying consumer.

use std::time::Duration;

/// Returns the delay before retry number `attempt` (1-based).
///
/// The delay doubles with each attempt starting at `base` and never exceeds
/// `max`. Attempt 0 is treated like attempt 1.
pub fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << exponent;
    base.checked_mul(factor).unwrap_or(max).min(max)
}
