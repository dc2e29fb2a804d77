//! Reconnect backoff schedule.

use std::time::Duration;

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Ceiling for the exponential schedule.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Delay before reconnect attempt `attempt` (0-based):
/// `min(base * 2^attempt, max)`.
#[must_use]
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u128 << attempt.min(31);
    let delay_ms = base.as_millis().saturating_mul(factor).min(max.as_millis());
    Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
}
