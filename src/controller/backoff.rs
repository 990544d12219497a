//! Restart backoff schedules

use std::time::Duration;

/// Exponential backoff for attempt `k` (1-based): `base * 2^(k-1)` clipped to
/// `max`. Used for container and console restarts with independent constants.
pub fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << shift);
    delay.min(max)
}

/// Linear backoff for attempt `k` (1-based): `base * k`. Used between RPC
/// login attempts.
pub fn linear(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}
