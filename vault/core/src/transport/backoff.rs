//! Reconnection Backoff
//!
//! Exponential backoff: the delay doubles with every attempt, capped at a
//! maximum. `delay(attempt) = min(base * 2^attempt, max)`.

use std::time::Duration;

/// Delay before reconnection attempt `attempt` (0-based)
///
/// Saturates instead of overflowing for large attempt numbers.
#[must_use]
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(max)
}
