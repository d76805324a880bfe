use std::time::Duration;

use rand::Rng;

use crate::job::RetryConstraint;

/// Exponential schedule: `initial * 2^(attempt - 1)`.
///
/// The exponent is clamped so large attempt counts saturate instead of
/// overflowing.
pub fn exponential_delay(initial: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    initial.saturating_mul(1u32 << exp)
}

/// Delay before the next attempt, or `None` when the policy says give up.
///
/// Exponential delays get ±10% jitter so retrying jobs spread out.
pub fn retry_delay(constraint: RetryConstraint, attempt: u32) -> Option<Duration> {
    match constraint {
        RetryConstraint::Cancel => None,
        RetryConstraint::Retry { delay } | RetryConstraint::RetryAfter { delay } => Some(delay),
        RetryConstraint::Exponential { initial } => Some(jitter(exponential_delay(initial, attempt))),
    }
}

fn jitter(base: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.9..=1.1);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
