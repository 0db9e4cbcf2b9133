//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// The deterministic component: `min(base * 2^attempt, max)`.
///
/// Saturates instead of overflowing for large attempt counts.
pub fn capped_delay(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let base_ms = base_delay.as_millis() as u64;
    let max_ms = max_delay.as_millis() as u64;
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let raw_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(raw_ms.min(max_ms))
}

/// Compute the retry delay for an attempt.
///
/// Jitter is half-open, zero to 50% of the capped delay, so concurrently
/// retrying callers desynchronize without inflating the worst case beyond
/// `1.5 * max_delay`.
pub fn compute_delay(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let capped = capped_delay(attempt, base_delay, max_delay);
    let jitter_ms = rand::thread_rng().gen_range(0.0..0.5) * capped.as_millis() as f64;
    capped + Duration::from_millis(jitter_ms as u64)
}
