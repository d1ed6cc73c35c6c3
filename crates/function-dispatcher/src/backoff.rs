//! Exponential backoff with jitter for transient dispatch failures (spec
//! §4.7). No crate in the surrounding stack offers a ready-made
//! backoff/jitter helper, so this is hand-rolled rather than borrowed.

use rand::Rng;
use std::time::Duration;

/// Delay before retry attempt `attempt` (1-based: the delay before the
/// *second* call overall). Doubles `base` each attempt, capped at `max`,
/// then adds up to 50% jitter.
pub fn delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let capped = exp.min(max);
    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.5);
    capped.saturating_add(Duration::from_secs_f64(capped.as_secs_f64() * jitter_fraction))
}
