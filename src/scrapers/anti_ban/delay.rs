//! Inter-request delay calculation.
//!
//! Pure functions of the session state plus the last observed latency.
//! Randomness is injected so a seeded RNG gives reproducible delays.

use std::time::Duration;

use rand::Rng;

use super::config::{scale_ms, AntiBanConfig, JITTER_FRACTION};

/// Delay before jitter: latency escalation followed by failure backoff.
///
/// Each step is capped at `max_delay`; the result is not clamped to the floor.
pub fn escalated_delay(
    config: &AntiBanConfig,
    current_delay: Duration,
    consecutive_failures: u32,
    last_response_time: Option<Duration>,
) -> Duration {
    let mut delay = current_delay;

    if let Some(latency) = last_response_time {
        if latency > config.very_slow_threshold {
            delay = scale_ms(delay, 2.0).min(config.max_delay);
        } else if latency > config.slow_threshold {
            delay = scale_ms(delay, config.delay_growth_factor).min(config.max_delay);
        }
    }

    if consecutive_failures > 0 {
        let exponent = consecutive_failures.min(i32::MAX as u32) as i32;
        let backoff = config.delay_growth_factor.powi(exponent);
        delay = scale_ms(delay, backoff).min(config.max_delay);
    }

    delay
}

/// Apply symmetric uniform jitter of ±20%.
pub fn jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    let factor = 1.0 + rng.random_range(-JITTER_FRACTION..=JITTER_FRACTION);
    scale_ms(delay, factor)
}

/// Compute the next inter-request delay, clamped to `[base_delay, max_delay]`.
pub fn compute_delay<R: Rng + ?Sized>(
    config: &AntiBanConfig,
    current_delay: Duration,
    consecutive_failures: u32,
    last_response_time: Option<Duration>,
    rng: &mut R,
) -> Duration {
    let delay = escalated_delay(
        config,
        current_delay,
        consecutive_failures,
        last_response_time,
    );
    config.clamp_delay(jitter(delay, rng))
}
