//! Anti-ban configuration and statistics types.

use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;

/// Number of request timings kept for rolling averages.
pub const TIMING_BUFFER_SIZE: usize = 50;

/// Jitter applied to every computed delay, as a fraction of the delay.
pub const JITTER_FRACTION: f64 = 0.2;

/// Multiplier applied to the current delay after a successful request.
pub const RECOVERY_MULTIPLIER: f64 = 0.8;

/// Minimum number of requests before the success ratio is considered.
pub const MIN_REQUESTS_FOR_RATIO: u64 = 10;

/// Success ratio below which the session is no longer safe.
pub const MIN_SUCCESS_RATIO: f64 = 0.5;

/// Configuration for throttling behavior.
#[derive(Debug, Clone)]
pub struct AntiBanConfig {
    /// Floor for the inter-request delay.
    pub base_delay: Duration,
    /// Ceiling for the inter-request delay.
    pub max_delay: Duration,
    /// Multiplier for backoff on failure (> 1.0).
    pub delay_growth_factor: f64,
    /// Base length of a hard block window after a severe signal.
    pub cooldown_duration: Duration,
    /// Circuit-breaker threshold.
    pub max_consecutive_failures: u32,
    /// Responses slower than this escalate pacing.
    pub slow_threshold: Duration,
    /// Responses slower than this double pacing.
    pub very_slow_threshold: Duration,
}

impl Default for AntiBanConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            delay_growth_factor: 1.5,
            cooldown_duration: Duration::from_secs(60),
            max_consecutive_failures: 5,
            slow_threshold: Duration::from_millis(3000),
            very_slow_threshold: Duration::from_millis(5000),
        }
    }
}

impl AntiBanConfig {
    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("base delay", self.base_delay),
            ("max delay", self.max_delay),
            ("cooldown duration", self.cooldown_duration),
            ("slow threshold", self.slow_threshold),
            ("very slow threshold", self.very_slow_threshold),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if self.base_delay > self.max_delay {
            return Err(ConfigError::DelayBounds {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        // NaN fails this comparison too
        if !(self.delay_growth_factor > 1.0) || !self.delay_growth_factor.is_finite() {
            return Err(ConfigError::GrowthFactor(self.delay_growth_factor));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::FailureThreshold);
        }
        if self.slow_threshold > self.very_slow_threshold {
            return Err(ConfigError::LatencyThresholds {
                slow: self.slow_threshold,
                very_slow: self.very_slow_threshold,
            });
        }
        Ok(())
    }

    /// Clamp a delay into `[base_delay, max_delay]`.
    pub fn clamp_delay(&self, delay: Duration) -> Duration {
        delay.clamp(self.base_delay, self.max_delay)
    }
}

/// Scale a duration by a factor, rounded to whole milliseconds.
pub(crate) fn scale_ms(duration: Duration, factor: f64) -> Duration {
    let millis = (duration.as_millis() as f64 * factor).round();
    if millis <= 0.0 {
        Duration::ZERO
    } else if millis >= u64::MAX as f64 {
        Duration::from_millis(u64::MAX)
    } else {
        Duration::from_millis(millis as u64)
    }
}

/// Snapshot of session statistics for logging and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AntiBanStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage of successful requests (0-100).
    pub success_rate: f64,
    pub avg_response_time: Duration,
    pub rate_limit_hits: u64,
    pub captcha_encounters: u64,
    pub current_delay: Duration,
    pub is_in_cooldown: bool,
}
