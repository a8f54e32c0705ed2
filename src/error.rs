//! Error types for the throttling engine.
//!
//! Blocking conditions reported by a target are never errors; they are
//! returned as data. Only misconfiguration fails.

use std::time::Duration;

use thiserror::Error;

/// Invalid engine configuration, detected at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("base delay {base:?} exceeds max delay {max:?}")]
    DelayBounds { base: Duration, max: Duration },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("delay growth factor must be greater than 1.0, got {0}")]
    GrowthFactor(f64),

    #[error("max consecutive failures must be at least 1")]
    FailureThreshold,

    #[error("slow threshold {slow:?} exceeds very slow threshold {very_slow:?}")]
    LatencyThresholds { slow: Duration, very_slow: Duration },

    #[error("invalid blocking rule pattern {pattern:?}: {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
