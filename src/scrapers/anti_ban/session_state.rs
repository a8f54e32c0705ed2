//! Per-session throttling state.
//!
//! Every method takes the current instant explicitly, so the state machine
//! can be driven by a real or a paused clock.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use super::config::{
    scale_ms, AntiBanConfig, AntiBanStats, MIN_REQUESTS_FOR_RATIO, MIN_SUCCESS_RATIO,
    RECOVERY_MULTIPLIER, TIMING_BUFFER_SIZE,
};
use super::delay::compute_delay;

/// Timing of a completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestTiming {
    pub response_time: Duration,
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Why the gate asked the caller to wait (or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    Ready,
    Cooldown,
    Pacing,
}

impl WaitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitReason::Ready => "ready",
            WaitReason::Cooldown => "cooldown",
            WaitReason::Pacing => "pacing",
        }
    }
}

/// Answer to "may the next request be sent now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitDecision {
    pub wait: bool,
    pub delay: Duration,
    pub reason: WaitReason,
}

impl WaitDecision {
    fn ready() -> Self {
        Self {
            wait: false,
            delay: Duration::ZERO,
            reason: WaitReason::Ready,
        }
    }

    fn wait(delay: Duration, reason: WaitReason) -> Self {
        Self {
            wait: true,
            delay,
            reason,
        }
    }
}

/// Circuit-breaker verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SafetyVerdict {
    Safe,
    CaptchaDetected,
    TooManyFailures { consecutive: u32 },
    LowSuccessRate { ratio: f64 },
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }
}

/// What a recorded outcome changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeEffect {
    pub success: bool,
    /// Cooldown window started by this outcome, if any.
    pub cooldown: Option<Duration>,
}

/// Mutable state for one scraping session.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Current pacing delay, always within the configured bounds.
    pub current_delay: Duration,
    /// Hard "do not send" deadline.
    pub blocked_until: Option<Instant>,
    /// Sticky until `reset`; a later success does not clear it.
    pub captcha_detected: bool,
    pub rate_limit_hits: u64,
    pub captcha_encounters: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_request: Option<Instant>,
    /// Most recent request timings, oldest first.
    pub timings: VecDeque<RequestTiming>,
}

impl SessionState {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_delay: base_delay,
            blocked_until: None,
            captcha_detected: false,
            rate_limit_hits: 0,
            captcha_encounters: 0,
            total_requests: 0,
            successful_requests: 0,
            last_request: None,
            timings: VecDeque::with_capacity(TIMING_BUFFER_SIZE),
        }
    }

    /// Restore construction defaults.
    pub fn reset(&mut self, base_delay: Duration) {
        *self = Self::new(base_delay);
    }

    fn push_timing(&mut self, timing: RequestTiming) {
        if self.timings.len() >= TIMING_BUFFER_SIZE {
            self.timings.pop_front();
        }
        self.timings.push_back(timing);
    }

    /// Extend the cooldown to `until`; an active cooldown is never shortened.
    pub fn extend_cooldown(&mut self, until: Instant) {
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// Record a completed request.
    pub fn record_outcome(
        &mut self,
        config: &AntiBanConfig,
        status_code: Option<u16>,
        response_time: Duration,
        success: bool,
        now: Instant,
    ) -> OutcomeEffect {
        // Unknown status does not contradict a reported success
        let success = success && status_code.map_or(true, |s| (200..400).contains(&s));

        self.push_timing(RequestTiming {
            response_time,
            status_code,
            timestamp: Utc::now(),
            success,
        });
        self.total_requests += 1;
        self.last_request = Some(now);

        if success {
            self.successful_requests += 1;
            self.consecutive_failures = 0;
            self.blocked_until = None;
            self.current_delay = scale_ms(self.current_delay, RECOVERY_MULTIPLIER)
                .max(config.base_delay)
                .min(config.max_delay);
            return OutcomeEffect {
                success,
                cooldown: None,
            };
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_delay = scale_ms(self.current_delay, config.delay_growth_factor)
            .min(config.max_delay)
            .max(config.base_delay);

        let mut cooldown = None;
        match status_code {
            Some(429) => {
                self.rate_limit_hits += 1;
                cooldown = Some(config.cooldown_duration);
            }
            Some(403) => {
                cooldown = Some(scale_ms(config.cooldown_duration, 2.0));
            }
            _ => {}
        }
        if self.consecutive_failures >= config.max_consecutive_failures {
            let escalated = scale_ms(config.cooldown_duration, 3.0);
            cooldown = Some(cooldown.map_or(escalated, |c| c.max(escalated)));
        }
        if let Some(window) = cooldown {
            self.extend_cooldown(now + window);
        }

        OutcomeEffect { success, cooldown }
    }

    /// Mark a CAPTCHA encounter.
    pub fn record_captcha(&mut self) {
        self.captcha_detected = true;
        self.captcha_encounters += 1;
    }

    /// Response time of the most recent request.
    pub fn last_response_time(&self) -> Option<Duration> {
        self.timings.back().map(|t| t.response_time)
    }

    /// Mean response time over the timing buffer.
    pub fn average_response_time(&self) -> Duration {
        if self.timings.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.timings.iter().map(|t| t.response_time).sum();
        total / self.timings.len() as u32
    }

    /// Remaining cooldown, if the deadline is still ahead of `now`.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn is_in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_remaining(now).is_some()
    }

    /// Drop a cooldown whose deadline has passed.
    pub fn clear_expired_cooldown(&mut self, now: Instant) -> bool {
        match self.blocked_until {
            Some(until) if until <= now => {
                self.blocked_until = None;
                true
            }
            _ => false,
        }
    }

    /// Decide whether the next request must wait.
    ///
    /// Cooldown takes precedence; otherwise the pacing delay (computed from
    /// the latest response time) is compared with the time since the last request.
    pub fn wait_decision<R: Rng + ?Sized>(
        &self,
        config: &AntiBanConfig,
        now: Instant,
        rng: &mut R,
    ) -> WaitDecision {
        if let Some(remaining) = self.cooldown_remaining(now) {
            return WaitDecision::wait(remaining, WaitReason::Cooldown);
        }

        let Some(last) = self.last_request else {
            return WaitDecision::ready();
        };

        let required = compute_delay(
            config,
            self.current_delay,
            self.consecutive_failures,
            self.last_response_time(),
            rng,
        );
        let elapsed = now.saturating_duration_since(last);
        if elapsed < required {
            WaitDecision::wait(required - elapsed, WaitReason::Pacing)
        } else {
            WaitDecision::ready()
        }
    }

    /// Circuit-breaker check.
    pub fn safety_verdict(&self, config: &AntiBanConfig) -> SafetyVerdict {
        if self.captcha_detected {
            return SafetyVerdict::CaptchaDetected;
        }
        if self.consecutive_failures >= config.max_consecutive_failures {
            return SafetyVerdict::TooManyFailures {
                consecutive: self.consecutive_failures,
            };
        }
        if self.total_requests >= MIN_REQUESTS_FOR_RATIO {
            let ratio = self.successful_requests as f64 / self.total_requests as f64;
            if ratio < MIN_SUCCESS_RATIO {
                return SafetyVerdict::LowSuccessRate { ratio };
            }
        }
        SafetyVerdict::Safe
    }

    /// Snapshot of the counters.
    pub fn stats(&self, now: Instant) -> AntiBanStats {
        let success_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64 * 100.0
        };
        AntiBanStats {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.total_requests - self.successful_requests,
            success_rate,
            avg_response_time: self.average_response_time(),
            rate_limit_hits: self.rate_limit_hits,
            captcha_encounters: self.captcha_encounters,
            current_delay: self.current_delay,
            is_in_cooldown: self.is_in_cooldown(now),
        }
    }
}
