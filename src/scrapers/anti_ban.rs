//! Adaptive anti-detection throttling for a single scraping session.
//!
//! Decides before each request how long to wait, and after each request
//! whether the target has started blocking us and whether it is still safe
//! to continue. Backs off on failures and slow responses, enforces hard
//! cooldowns after 429/403/CAPTCHA, and recovers gradually on success.

pub mod config;
pub mod delay;
pub mod session_state;
pub mod shared;
pub mod signals;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::page_inspector::PageInspector;
use crate::error::ConfigError;
pub use config::{AntiBanConfig, AntiBanStats};
pub use session_state::{
    RequestTiming, SafetyVerdict, SessionState, WaitDecision, WaitReason,
};
pub use shared::SharedBlockState;
pub use signals::{
    BlockingSignal, RuleScope, SignalClassifier, SignalKind, SignalRule,
    CAPTCHA_WIDGET_SELECTORS,
};

/// How a cancellable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full wait elapsed (or none was needed).
    Completed(WaitDecision),
    /// The shutdown future resolved first.
    Cancelled,
}

/// Throttling engine for one scraping session.
///
/// Cloning is cheap and clones share the same session, so parallel tabs
/// driving one identity can hold a clone each. Mutations serialize on the
/// session lock.
#[derive(Debug, Clone)]
pub struct AntiBanManager {
    config: Arc<AntiBanConfig>,
    classifier: Arc<SignalClassifier>,
    state: Arc<RwLock<SessionState>>,
    rng: Arc<Mutex<StdRng>>,
    shared: Option<SharedBlockState>,
}

impl AntiBanManager {
    /// Create a manager with the default config.
    pub fn new() -> Self {
        Self::build(AntiBanConfig::default(), StdRng::from_os_rng())
    }

    /// Create a manager with a custom config.
    pub fn with_config(config: AntiBanConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, StdRng::from_os_rng()))
    }

    /// Create a manager whose jitter is reproducible.
    pub fn with_seed(config: AntiBanConfig, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, StdRng::seed_from_u64(seed)))
    }

    fn build(config: AntiBanConfig, rng: StdRng) -> Self {
        let state = SessionState::new(config.base_delay);
        Self {
            config: Arc::new(config),
            classifier: Arc::new(SignalClassifier::new()),
            state: Arc::new(RwLock::new(state)),
            rng: Arc::new(Mutex::new(rng)),
            shared: None,
        }
    }

    /// Replace the blocking-signal rule table.
    pub fn with_classifier(mut self, classifier: SignalClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Share cooldowns and rate-limit hits with other sessions.
    pub fn with_shared_state(mut self, shared: SharedBlockState) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn config(&self) -> &AntiBanConfig {
        &self.config
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next inter-request delay for the current state.
    pub fn compute_delay(&self, last_response_time: Option<Duration>) -> Duration {
        let state = self.read_state();
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        delay::compute_delay(
            &self.config,
            state.current_delay,
            state.consecutive_failures,
            last_response_time,
            &mut *rng,
        )
    }

    /// Whether the next request must wait, and for how long.
    pub fn should_wait(&self) -> WaitDecision {
        let now = Instant::now();
        let decision = {
            let mut state = self.write_state();
            if state.clear_expired_cooldown(now) {
                info!("Cooldown expired, resuming requests");
            }
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            state.wait_decision(&self.config, now, &mut *rng)
        };

        match self.shared.as_ref().and_then(|s| s.cooldown_remaining(now)) {
            Some(remaining) if remaining > decision.delay => WaitDecision {
                wait: true,
                delay: remaining,
                reason: WaitReason::Cooldown,
            },
            _ => decision,
        }
    }

    /// Sleep until the next request may be sent.
    ///
    /// This is the only suspension point; dropping the future cancels the wait.
    pub async fn wait_if_needed(&self) -> WaitDecision {
        let decision = self.should_wait();
        if decision.wait {
            debug!(
                "Waiting {:?} before next request ({})",
                decision.delay,
                decision.reason.as_str()
            );
            tokio::time::sleep(decision.delay).await;
        }
        decision
    }

    /// Like `wait_if_needed`, but returns early when `shutdown` resolves.
    pub async fn wait_if_needed_or<F>(&self, shutdown: F) -> WaitOutcome
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            decision = self.wait_if_needed() => WaitOutcome::Completed(decision),
            _ = shutdown => {
                debug!("Wait cancelled by shutdown");
                WaitOutcome::Cancelled
            }
        }
    }

    /// Report a completed request.
    pub fn record_outcome(&self, status_code: Option<u16>, response_time: Duration, success: bool) {
        let now = Instant::now();
        let (effect, current_delay, failures) = {
            let mut state = self.write_state();
            let effect =
                state.record_outcome(&self.config, status_code, response_time, success, now);
            (effect, state.current_delay, state.consecutive_failures)
        };

        if effect.success {
            debug!(
                "Request succeeded in {:?}, delay now {:?}",
                response_time, current_delay
            );
            return;
        }

        let kind = status_code.and_then(SignalKind::from_status);
        match effect.cooldown {
            Some(window) => warn!(
                "Request failed (status {:?}, {} consecutive), cooling down for {:?}, delay now {:?}",
                status_code, failures, window, current_delay
            ),
            None => debug!(
                "Request failed (status {:?}, {}), backing off to {:?}",
                status_code,
                kind.map_or("unclassified", |k| k.as_str()),
                current_delay
            ),
        }

        if let Some(shared) = &self.shared {
            if status_code == Some(429) {
                shared.record_rate_limit();
            }
            if let Some(window) = effect.cooldown {
                shared.publish_cooldown(now + window);
            }
        }
    }

    /// Classify page content already fetched by the caller.
    pub fn classify_content<F>(&self, html: &str, text: &str, dom_probe: F) -> BlockingSignal
    where
        F: FnOnce() -> bool,
    {
        let kind = self.classifier.detect(html, text, dom_probe);
        self.apply_signal(kind)
    }

    /// Inspect the current page for blocking signals.
    ///
    /// The DOM probe only runs when no textual rule matched. A failing probe
    /// counts as "no widget found".
    pub async fn classify<P>(&self, page: &P) -> anyhow::Result<BlockingSignal>
    where
        P: PageInspector + ?Sized,
    {
        let html = page.content().await?;
        let text = page.visible_text().await?;

        let kind = match self.classifier.match_text(&html, &text) {
            Some(kind) => kind,
            None => match page.has_any_of(CAPTCHA_WIDGET_SELECTORS).await {
                Ok(true) => SignalKind::Captcha,
                Ok(false) => SignalKind::None,
                Err(e) => {
                    warn!("CAPTCHA widget probe failed: {}", e);
                    SignalKind::None
                }
            },
        };

        Ok(self.apply_signal(kind))
    }

    /// Record a detected signal as a failed request.
    fn apply_signal(&self, kind: SignalKind) -> BlockingSignal {
        if kind == SignalKind::None {
            return BlockingSignal::none();
        }

        let signal = BlockingSignal::for_kind(kind, self.config.cooldown_duration);
        let now = Instant::now();
        let effect = {
            let mut state = self.write_state();
            if kind == SignalKind::Captcha {
                state.record_captcha();
            }
            // Reuse the latest latency so the signal does not skew pacing
            let response_time = state.last_response_time().unwrap_or(Duration::ZERO);
            state.record_outcome(&self.config, kind.implied_status(), response_time, false, now)
        };

        if kind == SignalKind::Captcha {
            warn!("CAPTCHA detected, session requires manual intervention");
        } else {
            warn!(
                "Blocking signal detected: {}, retry after {:?}",
                kind.as_str(),
                signal.wait_for
            );
        }

        if let Some(shared) = &self.shared {
            if kind.implied_status() == Some(429) {
                shared.record_rate_limit();
            }
            if let Some(window) = effect.cooldown {
                shared.publish_cooldown(now + window);
            }
        }

        signal
    }

    /// Circuit-breaker verdict with its reason.
    pub fn safety_verdict(&self) -> SafetyVerdict {
        self.read_state().safety_verdict(&self.config)
    }

    /// Advisory continue/stop signal for the orchestrator.
    pub fn is_safe_to_continue(&self) -> bool {
        let verdict = self.safety_verdict();
        if !verdict.is_safe() {
            info!("Session no longer safe to continue: {:?}", verdict);
        }
        verdict.is_safe()
    }

    /// Statistics snapshot.
    pub fn get_stats(&self) -> AntiBanStats {
        self.read_state().stats(Instant::now())
    }

    /// Copy of the full session state.
    pub fn snapshot(&self) -> SessionState {
        self.read_state().clone()
    }

    /// Start a fresh session; config is kept.
    pub fn reset(&self) {
        self.write_state().reset(self.config.base_delay);
        info!("Anti-ban session state reset");
    }
}

impl Default for AntiBanManager {
    fn default() -> Self {
        Self::new()
    }
}
