//! Block state shared between sessions hitting the same target.
//!
//! Sessions are independent by default. When several workers use the same
//! identity, attaching one `SharedBlockState` to each of their managers makes
//! a cooldown observed by one worker hold back all of them.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
struct SharedInner {
    rate_limit_hits: u64,
    blocked_until: Option<Instant>,
}

/// Cross-session rate-limit knowledge.
#[derive(Debug, Clone, Default)]
pub struct SharedBlockState {
    inner: Arc<RwLock<SharedInner>>,
}

impl SharedBlockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a rate-limit hit seen by any session.
    pub fn record_rate_limit(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.rate_limit_hits += 1;
    }

    /// Publish a cooldown deadline; a later deadline already set is kept.
    pub fn publish_cooldown(&self, until: Instant) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.blocked_until.map_or(true, |existing| existing < until) {
            inner.blocked_until = Some(until);
        }
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn rate_limit_hits(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rate_limit_hits
    }

    /// Clear the shared cooldown and counters.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = SharedInner::default();
    }
}
