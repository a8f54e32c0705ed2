//! End-to-end scenarios for a scraping session driven through `AntiBanManager`.
//!
//! Each test plays the orchestrator: wait, record the HTTP outcome, classify
//! the page, then consult the circuit breaker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use scrapeguard::config::Config;
use scrapeguard::{
    AntiBanConfig, AntiBanManager, PageInspector, SafetyVerdict, SignalKind, StaticPage,
    WaitOutcome, WaitReason,
};

fn config() -> AntiBanConfig {
    AntiBanConfig {
        base_delay: Duration::from_millis(2000),
        max_delay: Duration::from_millis(30_000),
        delay_growth_factor: 1.5,
        cooldown_duration: Duration::from_secs(60),
        max_consecutive_failures: 5,
        slow_threshold: Duration::from_millis(3000),
        very_slow_threshold: Duration::from_millis(5000),
    }
}

fn manager() -> AntiBanManager {
    AntiBanManager::with_seed(config(), 2024).expect("valid config")
}

/// Page whose text is harmless but whose DOM carries a CAPTCHA widget.
struct WidgetOnlyPage {
    probes: AtomicUsize,
}

#[async_trait]
impl PageInspector for WidgetOnlyPage {
    async fn content(&self) -> anyhow::Result<String> {
        Ok("<html><body><div id=\"map\"></div></body></html>".to_string())
    }

    async fn visible_text(&self) -> anyhow::Result<String> {
        Ok("Mappa dei ristoranti".to_string())
    }

    async fn has_any_of(&self, selectors: &[&str]) -> anyhow::Result<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(selectors.contains(&r#"iframe[src*="recaptcha"]"#))
    }
}

// ============================================================================
// Backoff and cooldown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn consecutive_rate_limits_escalate_delay() {
    let manager = manager();
    let mut delays = vec![manager.snapshot().current_delay];

    for _ in 0..3 {
        let recorded_at = Instant::now();
        manager.record_outcome(Some(429), Duration::from_millis(400), false);
        let state = manager.snapshot();
        assert_eq!(state.blocked_until, Some(recorded_at + Duration::from_secs(60)));
        delays.push(state.current_delay);
    }

    let millis: Vec<u128> = delays.iter().map(|d| d.as_millis()).collect();
    assert_eq!(millis, vec![2000, 3000, 4500, 6750]);
    assert_eq!(manager.get_stats().rate_limit_hits, 3);
}

#[tokio::test(start_paused = true)]
async fn cooldown_holds_until_deadline() {
    let manager = manager();
    manager.record_outcome(Some(429), Duration::from_millis(400), false);

    tokio::time::advance(Duration::from_millis(59_999)).await;
    let decision = manager.should_wait();
    assert!(decision.wait);
    assert_eq!(decision.reason, WaitReason::Cooldown);
    assert_eq!(decision.delay, Duration::from_millis(1));

    tokio::time::advance(Duration::from_millis(1)).await;
    let decision = manager.should_wait();
    assert_ne!(decision.reason, WaitReason::Cooldown);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_converge_to_max_delay() {
    let manager = manager();
    let mut previous = manager.snapshot().current_delay;
    for _ in 0..15 {
        manager.record_outcome(Some(503), Duration::from_millis(400), false);
        let current = manager.snapshot().current_delay;
        assert!(current >= previous);
        assert!(current <= config().max_delay);
        previous = current;
    }
    assert_eq!(previous, config().max_delay);
    assert_eq!(
        manager.safety_verdict(),
        SafetyVerdict::TooManyFailures { consecutive: 15 }
    );
}

#[tokio::test(start_paused = true)]
async fn slow_success_escalates_next_pacing_only() {
    let manager = manager();
    manager.record_outcome(Some(200), Duration::from_millis(6000), true);

    // Stored delay recovers toward the floor
    assert_eq!(manager.snapshot().current_delay, config().base_delay);

    // Pacing for the next request doubles: 4000ms ±20%
    let decision = manager.should_wait();
    assert_eq!(decision.reason, WaitReason::Pacing);
    assert!(decision.delay >= Duration::from_millis(3200));
    assert!(decision.delay <= Duration::from_millis(4800));
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_cooldown_wait() {
    let manager = manager();
    manager.record_outcome(Some(429), Duration::from_millis(400), false);

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .wait_if_needed_or(async {
                    let _ = rx.await;
                })
                .await
        })
    };

    tokio::time::advance(Duration::from_secs(1)).await;
    tx.send(()).expect("waiter alive");
    assert_eq!(waiter.await.expect("join"), WaitOutcome::Cancelled);
}

// ============================================================================
// Classification
// ============================================================================

#[tokio::test]
async fn italian_rate_limit_page() {
    let manager = manager();
    let page = StaticPage::new(
        "<html><body><h1>Troppe richieste</h1><p>Riprova tra qualche minuto.</p></body></html>",
    );

    let signal = manager.classify(&page).await.expect("classify");
    assert_eq!(signal.kind, SignalKind::RateLimit);
    assert!(signal.should_retry);
    assert_eq!(signal.wait_for, Duration::from_secs(120));
    assert!(manager.get_stats().is_in_cooldown);
}

#[tokio::test]
async fn captcha_widget_found_by_dom_probe() {
    let manager = manager();
    let page = WidgetOnlyPage {
        probes: AtomicUsize::new(0),
    };

    let signal = manager.classify(&page).await.expect("classify");
    assert_eq!(signal.kind, SignalKind::Captcha);
    assert!(!signal.should_retry);
    assert_eq!(page.probes.load(Ordering::SeqCst), 1);

    assert!(!manager.is_safe_to_continue());

    // The next page loads fine, but only a reset lifts the CAPTCHA stop
    manager.record_outcome(Some(200), Duration::from_millis(300), true);
    assert_eq!(manager.safety_verdict(), SafetyVerdict::CaptchaDetected);

    manager.reset();
    assert!(manager.is_safe_to_continue());
}

#[tokio::test]
async fn clean_page_skips_state_changes() {
    let manager = manager();
    let page = StaticPage::new(
        "<html><body><h2>Trattoria Da Luigi</h2><p>4,6 stelle</p></body></html>",
    );

    let signal = manager.classify(&page).await.expect("classify");
    assert!(!signal.is_blocked());
    assert_eq!(manager.get_stats().total_requests, 0);
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[test]
fn mixed_outcomes_remain_safe_with_elevated_delay() {
    let manager = manager();
    let outcomes = [true, false, true, true, false, true, false, true, false, true];
    for ok in outcomes {
        let status = if ok { 200 } else { 500 };
        manager.record_outcome(Some(status), Duration::from_millis(700), ok);
    }

    let stats = manager.get_stats();
    assert_eq!(stats.total_requests, 10);
    assert_eq!(stats.successful_requests, 6);
    assert_eq!(stats.success_rate, 60.0);
    assert!(manager.is_safe_to_continue());
    assert!(stats.current_delay > config().base_delay);
}

#[test]
fn forty_percent_success_is_unsafe() {
    let manager = manager();
    let outcomes = [true, false, false, true, false, false, true, false, true, false];
    for ok in outcomes {
        let status = if ok { 200 } else { 500 };
        manager.record_outcome(Some(status), Duration::from_millis(700), ok);
    }
    assert!(matches!(
        manager.safety_verdict(),
        SafetyVerdict::LowSuccessRate { .. }
    ));
    assert!(!manager.is_safe_to_continue());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_workers_serialize_failures() {
    let manager = AntiBanManager::with_seed(
        AntiBanConfig {
            max_consecutive_failures: 1000,
            ..config()
        },
        1,
    )
    .expect("valid config");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    manager.record_outcome(Some(500), Duration::from_millis(100), false);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("join");
    }

    let state = manager.snapshot();
    assert_eq!(state.consecutive_failures, 200);
    assert_eq!(state.total_requests, 200);
    assert_eq!(state.current_delay, config().max_delay);
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn config_file_drives_manager() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("scrapeguard.toml");
    std::fs::write(
        &path,
        r#"
base_delay_ms = 500
max_delay_ms = 8000
cooldown_ms = 10000

[[rules]]
pattern = "veuillez patienter"
kind = "unusual_traffic"
priority = 42
"#,
    )
    .expect("write config");

    let file_config = Config::load_from_path(&path).await.expect("load");
    let manager = AntiBanManager::with_config(file_config.anti_ban_config().expect("valid"))
        .expect("valid")
        .with_classifier(file_config.classifier().expect("rules"));

    let signal = manager.classify_content("", "Veuillez patienter...", || false);
    assert_eq!(signal.kind, SignalKind::UnusualTraffic);
    assert_eq!(signal.wait_for, Duration::from_secs(15));
    assert_eq!(manager.config().base_delay, Duration::from_millis(500));
}
