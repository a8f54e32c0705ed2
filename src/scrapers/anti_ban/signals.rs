//! Blocking signal classification.
//!
//! Page content is matched against a table of known blocking signatures
//! (CAPTCHA walls, rate-limit pages, access-denied notices, "unusual traffic"
//! interstitials). Rules are evaluated in ascending priority and the first
//! match wins, so CAPTCHA rules sit at the top: a CAPTCHA page often also
//! says "too many requests", and CAPTCHA is the one condition that needs
//! outside intervention.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::config::scale_ms;
use crate::error::ConfigError;

/// CSS selectors for known CAPTCHA widgets, passed to the DOM probe.
pub const CAPTCHA_WIDGET_SELECTORS: &[&str] = &[
    r#"iframe[src*="recaptcha"]"#,
    r#"iframe[src*="hcaptcha"]"#,
    r#"iframe[src*="challenges.cloudflare.com"]"#,
    r#"iframe[title*="reCAPTCHA"]"#,
    ".g-recaptcha",
    ".h-captcha",
    ".cf-turnstile",
    "[data-sitekey]",
    "#captcha-form",
];

/// Kind of blocking signal detected on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    None,
    Captcha,
    RateLimit,
    /// HTTP 403 or an access-denied page.
    Forbidden,
    /// HTTP 429 error page.
    TooManyRequests,
    UnusualTraffic,
    Timeout,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::None => "none",
            SignalKind::Captcha => "captcha",
            SignalKind::RateLimit => "rate_limit",
            SignalKind::Forbidden => "forbidden",
            SignalKind::TooManyRequests => "too_many_requests",
            SignalKind::UnusualTraffic => "unusual_traffic",
            SignalKind::Timeout => "timeout",
        }
    }

    /// Map an HTTP status to the signal it implies, if any.
    pub fn from_status(status_code: u16) -> Option<Self> {
        match status_code {
            429 => Some(SignalKind::TooManyRequests),
            403 => Some(SignalKind::Forbidden),
            408 | 504 => Some(SignalKind::Timeout),
            _ => None,
        }
    }

    /// HTTP status recorded as the failure when this signal is found in page content.
    pub fn implied_status(&self) -> Option<u16> {
        match self {
            SignalKind::RateLimit | SignalKind::TooManyRequests => Some(429),
            SignalKind::Forbidden => Some(403),
            _ => None,
        }
    }

    /// Wait multiplier relative to the configured cooldown.
    pub fn cooldown_multiplier(&self) -> f64 {
        match self {
            SignalKind::None => 0.0,
            SignalKind::Captcha => 3.0,
            SignalKind::RateLimit | SignalKind::TooManyRequests | SignalKind::Forbidden => 2.0,
            SignalKind::UnusualTraffic => 1.5,
            SignalKind::Timeout => 1.0,
        }
    }

    /// CAPTCHA cannot be resolved by waiting.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SignalKind::Captcha)
    }
}

/// Result of classifying a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockingSignal {
    pub kind: SignalKind,
    pub should_retry: bool,
    pub wait_for: Duration,
}

impl BlockingSignal {
    /// No blocking signal detected.
    pub fn none() -> Self {
        Self {
            kind: SignalKind::None,
            should_retry: true,
            wait_for: Duration::ZERO,
        }
    }

    /// Build the signal for a detected kind, scaling the wait from the cooldown.
    pub fn for_kind(kind: SignalKind, cooldown: Duration) -> Self {
        if kind == SignalKind::None {
            return Self::none();
        }
        Self {
            kind,
            should_retry: kind.is_retryable(),
            wait_for: scale_ms(cooldown, kind.cooldown_multiplier()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.kind != SignalKind::None
    }
}

/// Which part of the page a rule is matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Raw HTML and visible text.
    #[default]
    Any,
    /// Visible text only. Keeps words in scripts and attributes from matching.
    Text,
    /// Raw HTML only, for markup markers.
    Html,
}

/// A single pattern in the rule table.
#[derive(Debug, Clone)]
pub struct SignalRule {
    pub pattern: Regex,
    pub kind: SignalKind,
    /// Lower values are checked first.
    pub priority: u16,
    pub scope: RuleScope,
}

impl SignalRule {
    /// Compile a case-insensitive rule.
    pub fn new(pattern: &str, kind: SignalKind, priority: u16) -> Result<Self, ConfigError> {
        let compiled = Regex::new(&format!("(?i){}", pattern)).map_err(|source| {
            ConfigError::InvalidRule {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            pattern: compiled,
            kind,
            priority,
            scope: RuleScope::Any,
        })
    }

    /// Restrict the rule to part of the page.
    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    fn matches(&self, html: &str, text: &str) -> bool {
        match self.scope {
            RuleScope::Any => self.pattern.is_match(text) || self.pattern.is_match(html),
            RuleScope::Text => self.pattern.is_match(text),
            RuleScope::Html => self.pattern.is_match(html),
        }
    }
}

/// Built-in signatures: (pattern, kind, priority, scope).
const DEFAULT_RULE_SPECS: &[(&str, SignalKind, u16, RuleScope)] = &[
    // CAPTCHA
    (r"captcha", SignalKind::Captcha, 0, RuleScope::Text),
    (
        r"(?:i'?m|i am|you'?re|you are) not a robot|verify (?:that )?you(?:'re| are) (?:a )?human",
        SignalKind::Captcha,
        1,
        RuleScope::Any,
    ),
    (
        r"non sono un robot|(?:verifica|dimostra|conferma)(?:re)? (?:di|che) non (?:essere|sei) un robot",
        SignalKind::Captcha,
        2,
        RuleScope::Any,
    ),
    (
        r#"class="[^"]*\b(?:g-recaptcha|h-captcha|cf-turnstile)\b|data-sitekey="#,
        SignalKind::Captcha,
        3,
        RuleScope::Html,
    ),
    // HTTP error pages
    (r"\b429\b[^<\n]{0,40}too many requests", SignalKind::TooManyRequests, 10, RuleScope::Any),
    (r"\b403\b[^<\n]{0,40}forbidden", SignalKind::Forbidden, 11, RuleScope::Any),
    // Rate limit
    (
        r"too many requests|rate[- ]?limit(?:ed|ing)?\b|troppe richieste",
        SignalKind::RateLimit,
        20,
        RuleScope::Any,
    ),
    (
        r"demasiadas solicitudes|zu viele anfragen|trop de requêtes",
        SignalKind::RateLimit,
        21,
        RuleScope::Any,
    ),
    // Access denied
    (
        r"access denied|accesso negato|accesso vietato|you(?:'ve| have)? been blocked",
        SignalKind::Forbidden,
        30,
        RuleScope::Any,
    ),
    (r"acceso denegado|zugriff verweigert|accès refusé", SignalKind::Forbidden, 31, RuleScope::Any),
    // Unusual traffic
    (
        r"unusual traffic|our systems have detected|traffico insolito|traffico anomalo|i nostri sistemi hanno rilevato",
        SignalKind::UnusualTraffic,
        40,
        RuleScope::Any,
    ),
    (
        r"tráfico inusual|ungewöhnlichen datenverkehr|trafic exceptionnel",
        SignalKind::UnusualTraffic,
        41,
        RuleScope::Any,
    ),
    // Timeouts
    (
        r"err_(?:connection_)?timed_out|(?:request|connection) timed out|gateway time-?out",
        SignalKind::Timeout,
        50,
        RuleScope::Any,
    ),
];

static DEFAULT_RULES: LazyLock<Vec<SignalRule>> = LazyLock::new(|| {
    DEFAULT_RULE_SPECS
        .iter()
        .map(|(pattern, kind, priority, scope)| {
            SignalRule::new(pattern, *kind, *priority)
                .unwrap()
                .with_scope(*scope)
        })
        .collect()
});

/// Ordered rule table for detecting blocking pages.
#[derive(Debug, Clone)]
pub struct SignalClassifier {
    rules: Vec<SignalRule>,
}

impl SignalClassifier {
    /// Classifier with the built-in signatures.
    pub fn new() -> Self {
        Self::from_rules(DEFAULT_RULES.clone())
    }

    /// Classifier with the built-in signatures plus extra rules.
    pub fn with_rules(extra: Vec<SignalRule>) -> Self {
        let mut rules = DEFAULT_RULES.clone();
        rules.extend(extra);
        Self::from_rules(rules)
    }

    /// Classifier with exactly the given rules.
    pub fn from_rules(mut rules: Vec<SignalRule>) -> Self {
        // Stable sort keeps insertion order among equal priorities
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    pub fn rules(&self) -> &[SignalRule] {
        &self.rules
    }

    /// First textual rule matching the HTML or visible text.
    pub fn match_text(&self, html: &str, text: &str) -> Option<SignalKind> {
        self.rules
            .iter()
            .find(|rule| rule.matches(html, text))
            .map(|rule| rule.kind)
    }

    /// Classify page content, falling back to the DOM probe for CAPTCHA widgets.
    ///
    /// The probe is only run when no textual rule matches.
    pub fn detect<F>(&self, html: &str, text: &str, dom_probe: F) -> SignalKind
    where
        F: FnOnce() -> bool,
    {
        if let Some(kind) = self.match_text(html, text) {
            return kind;
        }
        if dom_probe() {
            SignalKind::Captcha
        } else {
            SignalKind::None
        }
    }
}

impl Default for SignalClassifier {
    fn default() -> Self {
        Self::new()
    }
}
