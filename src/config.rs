//! Configuration management for scrapeguard using the prefer crate.
//!
//! Durations are written in milliseconds in config files and applied on top
//! of `AntiBanConfig::default()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scrapers::anti_ban::{
    AntiBanConfig, RuleScope, SignalClassifier, SignalKind, SignalRule,
};

/// Extra blocking signature from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Regular expression, matched case-insensitively.
    pub pattern: String,
    pub kind: SignalKind,
    /// Lower values are checked first. Built-in CAPTCHA rules use 0-2.
    #[serde(default = "default_rule_priority")]
    pub priority: u16,
    /// Match against `any` (default), `text` or `html`.
    #[serde(default)]
    pub scope: RuleScope,
}

fn default_rule_priority() -> u16 {
    100
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub delay_growth_factor: Option<f64>,
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
    #[serde(default)]
    pub slow_threshold_ms: Option<u64>,
    #[serde(default)]
    pub very_slow_threshold_ms: Option<u64>,
    /// Additional blocking signatures (new locales, site-specific pages).
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Path to the config file this was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Falls back to defaults when no file is found or it fails to parse.
    pub async fn load() -> Self {
        match prefer::load("scrapeguard").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Ignoring config file: {:#}", e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path (TOML, YAML or JSON by extension).
    pub async fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::parse(&contents, path)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    fn parse(contents: &str, path: &Path) -> anyhow::Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let config = match ext {
            "json" => serde_json::from_str(contents).context("Failed to parse JSON config")?,
            "yaml" | "yml" => {
                serde_yaml::from_str(contents).context("Failed to parse YAML config")?
            }
            _ => toml::from_str(contents).context("Failed to parse TOML config")?,
        };
        Ok(config)
    }

    /// Apply configuration on top of an engine config.
    pub fn apply_to(&self, config: &mut AntiBanConfig) {
        if let Some(ms) = self.base_delay_ms {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(factor) = self.delay_growth_factor {
            config.delay_growth_factor = factor;
        }
        if let Some(ms) = self.cooldown_ms {
            config.cooldown_duration = Duration::from_millis(ms);
        }
        if let Some(max) = self.max_consecutive_failures {
            config.max_consecutive_failures = max;
        }
        if let Some(ms) = self.slow_threshold_ms {
            config.slow_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = self.very_slow_threshold_ms {
            config.very_slow_threshold = Duration::from_millis(ms);
        }
    }

    /// Effective, validated engine config.
    pub fn anti_ban_config(&self) -> Result<AntiBanConfig, ConfigError> {
        let mut config = AntiBanConfig::default();
        self.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Built-in rules plus the ones from this config.
    pub fn classifier(&self) -> Result<SignalClassifier, ConfigError> {
        let extra = self
            .rules
            .iter()
            .map(|r| {
                SignalRule::new(&r.pattern, r.kind, r.priority).map(|rule| rule.with_scope(r.scope))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SignalClassifier::with_rules(extra))
    }
}
