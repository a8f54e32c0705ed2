//! scrapeguard - adaptive anti-detection throttling for browser-driven scrapers.
//!
//! The engine sits between a scrape orchestrator and the target site. Before
//! each request it says how long to wait; after each request it records the
//! outcome, inspects the page for blocking signals, and reports whether the
//! session is still safe to continue.

pub mod cli;
pub mod config;
pub mod error;
pub mod scrapers;

pub use error::ConfigError;
pub use scrapers::anti_ban::{
    AntiBanConfig, AntiBanManager, AntiBanStats, BlockingSignal, SafetyVerdict,
    SharedBlockState, SignalClassifier, SignalKind, WaitDecision, WaitOutcome, WaitReason,
};
pub use scrapers::page_inspector::{PageInspector, StaticPage};
