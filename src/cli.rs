//! CLI parser and command implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::Config;
use crate::scrapers::anti_ban::{
    AntiBanConfig, AntiBanManager, AntiBanStats, SafetyVerdict, WaitReason,
};
use crate::scrapers::page_inspector::StaticPage;

#[derive(Parser)]
#[command(name = "scrapeguard")]
#[command(about = "Adaptive anti-detection throttling for browser-driven scrapers")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Base delay between requests in milliseconds
    #[arg(long, global = true, env = "SCRAPEGUARD_BASE_DELAY_MS")]
    base_delay_ms: Option<u64>,

    /// Maximum delay between requests in milliseconds
    #[arg(long, global = true, env = "SCRAPEGUARD_MAX_DELAY_MS")]
    max_delay_ms: Option<u64>,

    /// Cooldown after a severe blocking signal in milliseconds
    #[arg(long, global = true, env = "SCRAPEGUARD_COOLDOWN_MS")]
    cooldown_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a saved HTML page for blocking signals
    Classify {
        /// HTML file to inspect
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective throttling configuration
    Config,

    /// Replay a sequence of HTTP status codes through a fresh session
    Simulate {
        /// Status codes in request order (2xx/3xx count as success)
        #[arg(required = true)]
        statuses: Vec<u16>,
        /// Response time reported for every request, in milliseconds
        #[arg(long, default_value = "500")]
        response_ms: u64,
        /// Seed for reproducible jitter
        #[arg(long)]
        seed: Option<u64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    execute(Cli::parse()).await
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut file_config = match &cli.config {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::load_from_path(path).await?
        }
        None => Config::load().await,
    };
    // Flags and environment win over the file
    if cli.base_delay_ms.is_some() {
        file_config.base_delay_ms = cli.base_delay_ms;
    }
    if cli.max_delay_ms.is_some() {
        file_config.max_delay_ms = cli.max_delay_ms;
    }
    if cli.cooldown_ms.is_some() {
        file_config.cooldown_ms = cli.cooldown_ms;
    }

    let config = file_config.anti_ban_config()?;

    match cli.command {
        Commands::Classify { file, json } => cmd_classify(&file_config, config, &file, json).await,
        Commands::Config => {
            cmd_config(&file_config, &config);
            Ok(())
        }
        Commands::Simulate {
            statuses,
            response_ms,
            seed,
            json,
        } => {
            let report = simulate(config, &statuses, Duration::from_millis(response_ms), seed)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_simulation(&report);
            }
            Ok(())
        }
    }
}

async fn cmd_classify(
    file_config: &Config,
    config: AntiBanConfig,
    file: &Path,
    json: bool,
) -> anyhow::Result<()> {
    let page = StaticPage::from_file(file)?;
    let manager = AntiBanManager::with_config(config)?.with_classifier(file_config.classifier()?);
    let signal = manager.classify(&page).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&signal)?);
    } else {
        println!("signal:       {}", signal.kind.as_str());
        println!("should_retry: {}", signal.should_retry);
        println!("wait_for:     {:?}", signal.wait_for);
    }
    Ok(())
}

fn cmd_config(file_config: &Config, config: &AntiBanConfig) {
    match &file_config.source_path {
        Some(path) => println!("source:                   {}", path.display()),
        None => println!("source:                   defaults"),
    }
    println!("base_delay:               {:?}", config.base_delay);
    println!("max_delay:                {:?}", config.max_delay);
    println!("delay_growth_factor:      {}", config.delay_growth_factor);
    println!("cooldown_duration:        {:?}", config.cooldown_duration);
    println!("max_consecutive_failures: {}", config.max_consecutive_failures);
    println!("slow_threshold:           {:?}", config.slow_threshold);
    println!("very_slow_threshold:      {:?}", config.very_slow_threshold);
    println!("extra rules:              {}", file_config.rules.len());
}

/// One replayed request.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationStep {
    pub status: u16,
    /// What the gate would have asked for before this request.
    pub wait_reason: WaitReason,
    pub wait: Duration,
    pub current_delay: Duration,
    pub consecutive_failures: u32,
    pub in_cooldown: bool,
    pub verdict: SafetyVerdict,
}

/// Result of replaying a status sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub steps: Vec<SimulationStep>,
    /// Set when the circuit breaker stopped the replay early.
    pub stopped_early: bool,
    pub stats: AntiBanStats,
}

/// Replay statuses through a fresh session without sleeping, stopping once
/// the session is no longer safe.
pub fn simulate(
    config: AntiBanConfig,
    statuses: &[u16],
    response_time: Duration,
    seed: Option<u64>,
) -> anyhow::Result<SimulationReport> {
    let manager = match seed {
        Some(seed) => AntiBanManager::with_seed(config, seed)?,
        None => AntiBanManager::with_config(config)?,
    };

    let mut steps = Vec::with_capacity(statuses.len());
    let mut stopped_early = false;

    for (i, &status) in statuses.iter().enumerate() {
        let decision = manager.should_wait();
        manager.record_outcome(Some(status), response_time, (200..400).contains(&status));

        let state = manager.snapshot();
        let verdict = manager.safety_verdict();
        steps.push(SimulationStep {
            status,
            wait_reason: decision.reason,
            wait: decision.delay,
            current_delay: state.current_delay,
            consecutive_failures: state.consecutive_failures,
            in_cooldown: manager.get_stats().is_in_cooldown,
            verdict,
        });

        if !verdict.is_safe() {
            stopped_early = i + 1 < statuses.len();
            break;
        }
    }

    Ok(SimulationReport {
        steps,
        stopped_early,
        stats: manager.get_stats(),
    })
}

fn print_simulation(report: &SimulationReport) {
    println!(
        "{:>4}  {:>6}  {:>9}  {:>10}  {:>10}  {:>8}  verdict",
        "#", "status", "gate", "wait", "delay", "cooldown"
    );
    for (i, step) in report.steps.iter().enumerate() {
        println!(
            "{:>4}  {:>6}  {:>9}  {:>10}  {:>10}  {:>8}  {:?}",
            i + 1,
            step.status,
            step.wait_reason.as_str(),
            format!("{}ms", step.wait.as_millis()),
            format!("{}ms", step.current_delay.as_millis()),
            if step.in_cooldown { "yes" } else { "no" },
            step.verdict,
        );
    }
    if report.stopped_early {
        println!("stopped: session no longer safe to continue");
    }

    let stats = &report.stats;
    println!(
        "requests: {} ok / {} failed ({:.1}% success), rate limits: {}, avg response: {:?}",
        stats.successful_requests,
        stats.failed_requests,
        stats.success_rate,
        stats.rate_limit_hits,
        stats.avg_response_time
    );
}
