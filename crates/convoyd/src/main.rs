//! convoyd: the Convoy scheduler daemon.
//!
//! Runs the cluster scheduler against a simulated cluster described by a
//! scenario file:
//! - Hosts and their tags
//! - Formations and their process types
//! - A timeline of host failures, scale changes and leader flips
//!
//! # Usage
//!
//! ```text
//! convoyd simulate --scenario scenarios/basic.toml --duration 10s --backoff-period 2s
//! convoyd validate scenarios/basic.toml
//! ```

mod scenario;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use convoy_scheduler::SchedulerConfig;

use crate::scenario::{Scenario, duration};

const DEFAULT_FILTER: &str = "info,convoyd=debug,convoy_scheduler=debug";

#[derive(Parser)]
#[command(name = "convoyd", about = "Convoy cluster scheduler daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler against a simulated cluster.
    Simulate {
        /// Scenario file (TOML).
        #[arg(long)]
        scenario: PathBuf,

        /// How long to run after the last step, e.g. "10s". Runs until
        /// ctrl-c when omitted.
        #[arg(long)]
        duration: Option<String>,

        /// Override the restart back-off base, e.g. "10m".
        #[arg(long)]
        backoff_period: Option<String>,

        /// Override the failed status checks before a host is dropped.
        #[arg(long)]
        max_host_checks: Option<u32>,
    },
    /// Parse and check a scenario file without running it.
    Validate { path: PathBuf },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Simulate {
            scenario,
            duration: run_for,
            backoff_period,
            max_host_checks,
        } => {
            let overrides = CliOverrides {
                backoff_period,
                max_host_checks,
            };
            run_simulation(scenario, run_for, overrides).await
        }
        Command::Validate { path } => {
            let scenario = Scenario::from_file(&path)?;
            info!(
                path = %path.display(),
                hosts = scenario.hosts.len(),
                formations = scenario.formations.len(),
                steps = scenario.steps.len(),
                "scenario is valid"
            );
            Ok(())
        }
    }
}

/// Scheduler settings given on the command line; these win over both
/// the environment and the scenario file.
struct CliOverrides {
    backoff_period: Option<String>,
    max_host_checks: Option<u32>,
}

impl CliOverrides {
    fn apply(&self, mut config: SchedulerConfig) -> anyhow::Result<SchedulerConfig> {
        if let Some(raw) = &self.backoff_period {
            config = config.with_backoff_period(duration(raw)?);
        }
        if let Some(checks) = self.max_host_checks {
            config = config.with_max_host_checks(checks);
        }
        Ok(config)
    }
}

async fn run_simulation(path: PathBuf, run_for: Option<String>, overrides: CliOverrides) -> anyhow::Result<()> {
    // ── Load scenario ──
    let scenario = Scenario::from_file(&path)?;
    let run_for = run_for.as_deref().map(duration).transpose()?;

    // ── Configure scheduler ──
    // Environment, then scenario, then command line.
    let config = overrides.apply(scenario.scheduler_config(SchedulerConfig::from_env()?)?)?;
    config.validate()?;
    info!(
        path = %path.display(),
        backoff_period = ?config.backoff_period,
        max_host_checks = config.max_host_checks,
        "starting simulation"
    );

    // ── Run ──
    let snapshot = simulate::run(scenario, config, run_for).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
