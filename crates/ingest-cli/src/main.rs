//! `ingest` CLI -- run the feed ingestion pipeline over a local calendar file.
//!
//! ## Usage
//!
//! ```sh
//! # Expand a feed (stdin -> stdout) over the next 14 days
//! cat calendar.ics | ingest expand
//!
//! # Expand from file to file, for a fixed window
//! ingest expand -i calendar.ics -o events.json --start 2025-01-06 --window-days 7
//!
//! # Use a config file, overriding the fallback zone
//! ingest expand -i calendar.ics --config ingest.toml --timezone Europe/Berlin
//!
//! # Summarize what a feed produces
//! ingest stats -i calendar.ics
//! ```
//!
//! Logging goes to stderr. `RUST_LOG` takes precedence over `--log-level`.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Args, Parser, Subcommand};
use ingest_engine::telemetry::Termination;
use ingest_engine::{bridge, IngestConfig, IngestPipeline, IngestReport, RunStatus};
use tracing_subscriber::EnvFilter;

/// Warnings listed by `stats` before the rest are summarized.
const SHOWN_WARNINGS: usize = 10;

#[derive(Parser)]
#[command(name = "ingest", version, about = "Calendar feed ingestion CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level used when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a feed into event instances (JSON report)
    Expand {
        #[command(flatten)]
        feed: FeedArgs,
        /// Output file (writes to stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Show a summary of an ingestion run
    Stats {
        #[command(flatten)]
        feed: FeedArgs,
    },
}

#[derive(Args)]
struct FeedArgs {
    /// Input .ics file (reads from stdin if omitted)
    #[arg(short, long)]
    input: Option<String>,
    /// Window start date, YYYY-MM-DD (defaults to today, UTC)
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Window length in days (overrides the config file)
    #[arg(long)]
    window_days: Option<u32>,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Fallback timezone for floating and unknown times (overrides the config file)
    #[arg(long)]
    timezone: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Expand { feed, output } => {
            let report = run(&feed)?;
            let json =
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
            write_output(output.as_deref(), &json)?;
        }
        Commands::Stats { feed } => {
            let report = run(&feed)?;
            print!("{}", render_stats(&report));
        }
    }

    Ok(())
}

fn build_config(args: &FeedArgs) -> Result<IngestConfig> {
    let mut config = match &args.config {
        Some(path) => IngestConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => IngestConfig::default(),
    };
    if let Some(days) = args.window_days {
        config.window.days = days;
    }
    if let Some(tz) = &args.timezone {
        config.timezone.default = tz.clone();
    }
    Ok(config)
}

fn window_start(start: Option<NaiveDate>) -> DateTime<Utc> {
    start
        .unwrap_or_else(|| Utc::now().date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc()
}

fn run(args: &FeedArgs) -> Result<IngestReport> {
    let config = build_config(args)?;
    let pipeline = IngestPipeline::new(config).context("Invalid configuration")?;
    let start = window_start(args.start);
    tracing::debug!(%start, "Starting ingestion");

    bridge::block_on(async {
        match args.input.as_deref() {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to read file: {path}"))?;
                let size = file.metadata().await.ok().map(|m| m.len());
                pipeline
                    .run_reader(path, file, size, start)
                    .await
                    .with_context(|| format!("Failed to ingest {path}"))
            }
            None => pipeline
                .run_reader("stdin", tokio::io::stdin(), None, start)
                .await
                .context("Failed to ingest stdin"),
        }
    })?
}

fn render_stats(report: &IngestReport) -> String {
    let t = &report.telemetry;
    let mut out = String::new();
    let status = match report.status {
        RunStatus::Complete => "complete",
        RunStatus::Partial => "partial",
    };
    out.push_str(&format!(
        "Window:      {} .. {}\n",
        report.window.start.to_rfc3339(),
        report.window.end.to_rfc3339()
    ));
    out.push_str(&format!("Status:      {status}\n"));
    out.push_str(&format!("Events:      {}\n", report.events.len()));
    out.push_str(&format!("Processed:   {}\n", t.processed));
    out.push_str(&format!(
        "Duplicates:  {} ({:.1}%)\n",
        t.duplicates,
        t.duplicate_ratio * 100.0
    ));
    out.push_str(&format!("Warnings:    {}\n", t.warning_count));
    if let Some(reason) = t.termination {
        let reason = match reason {
            Termination::CircuitBreaker => "circuit breaker",
            Termination::EventCeiling => "event ceiling",
            Termination::Deadline => "deadline",
        };
        out.push_str(&format!("Stopped by:  {reason}\n"));
    }
    if report.truncated {
        out.push_str("Truncated:   yes\n");
    }
    for warning in t.warnings.iter().take(SHOWN_WARNINGS) {
        out.push_str(&format!("  - {warning}\n"));
    }
    if t.warning_count > SHOWN_WARNINGS {
        out.push_str(&format!(
            "  ... and {} more\n",
            t.warning_count - SHOWN_WARNINGS
        ));
    }
    out
}

fn write_output(path: Option<&str>, content: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write file: {}", path))?;
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{content}").context("Failed to write to stdout")?;
        }
    }
    Ok(())
}
