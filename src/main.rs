//! insider-tracker command-line entry point.
//!
//! Loads configuration and `.env`, initialises structured logging, then
//! runs one pass (`run`, `acquire`, `reconcile`), loops on a schedule
//! (`watch`) or prints the stored datasets (`show`). A fatal pipeline
//! error exits non-zero.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use insider_tracker::config::AppConfig;
use insider_tracker::engine::schedule::within_window;
use insider_tracker::engine::{Pipeline, RunReport};
use insider_tracker::storage::Datasets;

#[derive(Debug, Parser)]
#[command(name = "insider-tracker", version, about = "Insider-purchase tracker and price reconciler")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Print run reports as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One full pass: discover filings, fetch quotes, reconcile (default).
    Run,
    /// Discover filings and fetch quotes, without touching prices in the ledger.
    Acquire,
    /// Reconcile the ledger against the last saved quotes.
    Reconcile {
        /// Skip the bought-price lookup.
        #[arg(long)]
        no_backfill: bool,
    },
    /// Run a pass every `schedule.interval_secs` inside the active window.
    Watch {
        /// Run every tick regardless of the window.
        #[arg(long)]
        ignore_window: bool,
    },
    /// Print the stored quotes and holdings.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    init_logging();

    let mut cfg = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Loading {}", cli.config.display()))?;
    if let Some(dir) = &cli.data_dir {
        cfg.storage.data_dir = dir.clone();
    }

    let command = cli.command.unwrap_or(Command::Run);
    debug!(?command, config = %cli.config.display(), "Starting");

    match command {
        Command::Show => show(&cfg),
        Command::Watch { ignore_window } => watch(&cfg, ignore_window, cli.json).await,
        Command::Reconcile { no_backfill } => {
            if no_backfill {
                cfg.reconciliation.backfill = false;
            }
            let pipeline = Pipeline::from_config(&cfg)?;
            emit(&pipeline.reconcile_only().await?, cli.json)
        }
        Command::Acquire => {
            let pipeline = Pipeline::from_config(&cfg)?;
            emit(&pipeline.acquire_only().await?, cli.json)
        }
        Command::Run => {
            let pipeline = Pipeline::from_config(&cfg)?;
            emit(&pipeline.run().await?, cli.json)
        }
    }
}

/// Loop passes on the configured interval until Ctrl+C.
///
/// A failed pass is logged and the loop waits for the next tick.
async fn watch(cfg: &AppConfig, ignore_window: bool, json: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(cfg)?;

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.schedule.interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.schedule.interval_secs,
        start_hour = cfg.schedule.start_hour,
        end_hour = cfg.schedule.end_hour,
        weekdays_only = cfg.schedule.weekdays_only,
        "Watching. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !ignore_window && !within_window(Utc::now(), &cfg.schedule) {
                    debug!("Outside the active window, skipping tick");
                    continue;
                }
                match pipeline.run().await {
                    Ok(report) => {
                        if let Err(e) = emit(&report, json) {
                            warn!(error = %e, "Failed to print run report");
                        }
                    }
                    Err(e) => error!(error = %e, fatal = e.is_fatal(), "Pass failed, waiting for next tick"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    Ok(())
}

fn show(cfg: &AppConfig) -> Result<()> {
    let datasets = Datasets::from_config(&cfg.storage);

    let snapshot = datasets.load_snapshot()?;
    println!("{} ({} quotes)", datasets.quotes_location(), snapshot.len());
    for record in snapshot.records() {
        println!("  {record}");
    }

    let holdings = datasets.load_holdings()?;
    println!("{} ({} holdings)", datasets.holdings_location(), holdings.len());
    for holding in &holdings {
        println!("  {holding}");
    }
    Ok(())
}

fn emit(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

/// Initialise the `tracing` subscriber. Logs go to stderr so stdout
/// stays clean for reports.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("insider_tracker=info"));

    let json_logging = std::env::var("INSIDER_TRACKER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
