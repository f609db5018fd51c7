//! Command-line interface for ch-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # Verify wal_level, replication privileges and ClickHouse grants
//! ch-sync --config ch-sync.toml preflight
//!
//! # One-shot run of every pipeline (the default command)
//! ch-sync --config ch-sync.toml
//!
//! # Long-lived scheduled loop, JSON logs
//! ch-sync --log-format json run --every 15m
//!
//! # Start a CDC pipeline over: drop its slots and run history
//! ch-sync reset logs
//! ```
//!
//! Exit codes: 0 on success, 1 for configuration and preflight errors,
//! 2 for any other failure.

use anyhow::Context;
use ch_sync::config::parse_duration;
use ch_sync::connect::{build_orchestrator, preflight};
use ch_sync::{exit_code, Config};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ch-sync")]
#[command(about = "Replicate PostgreSQL tables into ClickHouse")]
#[command(long_about = None)]
struct Cli {
    /// Pipeline configuration file
    #[arg(long, short, env = "CH_SYNC_CONFIG", default_value = "ch-sync.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "CH_SYNC_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pipelines once, or on a schedule with --every
    Run {
        /// Only run these pipelines (repeatable; default: all)
        #[arg(long = "pipeline", value_name = "NAME")]
        pipelines: Vec<String>,

        /// Keep running, starting a new run at this interval (e.g. "15m")
        #[arg(long, value_name = "DURATION")]
        every: Option<String>,

        /// Skip source and destination checks before running
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Check source and destination prerequisites and exit
    Preflight {
        /// Only check what these pipelines use (repeatable; default: all)
        #[arg(long = "pipeline", value_name = "NAME")]
        pipelines: Vec<String>,
    },

    /// Drop a pipeline's replication slots and run history
    Reset {
        /// Pipeline name
        pipeline: String,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancelled on the first Ctrl-C. In-flight batches still finish and are
/// acknowledged before the process exits.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt signal, finishing in-flight work");
                trigger.cancel();
            }
            Err(e) => error!("Failed to install Ctrl-C handler: {e}"),
        }
    });
    token
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    if let Err(e) = run(cli).await {
        error!("❌ {e:#}");
        std::process::exit(exit_code(&e));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let command = cli.command.unwrap_or(Commands::Run {
        pipelines: Vec::new(),
        every: None,
        skip_preflight: false,
    });

    match command {
        Commands::Preflight { pipelines } => preflight(&config, &pipelines).await,
        Commands::Reset { pipeline } => {
            let orchestrator = build_orchestrator(&config)?;
            orchestrator.reset(&pipeline).await
        }
        Commands::Run {
            pipelines,
            every,
            skip_preflight,
        } => {
            let interval = every
                .as_deref()
                .map(parse_duration)
                .transpose()
                .context("Invalid --every")
                .map_err(|e| sync_core::SyncError::config(format!("{e:#}")))?;

            if !skip_preflight {
                preflight(&config, &pipelines).await?;
            }
            let orchestrator = build_orchestrator(&config)?;
            let cancel = shutdown_token();

            match interval {
                Some(interval) => orchestrator.run_every(&pipelines, interval, &cancel).await,
                None => orchestrator.run(&pipelines, &cancel).await?.into_result(),
            }
        }
    }
}
