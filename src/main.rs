use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backup_director::{
    catalog::MemoryCatalog,
    config::Config,
    job_scheduling::{Director, JobHandlers},
    resources::Resources,
};

#[derive(Parser)]
#[command(name = "backup-director")]
#[command(version)]
#[command(about = "Backup orchestration director: schedules and runs backup jobs")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path (defaults to $DIRECTOR_CONFIG, then director.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(short = 't', long)]
    test_config: bool,

    /// Run this job as soon as the director starts
    #[arg(short = 'r', long, value_name = "JOB")]
    run: Option<String>,

    /// Replace job handlers with ones that only wait, without contacting daemons
    #[arg(long)]
    dry_run: bool,

    /// How long a dry-run job pretends to work
    #[arg(long, value_name = "DURATION", default_value = "5s", value_parser = humantime::parse_duration)]
    dry_run_duration: Duration,

    /// Print the runs scheduled within the next HOURS as JSON and exit
    #[arg(long, value_name = "HOURS")]
    upcoming: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("backup_director={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Backup Director v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    let resources = Resources::from_config(&config).context("Invalid configuration")?;

    if cli.test_config {
        info!(
            "Configuration OK: {} jobs, {} schedules, {} clients, {} storages, {} pools",
            resources.jobs.len(),
            resources.schedules.len(),
            resources.clients.len(),
            resources.storages.len(),
            resources.pools.len()
        );
        return Ok(());
    }

    let handlers = if cli.dry_run {
        warn!(
            "Dry run: jobs will not contact any daemon and finish after {}",
            humantime::format_duration(cli.dry_run_duration)
        );
        JobHandlers::dry_run(cli.dry_run_duration)
    } else {
        JobHandlers::builtin()
    };

    let catalog = Arc::new(MemoryCatalog::new());
    let director = Director::new(&config.director, resources, catalog, handlers)?;

    if let Some(hours) = cli.upcoming {
        let upcoming = director.upcoming(Utc::now(), hours);
        println!("{}", serde_json::to_string_pretty(&upcoming)?);
        return Ok(());
    }

    if let Some(job) = &cli.run {
        director
            .run_once(job)
            .with_context(|| format!("Cannot run job {job}"))?;
    }

    let cancellation_token = CancellationToken::new();
    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => signal_token.cancel(),
            Err(e) => warn!("Failed to install signal handlers: {}", e),
        }
    });

    director.run(cancellation_token).await?;
    info!("Backup Director shut down");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down gracefully");
    }
    Ok(())
}
