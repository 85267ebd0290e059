//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modelkeeper_service::artifacts::{ArtifactManager, FastStorage, HttpFetcher};
use modelkeeper_service::config::Config;
use modelkeeper_service::metrics;
use modelkeeper_service::models::{GpuProbe, NvidiaSmiProbe};
use modelkeeper_service::services::SharedServices;
use modelkeeper_service::sweeper;

use crate::logging;

/// modelkeeper commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Acquire model artifacts, then run the writer and the expiry sweeper until interrupted.
    Run,

    /// Remove expired records once.
    Cleanup {
        /// Only count the records that would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Download the configured model artifacts and print their status as JSON.
    Download,

    /// Print the detected GPUs as JSON.
    Gpu,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "modelkeeper", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(concat!("modelkeeper@", env!("CARGO_PKG_VERSION")).into()),
        enable_logs: true,
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is only created below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("modelkeeper")
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    match cli.command {
        Command::Run => runtime.block_on(run(config))?,
        Command::Cleanup { dry_run } => {
            let stats = runtime
                .block_on(sweeper::cleanup(&config, dry_run))
                .context("failed to remove expired records")?;
            if dry_run {
                tracing::info!("Would remove {} records", stats.total());
            }
        }
        Command::Download => runtime.block_on(download(config))?,
        Command::Gpu => {
            let info = runtime.block_on(NvidiaSmiProbe::new(config.gpu.detect).gpu_info());
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let services = SharedServices::new(config)
        .await
        .context("failed to start services")?;

    let report = services
        .artifacts
        .acquire_all()
        .await
        .context("failed to acquire model artifacts")?;
    for status in report.statuses.iter().filter(|status| !status.is_success()) {
        tracing::warn!("Model artifact {} unavailable: {}", status.url, status.message);
    }

    tracing::info!("modelkeeper is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    services.shutdown().await;
    Ok(())
}

async fn download(config: Config) -> Result<()> {
    let fetcher = HttpFetcher::new(Duration::from_secs(30)).context("failed to create HTTP client")?;
    let artifacts = ArtifactManager::new(
        config.models.clone(),
        FastStorage::prepare(&config.fast_storage),
        Arc::new(fetcher),
    );

    let report = artifacts
        .acquire_all()
        .await
        .context("failed to acquire model artifacts")?;
    println!("{}", serde_json::to_string_pretty(&report.statuses)?);

    let failed = report.statuses.iter().filter(|s| !s.is_success()).count();
    if failed > 0 {
        anyhow::bail!("{failed} model artifacts could not be acquired");
    }
    Ok(())
}
