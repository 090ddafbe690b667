//! # Newspaper Harvest
//!
//! Builds a historical newspaper corpus from two digitised collections: the
//! ANNO viewer of the Austrian National Library and the newspaper portal of
//! the Deutsche Digitale Bibliothek (DDB).
//!
//! ## Usage
//!
//! ```sh
//! newspaper_harvest anno-index
//! newspaper_harvest anno-select
//! newspaper_harvest run --workers 12
//! newspaper_harvest merge
//! ```
//!
//! ## Architecture
//!
//! The ANNO pipeline:
//! 1. **Indexing**: walk the newspaper list, year pages and calendars into an issue CSV
//! 2. **Selection**: keep the issues of the configured titles
//! 3. **Scraping**: `N` worker processes, each owning a static partition of the
//!    issues, fetch pages until the first empty or placeholder page. Every
//!    worker appends to its own output CSV and JSON checkpoint, so an
//!    interrupted run resumes without refetching.
//! 4. **Merge**: all worker files into one sorted CSV
//!
//! The DDB pipeline queries title time spans, selects titles and fetches page
//! fulltext through the search API.

use clap::Parser;
use std::error::Error;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod error;
mod fetcher;
mod issue;
mod models;
mod orchestrator;
mod outputs;
mod progress;
mod selection;
mod sources;
mod transport;
mod utils;
mod worker;

use cli::{Cli, Command};
use config::{HarvestConfig, load_config};
use orchestrator::WorkerLauncher;
use sources::ddb::DdbClient;
use transport::HttpTransport;
use utils::{ensure_parent_writable, ensure_writable_dir};

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();

    let args = Cli::parse();
    debug!(command = ?args.command, config = ?args.config, "Parsed CLI arguments");

    let config = load_config(args.config.as_deref())?
        .with_overrides(args.proxy.clone(), args.ddb_api_key.clone());

    if let Err(e) = dispatch(&args, &config).await {
        error!(command = ?args.command, error = %e, "Command failed");
        return Err(e);
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    Ok(())
}

async fn dispatch(args: &Cli, config: &HarvestConfig) -> Result<(), Box<dyn Error>> {
    match &args.command {
        Command::AnnoIndex => {
            ensure_parent_writable(&config.paths.metadata_csv).await?;
            let transport = HttpTransport::from_config(&config.anno)?;
            let rows = sources::anno::run_index(transport, &config.anno, &config.paths.metadata_csv).await?;
            info!(rows, "ANNO index complete");
        }
        Command::AnnoSelect => {
            ensure_parent_writable(&config.paths.issues_csv).await?;
            let rows = selection::run_anno_select(config)?;
            info!(rows, "ANNO selection complete");
        }
        Command::Worker {
            worker_id,
            total_workers,
        } => {
            let report = worker::run_worker(config, *worker_id, *total_workers).await?;
            if report.access_denied {
                warn!(worker_id, "Worker stopped after access was denied");
            }
        }
        Command::Run { workers } => {
            ensure_writable_dir(&config.paths.backup_dir).await?;
            let launcher = WorkerLauncher::current_exe(args.config.as_deref(), config.anno.proxy.as_deref())?;
            info!(workers, "Starting workers");
            let exits = launcher.run_all(*workers).await;
            let failed: Vec<usize> = exits.iter().filter(|e| !e.success()).map(|e| e.worker_id).collect();
            if failed.is_empty() {
                info!(workers, "All workers finished");
            } else {
                warn!(failed = ?failed, "Some workers exited with failure; rerun to resume them");
            }
        }
        Command::Merge => {
            let rows = outputs::merge::merge_worker_outputs(&config.paths.backup_dir, &config.paths.merged_csv)?;
            info!(rows, path = %config.paths.merged_csv.display(), "Merge complete");
        }
        Command::DdbTimespans => {
            let client = ddb_client(config)?;
            let rows = sources::ddb::run_timespans(&client, &config.ddb).await?;
            info!(rows, "DDB time spans complete");
        }
        Command::DdbSelect => {
            let rows = selection::run_ddb_select(&config.ddb)?;
            info!(rows, "DDB selection complete");
        }
        Command::DdbPages => {
            let client = ddb_client(config)?;
            let rows = sources::ddb::run_pages(&client, &config.ddb).await?;
            info!(rows, "DDB pages complete");
        }
    }
    Ok(())
}

/// The ANNO proxy is not used for the DDB API.
fn ddb_client(config: &HarvestConfig) -> error::Result<DdbClient<HttpTransport>> {
    let http_config = config::AnnoConfig {
        proxy: None,
        ..config.anno.clone()
    };
    DdbClient::new(HttpTransport::from_config(&http_config)?, &config.ddb, config.anno.index_attempts.saturating_sub(1))
}
