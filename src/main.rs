//! flurry: exports Athena query execution history to S3 as gzipped NDJSON.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use flurry::config::Config;
use flurry::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use flurry::{metrics, run_pipeline};

/// Athena query execution history exporter.
#[derive(Parser, Debug)]
#[command(name = "flurry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Destination bucket name, or a storage URL (s3://, file://, memory://).
    bucket: String,

    /// Key prefix for uploaded objects.
    prefix: String,

    /// Path to an optional configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("flurry starting");

    let config = build_config(&args)?;

    // Initialize metrics if enabled
    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Destination: {}", config.destination.storage_url());
        info!("Prefix: {}", config.destination.prefix);
        info!(
            "Work group: {}",
            config.catalog.work_group.as_deref().unwrap_or("(default)")
        );
        info!(
            "Batch size: {}, workers: {}",
            config.pipeline.max_batch_size, config.pipeline.max_workers
        );
        info!("Configuration is valid");
        return Ok(());
    }

    let stats = run_pipeline(config).await?;

    info!("Pipeline completed successfully");
    info!("  Batches dispatched: {}", stats.batches_dispatched);
    info!("  Executions listed: {}", stats.ids_dispatched);
    info!("  Batches uploaded: {}", stats.batches_processed);
    info!("  Records processed: {}", stats.records_processed);
    info!("  Batches failed: {}", stats.batches_failed);
    info!("  Batches re-queued: {}", stats.batches_requeued);
    info!("  Bytes uploaded: {}", stats.bytes_uploaded);

    Ok(())
}

/// Build configuration from the optional file and the positional arguments.
fn build_config(args: &Args) -> Result<Config, PipelineError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).context(ConfigSnafu)?,
        None => Config::default(),
    };
    config.destination.bucket = args.bucket.clone();
    config.destination.prefix = args.prefix.clone();
    config.validate().context(ConfigSnafu)?;
    Ok(config)
}
