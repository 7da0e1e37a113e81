//! Prometheus metrics endpoint for flurry.
//!
//! Exports are most useful for long backfills, where batch throughput and
//! retry counts can be watched while the run is in progress.

use axum::{Extension, Router, routing::get};
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::error;

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Initialize the Prometheus metrics exporter with an HTTP endpoint.
///
/// This starts an HTTP server on the given address that exposes:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - Health check endpoint (returns 200 OK)
///
/// Must be called from within a tokio runtime.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    describe_metrics();
    tokio::spawn(run_server(addr, handle));

    Ok(())
}

/// Remote calls range from tens of milliseconds to tens of seconds with backoff.
const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

fn describe_metrics() {
    describe_counter!(
        "flurry_execution_ids_listed_total",
        "Execution ids returned by the listing API"
    );
    describe_counter!(
        "flurry_batches_dispatched_total",
        "Batches submitted to the worker pool"
    );
    describe_counter!(
        "flurry_records_processed_total",
        "Execution records uploaded"
    );
    describe_counter!(
        "flurry_bytes_uploaded_total",
        Unit::Bytes,
        "Compressed bytes uploaded"
    );
    describe_counter!(
        "flurry_batches_processed_total",
        "Batch outcomes by status (success, requeued, failed)"
    );
    describe_counter!(
        "flurry_batches_failed_total",
        "Abandoned batches by failure stage"
    );
    describe_counter!(
        "flurry_unprocessed_executions_total",
        "Execution ids the describe API could not return"
    );
    describe_counter!(
        "flurry_call_retries_total",
        "Retried remote calls by operation"
    );
    describe_gauge!(
        "flurry_batches_in_flight",
        "Batches submitted but not yet done"
    );
    describe_gauge!("flurry_active_workers", "Workers processing a batch");
    describe_histogram!(
        "flurry_batch_duration_seconds",
        Unit::Seconds,
        "Time a worker spends on one batch"
    );
    describe_histogram!(
        "flurry_catalog_request_duration_seconds",
        Unit::Seconds,
        "Latency of catalog API calls"
    );
    describe_histogram!(
        "flurry_storage_request_duration_seconds",
        Unit::Seconds,
        "Latency of object store requests"
    );
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
