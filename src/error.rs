//! Error types for flurry using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;

use crate::metrics::events::FailureStage;

// ============ Catalog Errors ============

/// Remote catalog operation, used to label errors and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogOperation {
    ListExecutions,
    BatchGetExecutions,
}

impl CatalogOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogOperation::ListExecutions => "list_executions",
            CatalogOperation::BatchGetExecutions => "batch_get_executions",
        }
    }
}

impl std::fmt::Display for CatalogOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a query catalog backend.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// Throttling, timeouts, connection resets and server-side faults.
    #[snafu(display("Transient error calling {operation}: {message}"))]
    Transient {
        operation: CatalogOperation,
        message: String,
    },

    /// Authorization failures, malformed requests and other errors that will
    /// not go away by asking again.
    #[snafu(display("Fatal error calling {operation}: {message}"))]
    Fatal {
        operation: CatalogOperation,
        message: String,
    },
}

impl CatalogError {
    /// Check if the call is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogError::Transient { .. })
    }
}

// ============ Source Errors ============

/// Errors that abort identifier listing, and with it the whole run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The listing API rejected the request outright.
    #[snafu(display("Failed to list query executions"))]
    FatalFetch { source: CatalogError },

    /// The listing API kept failing with transient errors.
    #[snafu(display("Failed to list query executions after {attempts} attempts"))]
    TransientFetch {
        attempts: u32,
        source: CatalogError,
    },
}

// ============ Encode Errors ============

/// Errors that can occur while encoding a batch to gzipped NDJSON.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EncodeError {
    /// A record holds a value with no JSON representation.
    #[snafu(display("Failed to serialize record {index}"))]
    Serialization {
        index: usize,
        source: serde_json::Error,
    },

    /// Gzip compression failed.
    #[snafu(display("Failed to compress batch"))]
    Compress { source: std::io::Error },
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// Object key that the store would rewrite or reject.
    #[snafu(display("Invalid object key {key}: {source}"))]
    InvalidKey {
        key: String,
        source: object_store::path::Error,
    },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }

    /// Check if the operation is worth retrying.
    ///
    /// Configuration errors and store errors that describe the request itself
    /// (missing object, failed precondition, unsupported operation) are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => !matches!(
                source,
                object_store::Error::NotFound { .. }
                    | object_store::Error::AlreadyExists { .. }
                    | object_store::Error::Precondition { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
                    | object_store::Error::UnknownConfigurationKey { .. }
            ),
            StorageError::Io { .. } => true,
            StorageError::InvalidUrl { .. }
            | StorageError::S3Config { .. }
            | StorageError::InvalidKey { .. } => false,
        }
    }
}

// ============ Batch Errors ============

/// Errors that abandon a single batch. Sibling batches are unaffected.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BatchError {
    /// The batch-describe call failed.
    #[snafu(display("Failed to fetch execution details"))]
    DetailFetch { source: CatalogError },

    /// The fetched records could not be encoded.
    #[snafu(display("Failed to encode batch"))]
    Encode { source: EncodeError },

    /// The encoding task panicked or was cancelled.
    #[snafu(display("Encode task failed"))]
    EncodeTask { source: tokio::task::JoinError },

    /// The compressed batch could not be written to storage.
    #[snafu(display("Failed to upload batch"))]
    Upload { source: StorageError },
}

impl BatchError {
    /// Pipeline stage the batch failed in.
    pub fn stage(&self) -> FailureStage {
        match self {
            BatchError::DetailFetch { .. } => FailureStage::Fetch,
            BatchError::Encode { .. } | BatchError::EncodeTask { .. } => FailureStage::Encode,
            BatchError::Upload { .. } => FailureStage::Upload,
        }
    }

    /// Check if another attempt at the whole batch could succeed.
    ///
    /// Encoding is deterministic for a given set of records, so encode
    /// failures are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            BatchError::DetailFetch { source } => source.is_retryable(),
            BatchError::Upload { source } => source.is_retryable(),
            BatchError::Encode { .. } | BatchError::EncodeTask { .. } => false,
        }
    }
}

// ============ Queue Errors ============

/// Errors that can occur when handing work to the worker pool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// The queue no longer accepts work.
    #[snafu(display("Work queue is closed"))]
    Closed,
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Destination bucket is empty.
    #[snafu(display("Destination bucket cannot be empty"))]
    EmptyBucket,

    /// Batch size outside the range the describe API accepts.
    #[snafu(display("max_batch_size must be between 1 and {max}, got {value}"))]
    InvalidBatchSize { value: usize, max: usize },

    /// Worker pool must not be empty.
    #[snafu(display("max_workers must be at least 1"))]
    EmptyWorkerPool,

    /// Batch attempts must allow at least one try.
    #[snafu(display("max_batch_attempts must be at least 1"))]
    InvalidBatchAttempts,

    /// Retry policy must allow at least one try.
    #[snafu(display("retry.max_attempts must be at least 1"))]
    InvalidRetryAttempts,

    /// Listing page size outside the range the listing API accepts.
    #[snafu(display("catalog.page_size must be between 1 and 50, got {value}"))]
    InvalidPageSize { value: i32 },

    /// Gzip level outside 0..=9.
    #[snafu(display("compression_level must be between 0 and 9, got {value}"))]
    InvalidCompressionLevel { value: u32 },

    /// Key prefix that cannot be stored verbatim.
    #[snafu(display("Invalid destination prefix {prefix:?}: {reason}"))]
    InvalidPrefix { prefix: String, reason: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize failed batch record.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Storage error.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Identifier listing failed; no further batches were dispatched.
    #[snafu(display("Source error"))]
    Source { source: SourceError },

    /// Work queue rejected a batch.
    #[snafu(display("Queue error"))]
    Queue { source: QueueError },

    /// A worker task panicked or was aborted.
    #[snafu(display("Worker join error"))]
    WorkerJoin { source: tokio::task::JoinError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// DLQ error.
    #[snafu(display("DLQ error"))]
    Dlq { source: DlqError },

    /// Max failures exceeded.
    #[snafu(display("Max failures exceeded: {count} failed batches"))]
    MaxFailuresExceeded { count: usize },
}
