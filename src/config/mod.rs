//! Configuration loading and validation.
//!
//! The destination bucket and prefix come from the command line; everything
//! else has a default and can be tuned from an optional YAML file.

mod vars;

use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyBucketSnafu, EmptyWorkerPoolSnafu, EnvInterpolationSnafu,
    InvalidBatchAttemptsSnafu, InvalidBatchSizeSnafu, InvalidCompressionLevelSnafu,
    InvalidPageSizeSnafu, InvalidPrefixSnafu, InvalidRetryAttemptsSnafu, ReadFileSnafu, YamlParseSnafu,
};
use crate::retry::RetryPolicy;

pub use vars::{interpolate, interpolate_with};

/// Largest number of executions the batch-describe API accepts per call.
pub const MAX_DESCRIBE_BATCH_SIZE: usize = 50;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

/// Where encoded batches are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// S3 bucket name, or a storage URL (`s3://`, `file://`, `/path`, `memory://`).
    #[serde(default)]
    pub bucket: String,
    /// Key prefix for uploaded objects.
    #[serde(default)]
    pub prefix: String,
    /// Storage options (credentials, region, endpoint, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl DestinationConfig {
    /// Reject prefixes whose keys would not be written exactly as
    /// `{prefix}/{uuid}.json.gz`.
    fn validate_prefix(&self) -> Result<(), ConfigError> {
        let prefix = self.prefix.as_str();
        ensure!(
            !prefix.starts_with('/'),
            InvalidPrefixSnafu {
                prefix,
                reason: "must not start with '/'",
            }
        );
        ObjectPath::parse(prefix.trim_end_matches('/')).map_err(|e| {
            InvalidPrefixSnafu {
                prefix,
                reason: e.to_string(),
            }
            .build()
        })?;
        Ok(())
    }

    /// Storage URL for the bucket; bare bucket names are treated as S3.
    pub fn storage_url(&self) -> String {
        if self.bucket.contains("://") || self.bucket.starts_with('/') {
            self.bucket.clone()
        } else {
            format!("s3://{}", self.bucket)
        }
    }
}

/// Query catalog (listing and describe API) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// AWS region; falls back to the default provider chain.
    #[serde(default)]
    pub region: Option<String>,
    /// Only list executions from this work group.
    #[serde(default)]
    pub work_group: Option<String>,
    /// Identifiers per listing page (1..=50; service default when unset).
    #[serde(default)]
    pub page_size: Option<i32>,
}

/// Batching and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Identifiers per batch (default: 50).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Number of worker tasks (default: 25).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Attempts per batch including re-queues (default: 1, no re-queue).
    #[serde(default = "default_max_batch_attempts")]
    pub max_batch_attempts: u32,
    /// Gzip level 0-9 (default: 6).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_workers: default_max_workers(),
            max_batch_attempts: default_max_batch_attempts(),
            compression_level: default_compression_level(),
        }
    }
}

fn default_max_batch_size() -> usize {
    MAX_DESCRIBE_BATCH_SIZE
}

fn default_max_workers() -> usize {
    25
}

fn default_max_batch_attempts() -> u32 {
    1
}

fn default_compression_level() -> u32 {
    6
}

/// Retry settings for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call including the first (default: 10).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 100).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay in milliseconds (default: 20000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomize each delay between zero and its computed value (default: true).
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    20_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl RetryConfig {
    /// Build the retry policy described by this configuration.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is started (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Error handling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Failed batches tolerated before the run reports failure (0 = unlimited).
    #[serde(default)]
    pub max_failures: usize,
    /// Storage URL to write failed batch records to.
    #[serde(default)]
    pub dlq_path: Option<String>,
    /// Storage options for DLQ (credentials, region, etc.)
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

impl Config {
    /// Default configuration writing to `bucket` under `prefix`.
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.destination.bucket = bucket.into();
        config.destination.prefix = prefix.into();
        config
    }

    /// Load tuning configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    ///
    /// The destination is not validated here since the bucket usually
    /// arrives from the command line afterwards.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content, interpolate_env)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str, interpolate_env: bool) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            vars::interpolate(content).map_err(|errors| {
                EnvInterpolationSnafu {
                    message: errors.join("\n"),
                }
                .build()
            })?
        } else {
            content.to_string()
        };

        serde_yaml::from_str(&content).context(YamlParseSnafu)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.destination.bucket.is_empty(), EmptyBucketSnafu);
        self.destination.validate_prefix()?;

        let batch_size = self.pipeline.max_batch_size;
        ensure!(
            (1..=MAX_DESCRIBE_BATCH_SIZE).contains(&batch_size),
            InvalidBatchSizeSnafu {
                value: batch_size,
                max: MAX_DESCRIBE_BATCH_SIZE,
            }
        );
        ensure!(self.pipeline.max_workers > 0, EmptyWorkerPoolSnafu);
        ensure!(
            self.pipeline.max_batch_attempts > 0,
            InvalidBatchAttemptsSnafu
        );
        ensure!(
            self.pipeline.compression_level <= 9,
            InvalidCompressionLevelSnafu {
                value: self.pipeline.compression_level,
            }
        );
        ensure!(self.retry.max_attempts > 0, InvalidRetryAttemptsSnafu);

        if let Some(page_size) = self.catalog.page_size {
            ensure!(
                (1..=50).contains(&page_size),
                InvalidPageSizeSnafu { value: page_size }
            );
        }
        Ok(())
    }
}
