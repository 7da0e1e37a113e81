//! flurry: exports query execution history from Athena to object storage.
//!
//! Execution ids are listed page by page, grouped into batches of up to 50,
//! and handed to a pool of workers. Each worker describes its batch, encodes
//! the records as gzipped NDJSON and uploads one object per batch under
//! `{prefix}/{uuid}.json.gz`.
//!
//! # Example
//!
//! ```ignore
//! use flurry::{Config, run_pipeline, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::new("my-bucket", "athena/history");
//!     let stats = run_pipeline(config).await?;
//!     println!("Exported {} executions", stats.records_processed);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod dlq;
pub mod encode;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod storage;

// Re-export main types
pub use catalog::{AthenaCatalog, QueryCatalog};
pub use config::Config;
pub use pipeline::{Pipeline, PipelineStats, run_pipeline};
pub use storage::{StorageProvider, StorageProviderRef};
