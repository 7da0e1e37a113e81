//! Query catalog: the remote listing and batch-describe APIs.
//!
//! [`QueryCatalog`] is the seam between the pipeline and the service that
//! owns query executions. [`athena::AthenaCatalog`] is the production
//! backend; tests provide their own implementations.

pub mod athena;
mod record;

pub use athena::AthenaCatalog;
pub use record::{ExecutionRecord, RecordValue, iso_timestamp, iso_zoned_timestamp};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::emit;
use crate::error::{CatalogError, CatalogOperation};
use crate::metrics::events::{CatalogRequest, RequestStatus, UnprocessedExecutions};
use crate::retry::RetryPolicy;

/// One page of the execution listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPage {
    pub ids: Vec<String>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// An execution id the describe API could not return details for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprocessedExecution {
    pub id: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Result of one batch-describe call.
#[derive(Debug, Clone, Default)]
pub struct DescribeOutput {
    pub records: Vec<ExecutionRecord>,
    pub unprocessed: Vec<UnprocessedExecution>,
}

/// Remote service exposing query executions.
#[async_trait]
pub trait QueryCatalog: Send + Sync {
    /// Fetch one page of execution ids, continuing from `next_token`.
    async fn list_executions(
        &self,
        next_token: Option<String>,
    ) -> Result<ExecutionPage, CatalogError>;

    /// Describe up to 50 executions in one call.
    async fn batch_get_executions(&self, ids: &[String]) -> Result<DescribeOutput, CatalogError>;
}

/// Run one catalog call, recording its outcome and latency.
pub(crate) async fn observe<T, Fut>(
    operation: CatalogOperation,
    call: Fut,
) -> Result<T, CatalogError>
where
    Fut: Future<Output = Result<T, CatalogError>>,
{
    let start = Instant::now();
    let result = call.await;
    emit!(CatalogRequest {
        operation: operation.as_str(),
        status: RequestStatus::from_ok(result.is_ok()),
        duration: start.elapsed(),
    });
    result
}

/// Fetches full execution details for one batch of ids.
#[derive(Clone)]
pub struct DetailFetcher {
    catalog: Arc<dyn QueryCatalog>,
    retry: RetryPolicy,
}

impl DetailFetcher {
    pub fn new(catalog: Arc<dyn QueryCatalog>, retry: RetryPolicy) -> Self {
        Self { catalog, retry }
    }

    /// Describe `ids` with a single batch call, retrying transient failures.
    ///
    /// Ids the service reports as unprocessed are logged and skipped; the
    /// records that were returned are kept.
    pub async fn fetch(&self, ids: &[String]) -> Result<Vec<ExecutionRecord>, CatalogError> {
        let operation = CatalogOperation::BatchGetExecutions;
        let output = self
            .retry
            .retry(operation.as_str(), || {
                observe(operation, self.catalog.batch_get_executions(ids))
            })
            .await
            .map_err(|failure| {
                debug!("{} gave up after {} attempts", operation, failure.attempts);
                failure.error
            })?;

        if !output.unprocessed.is_empty() {
            let preview: Vec<&str> = output
                .unprocessed
                .iter()
                .take(5)
                .map(|u| u.id.as_str())
                .collect();
            warn!(
                "{} of {} executions could not be described (first: {:?}, reason: {})",
                output.unprocessed.len(),
                ids.len(),
                preview,
                output.unprocessed[0]
                    .error_message
                    .as_deref()
                    .unwrap_or("unknown")
            );
            emit!(UnprocessedExecutions {
                count: output.unprocessed.len() as u64,
            });
        }

        Ok(output.records)
    }
}
