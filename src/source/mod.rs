//! Execution id source.
//!
//! Walks the paginated listing API and yields execution ids one at a time.
//! Pages are only requested as the consumer drains the previous one.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::catalog::{ExecutionPage, QueryCatalog, observe};
use crate::emit;
use crate::error::{CatalogError, CatalogOperation, SourceError};
use crate::metrics::events::ExecutionIdsListed;
use crate::retry::{RetryFailure, RetryPolicy};

/// Position in the listing.
enum Cursor {
    Start,
    Next(String),
    Exhausted,
}

/// Lazy stream of execution ids from a [`QueryCatalog`].
#[derive(Clone)]
pub struct ExecutionIdSource {
    catalog: Arc<dyn QueryCatalog>,
    retry: RetryPolicy,
}

impl ExecutionIdSource {
    pub fn new(catalog: Arc<dyn QueryCatalog>, retry: RetryPolicy) -> Self {
        Self { catalog, retry }
    }

    /// Stream every execution id, following continuation tokens until a
    /// page has none.
    ///
    /// The stream ends after yielding an error. Calling `stream` again
    /// restarts the listing from the first page.
    pub fn stream(&self) -> BoxStream<'static, Result<String, SourceError>> {
        let source = self.clone();
        stream::try_unfold(Cursor::Start, move |cursor| source.clone().next_page(cursor))
            .map_ok(|ids| stream::iter(ids.into_iter().map(Ok::<String, SourceError>)))
            .try_flatten()
            .boxed()
    }

    /// Fetch the page at `cursor`; `None` once the listing is exhausted.
    async fn next_page(
        self,
        cursor: Cursor,
    ) -> Result<Option<(Vec<String>, Cursor)>, SourceError> {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Exhausted => return Ok(None),
        };

        let page = self.fetch_page(token).await?;
        emit!(ExecutionIdsListed {
            count: page.ids.len() as u64
        });

        let next = match page.next_token {
            Some(token) => Cursor::Next(token),
            None => Cursor::Exhausted,
        };
        Ok(Some((page.ids, next)))
    }

    async fn fetch_page(
        &self,
        token: Option<String>,
    ) -> Result<ExecutionPage, SourceError> {
        let operation = CatalogOperation::ListExecutions;
        debug!("Requesting execution page (continuation: {})", token.is_some());

        self.retry
            .retry(operation.as_str(), || {
                observe(operation, self.catalog.list_executions(token.clone()))
            })
            .await
            .map_err(into_source_error)
    }
}

fn into_source_error(failure: RetryFailure<CatalogError>) -> SourceError {
    let RetryFailure { attempts, error } = failure;
    if error.is_retryable() {
        SourceError::TransientFetch {
            attempts,
            source: error,
        }
    } else {
        SourceError::FatalFetch { source: error }
    }
}
