//! Main extraction pipeline.
//!
//! Connects the id source, the worker pool and the uploader.
//!
//! # Architecture
//!
//! A single driver task lists execution ids, groups them into chunks and
//! submits each chunk to a [`WorkQueue`]. A fixed pool of worker tasks takes
//! chunks from the queue and, per chunk, describes the executions, encodes
//! them as gzipped NDJSON on tokio's blocking pool and uploads one object.
//! Once the listing is exhausted the driver waits until every submitted chunk
//! (re-queued attempts included) has been marked done, then tears the pool
//! down.

mod batcher;
mod progress;
mod queue;
mod signal;
mod upload;
mod worker;

pub use batcher::{Batcher, Chunk};
pub use progress::{PipelineStats, ProgressCounters};
pub use queue::{Completion, Ticket, WorkQueue};
pub use signal::shutdown_signal;
pub use upload::{UploadKey, Uploader};

use futures::StreamExt;
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{AthenaCatalog, DetailFetcher, QueryCatalog};
use crate::config::Config;
use crate::dlq::DeadLetterQueue;
use crate::emit;
use crate::encode::BatchEncoder;
use crate::error::{
    DlqSnafu, MaxFailuresExceededSnafu, PipelineError, PipelineStorageSnafu, QueueSnafu,
    SourceError, SourceSnafu, WorkerJoinSnafu,
};
use crate::metrics::events::BatchDispatched;
use crate::source::ExecutionIdSource;
use crate::storage::{StorageProvider, StorageProviderRef};

use worker::{WorkerContext, spawn_workers};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    PoolStarted,
    Dispatching,
    Draining,
    Done,
}

/// Why dispatching stopped.
enum DispatchOutcome {
    /// Every listed id was submitted.
    Exhausted,
    /// Shutdown was requested.
    Shutdown,
    /// The listing failed; nothing after the failure was submitted.
    SourceFailed(SourceError),
    /// The failed-batch limit was reached.
    TooManyFailures,
}

/// Main extraction pipeline.
pub struct Pipeline {
    config: Config,
    source: ExecutionIdSource,
    fetcher: DetailFetcher,
    uploader: Uploader,
    dlq: Option<Arc<DeadLetterQueue>>,
    shutdown: CancellationToken,
    state: PipelineState,
}

impl Pipeline {
    /// Create a pipeline reading from `catalog` and writing under
    /// `config.destination.prefix` in `storage`.
    pub fn new(
        config: Config,
        catalog: Arc<dyn QueryCatalog>,
        storage: StorageProviderRef,
        shutdown: CancellationToken,
    ) -> Self {
        let retry = config.retry.policy();
        Self {
            source: ExecutionIdSource::new(catalog.clone(), retry.clone()),
            fetcher: DetailFetcher::new(catalog, retry),
            uploader: Uploader::new(storage, config.destination.prefix.clone()),
            config,
            dlq: None,
            shutdown,
            state: PipelineState::Idle,
        }
    }

    /// Record abandoned batches in `dlq`.
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Pipeline state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the pipeline to completion.
    ///
    /// Returns the final counters once every dispatched chunk has been
    /// processed or abandoned. A listing failure or too many abandoned
    /// batches still drain the pool before the error is returned.
    pub async fn run(&mut self) -> Result<PipelineStats, PipelineError> {
        info!("Starting pipeline");

        let counters = Arc::new(ProgressCounters::new());
        let queue = Arc::new(WorkQueue::new(self.shutdown.clone()));
        let context = Arc::new(WorkerContext {
            queue: queue.clone(),
            fetcher: self.fetcher.clone(),
            encoder: BatchEncoder::new(self.config.pipeline.compression_level),
            uploader: self.uploader.clone(),
            upload_retry: self.config.retry.policy(),
            counters: counters.clone(),
            dlq: self.dlq.clone(),
            max_batch_attempts: self.config.pipeline.max_batch_attempts,
            active: AtomicUsize::new(0),
        });

        let workers = spawn_workers(context, self.config.pipeline.max_workers);
        self.transition(PipelineState::PoolStarted);
        info!("Started {} workers", workers.len());

        self.transition(PipelineState::Dispatching);
        let dispatched = self.dispatch(&queue, &counters).await;

        self.transition(PipelineState::Draining);
        let outcome = match dispatched {
            Ok(outcome) => outcome,
            Err(e) => {
                // Workers drain what was queued and exit on their own.
                queue.close();
                return Err(e);
            }
        };

        info!(
            "Waiting for {} batches in flight to finish",
            queue.in_flight()
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested, abandoning queued batches");
            }
            _ = queue.await_all_done() => {
                debug!("All {} submitted batches done", queue.completed());
            }
        }

        queue.close();
        let mut join_error = None;
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
                join_error.get_or_insert(e);
            }
        }
        self.transition(PipelineState::Done);

        let finalized = match &self.dlq {
            Some(dlq) => dlq.finalize().await.map(Some),
            None => Ok(None),
        };

        let stats = counters.snapshot();
        info!("Pipeline finished: {:?}", stats);

        if let Some(e) = join_error {
            return Err(e).context(WorkerJoinSnafu);
        }

        match outcome {
            DispatchOutcome::SourceFailed(source) => {
                return Err(source).context(SourceSnafu);
            }
            DispatchOutcome::TooManyFailures => {
                return MaxFailuresExceededSnafu {
                    count: stats.batches_failed,
                }
                .fail();
            }
            DispatchOutcome::Shutdown => info!("Pipeline stopped by shutdown"),
            DispatchOutcome::Exhausted => {}
        }

        let max_failures = self.config.error_handling.max_failures;
        if max_failures > 0 && stats.batches_failed >= max_failures {
            return MaxFailuresExceededSnafu {
                count: stats.batches_failed,
            }
            .fail();
        }

        finalized.context(DlqSnafu)?;
        Ok(stats)
    }

    /// List ids, chunk them and submit every chunk.
    async fn dispatch(
        &self,
        queue: &WorkQueue<Chunk>,
        counters: &ProgressCounters,
    ) -> Result<DispatchOutcome, PipelineError> {
        let mut ids = self.source.stream();
        let mut batcher = Batcher::new(self.config.pipeline.max_batch_size);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping dispatch");
                    return Ok(DispatchOutcome::Shutdown);
                }
                next = ids.next() => next,
            };

            match next {
                Some(Ok(id)) => {
                    if let Some(chunk) = batcher.push(id)
                        && let Some(outcome) = self.submit(queue, counters, chunk)?
                    {
                        return Ok(outcome);
                    }
                }
                Some(Err(e)) => {
                    error!(
                        "Listing failed after {} batches: {}",
                        batcher.emitted(),
                        snafu::Report::from_error(&e)
                    );
                    return Ok(DispatchOutcome::SourceFailed(e));
                }
                None => break,
            }
        }

        if let Some(chunk) = batcher.finish()
            && let Some(outcome) = self.submit(queue, counters, chunk)?
        {
            return Ok(outcome);
        }

        info!(
            "Listing complete: {} batches dispatched",
            batcher.emitted()
        );
        Ok(DispatchOutcome::Exhausted)
    }

    /// Submit one chunk unless the failed-batch limit has been reached.
    fn submit(
        &self,
        queue: &WorkQueue<Chunk>,
        counters: &ProgressCounters,
        chunk: Chunk,
    ) -> Result<Option<DispatchOutcome>, PipelineError> {
        let max_failures = self.config.error_handling.max_failures;
        let failed = counters.batches_failed();
        if max_failures > 0 && failed >= max_failures {
            warn!(
                "{} batches failed (limit {}), stopping dispatch",
                failed, max_failures
            );
            return Ok(Some(DispatchOutcome::TooManyFailures));
        }

        let sequence = chunk.sequence;
        let len = chunk.len();
        queue.submit(chunk).context(QueueSnafu)?;

        let total = counters.record_dispatched(len);
        emit!(BatchDispatched { ids: len as u64 });
        info!(
            "Adding batch {} ({} executions, {} total) to queue",
            sequence, len, total
        );
        Ok(None)
    }
}

/// Run the pipeline against Athena with the given configuration.
///
/// SIGINT, SIGTERM and SIGQUIT stop dispatching; batches already being
/// processed are finished before returning.
pub async fn run_pipeline(config: Config) -> Result<PipelineStats, PipelineError> {
    let shutdown = CancellationToken::new();

    // Set up signal handler for graceful shutdown
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let storage = Arc::new(
        StorageProvider::for_url_with_options(
            &config.destination.storage_url(),
            config.destination.storage_options.clone(),
        )
        .await
        .context(PipelineStorageSnafu)?,
    );
    info!(
        "Writing batches to {} under prefix '{}'",
        storage.url(),
        config.destination.prefix
    );

    let dlq = DeadLetterQueue::from_config(&config.error_handling)
        .await
        .context(DlqSnafu)?
        .map(Arc::new);

    let catalog = Arc::new(AthenaCatalog::from_config(&config.catalog).await);

    let mut pipeline = Pipeline::new(config, catalog, storage, shutdown);
    if let Some(dlq) = dlq {
        pipeline = pipeline.with_dlq(dlq);
    }
    pipeline.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DescribeOutput, ExecutionPage, ExecutionRecord, RecordValue};
    use crate::error::{CatalogError, CatalogOperation};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    /// Log sink shared with a test subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    /// Catalog serving `total` ids in pages of `page_size`.
    struct Paged {
        total: usize,
        page_size: usize,
    }

    #[async_trait]
    impl QueryCatalog for Paged {
        async fn list_executions(
            &self,
            next_token: Option<String>,
        ) -> Result<ExecutionPage, CatalogError> {
            let start: usize = match next_token {
                Some(token) => token.parse().map_err(|_| CatalogError::Fatal {
                    operation: CatalogOperation::ListExecutions,
                    message: "bad token".to_string(),
                })?,
                None => 0,
            };
            let end = (start + self.page_size).min(self.total);
            Ok(ExecutionPage {
                ids: (start..end).map(|i| format!("id-{i}")).collect(),
                next_token: (end < self.total).then(|| end.to_string()),
            })
        }

        async fn batch_get_executions(
            &self,
            ids: &[String],
        ) -> Result<DescribeOutput, CatalogError> {
            let records = ids
                .iter()
                .map(|id| {
                    let mut record = ExecutionRecord::new();
                    record.insert("QueryExecutionId".to_string(), RecordValue::from(id.clone()));
                    record
                })
                .collect();
            Ok(DescribeOutput {
                records,
                unprocessed: Vec::new(),
            })
        }
    }

    async fn pipeline(total: usize, shutdown: CancellationToken) -> Pipeline {
        let storage = Arc::new(
            StorageProvider::for_url_with_options("memory://", HashMap::new())
                .await
                .unwrap(),
        );
        let mut config = Config::new("memory://", "out");
        config.pipeline.max_workers = 4;
        let catalog = Arc::new(Paged {
            total,
            page_size: 50,
        });
        Pipeline::new(config, catalog, storage, shutdown)
    }

    #[tokio::test]
    async fn test_state_machine_reaches_done() {
        let mut pipeline = pipeline(120, CancellationToken::new()).await;
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let stats = pipeline.run().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(stats.batches_dispatched, 3);
        assert_eq!(stats.ids_dispatched, 120);
        assert_eq!(stats.records_processed, 120);
    }

    #[tokio::test]
    async fn test_dispatch_log_reports_chunk_size_and_total() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut pipeline = pipeline(120, CancellationToken::new()).await;
        pipeline.run().await.unwrap();

        let text = logs.text();
        assert!(text.contains("Adding batch 1 (50 executions, 50 total) to queue"));
        assert!(text.contains("Adding batch 2 (50 executions, 100 total) to queue"));
        assert!(text.contains("Adding batch 3 (20 executions, 120 total) to queue"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_dispatches_nothing() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut pipeline = pipeline(500, shutdown).await;

        let stats = pipeline.run().await.unwrap();
        assert_eq!(stats, PipelineStats::default());
        assert_eq!(pipeline.state(), PipelineState::Done);
    }
}
