//! Worker tasks: fetch, encode and upload one chunk at a time.
//!
//! Each worker loops on [`WorkQueue::take`] until the queue is closed or
//! shutdown is requested. A chunk either succeeds, is re-queued for another
//! attempt, or is abandoned. Abandoning a chunk never stops the worker.

use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::batcher::Chunk;
use super::progress::ProgressCounters;
use super::queue::{Ticket, WorkQueue};
use super::upload::{UploadKey, Uploader};
use crate::catalog::DetailFetcher;
use crate::dlq::{DeadLetterQueue, FailedBatch};
use crate::emit;
use crate::encode::{BatchEncoder, EncodedBatch};
use crate::error::{BatchError, DetailFetchSnafu, EncodeSnafu, EncodeTaskSnafu, UploadSnafu};
use crate::metrics::events::{
    ActiveWorkers, BatchDuration, BatchFailed, BatchProcessed, BatchStatus, BytesUploaded,
    RecordsProcessed,
};
use crate::retry::RetryPolicy;

/// Everything a worker needs, shared by the whole pool.
pub(super) struct WorkerContext {
    pub queue: Arc<WorkQueue<Chunk>>,
    pub fetcher: DetailFetcher,
    pub encoder: BatchEncoder,
    pub uploader: Uploader,
    pub upload_retry: RetryPolicy,
    pub counters: Arc<ProgressCounters>,
    pub dlq: Option<Arc<DeadLetterQueue>>,
    pub max_batch_attempts: u32,
    pub active: AtomicUsize,
}

/// Spawn `count` workers sharing `context`.
pub(super) fn spawn_workers(context: Arc<WorkerContext>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| tokio::spawn(run_worker(id, context.clone())))
        .collect()
}

async fn run_worker(id: usize, context: Arc<WorkerContext>) {
    debug!("Worker {} started", id);

    while let Some(ticket) = context.queue.take().await {
        let active = context.active.fetch_add(1, Ordering::Relaxed) + 1;
        emit!(ActiveWorkers { count: active });

        let start = Instant::now();
        let result = context.process(ticket.item()).await;
        emit!(BatchDuration {
            duration: start.elapsed()
        });

        match result {
            Ok((batch, key)) => {
                context.record_success(ticket.item(), &batch, &key);
                ticket.mark_done();
            }
            Err(e) => context.handle_failure(ticket, e).await,
        }

        let active = context.active.fetch_sub(1, Ordering::Relaxed) - 1;
        emit!(ActiveWorkers { count: active });
    }

    debug!("Worker {} stopped", id);
}

impl WorkerContext {
    /// Fetch, encode and upload one chunk.
    async fn process(&self, chunk: &Chunk) -> Result<(EncodedBatch, UploadKey), BatchError> {
        let records = self
            .fetcher
            .fetch(&chunk.ids)
            .await
            .context(DetailFetchSnafu)?;

        let encoder = self.encoder;
        let batch = tokio::task::spawn_blocking(move || encoder.encode(&records))
            .await
            .context(EncodeTaskSnafu)?
            .context(EncodeSnafu)?;

        let key = self
            .upload_retry
            .retry("put_object", || self.uploader.upload(&batch))
            .await
            .map_err(|failure| failure.error)
            .context(UploadSnafu)?;

        Ok((batch, key))
    }

    fn record_success(&self, chunk: &Chunk, batch: &EncodedBatch, key: &UploadKey) {
        let bytes = batch.bytes.len() as u64;
        let total = self.counters.record_processed(batch.record_count, bytes);

        emit!(RecordsProcessed {
            count: batch.record_count as u64
        });
        emit!(BytesUploaded { bytes });
        emit!(BatchProcessed {
            status: BatchStatus::Success
        });

        info!(
            "Processed batch {} with {} executions ({} total)",
            chunk.sequence, batch.record_count, total
        );
        debug!(
            "Batch {} written to {} ({} bytes, {} uncompressed)",
            chunk.sequence, key, bytes, batch.uncompressed_size
        );
    }

    /// Re-queue the chunk if another attempt could succeed, otherwise abandon it.
    async fn handle_failure(&self, ticket: Ticket<Chunk>, error: BatchError) {
        let (chunk, completion) = ticket.into_parts();

        if error.is_retryable() && chunk.attempt < self.max_batch_attempts {
            let sequence = chunk.sequence;
            let attempt = chunk.attempt;
            // Submit before marking done so the barrier never sees zero in between.
            match self.queue.submit(chunk.clone().retry()) {
                Ok(()) => {
                    warn!(
                        "Re-queuing batch {} after attempt {} failed at {} stage: {}",
                        sequence,
                        attempt,
                        error.stage().as_str(),
                        snafu::Report::from_error(&error)
                    );
                    self.counters.record_requeued();
                    emit!(BatchProcessed {
                        status: BatchStatus::Requeued
                    });
                    completion.mark_done();
                    return;
                }
                Err(e) => {
                    warn!("Could not re-queue batch {}: {}", sequence, e);
                }
            }
        }

        self.abandon(&chunk, &error).await;
        completion.mark_done();
    }

    async fn abandon(&self, chunk: &Chunk, error: &BatchError) {
        let stage = error.stage();
        let report = snafu::Report::from_error(error).to_string();

        error!(
            "Failed batch {} at {} stage after {} attempt(s) ({} executions: {:?}): {}",
            chunk.sequence,
            stage.as_str(),
            chunk.attempt,
            chunk.len(),
            chunk.ids,
            report
        );

        self.counters.record_failed(chunk.len());
        emit!(BatchFailed { stage });
        emit!(BatchProcessed {
            status: BatchStatus::Failed
        });

        if let Some(dlq) = &self.dlq {
            dlq.record_failure(FailedBatch {
                sequence: chunk.sequence,
                execution_ids: chunk.ids.clone(),
                error: report,
                stage,
                attempts: chunk.attempt,
                timestamp: Utc::now(),
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        DescribeOutput, ExecutionPage, ExecutionRecord, QueryCatalog, RecordValue,
    };
    use crate::error::{CatalogError, CatalogOperation, QueueError};
    use crate::storage::StorageProvider;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use tokio_util::sync::CancellationToken;

    /// Describe API that fails transiently for the first `failures` calls.
    struct Describer {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl QueryCatalog for Describer {
        async fn list_executions(
            &self,
            _next_token: Option<String>,
        ) -> Result<ExecutionPage, CatalogError> {
            Ok(ExecutionPage::default())
        }

        async fn batch_get_executions(
            &self,
            ids: &[String],
        ) -> Result<DescribeOutput, CatalogError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(CatalogError::Transient {
                    operation: CatalogOperation::BatchGetExecutions,
                    message: "throttled".to_string(),
                });
            }
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

    async fn context(failures: u32, max_batch_attempts: u32) -> Arc<WorkerContext> {
        let storage = Arc::new(
            StorageProvider::for_url_with_options("memory://", HashMap::new())
                .await
                .unwrap(),
        );
        let catalog = Arc::new(Describer {
            failures,
            calls: AtomicU32::new(0),
        });
        Arc::new(WorkerContext {
            queue: Arc::new(WorkQueue::new(CancellationToken::new())),
            fetcher: DetailFetcher::new(catalog, RetryPolicy::no_retry()),
            encoder: BatchEncoder::default(),
            uploader: Uploader::new(storage, "out"),
            upload_retry: RetryPolicy::no_retry(),
            counters: Arc::new(ProgressCounters::new()),
            dlq: None,
            max_batch_attempts,
            active: AtomicUsize::new(0),
        })
    }

    fn chunk(n: usize) -> Chunk {
        Chunk {
            sequence: 1,
            ids: (0..n).map(|i| format!("id-{i}")).collect(),
            attempt: 1,
        }
    }

    async fn drain(context: &Arc<WorkerContext>) {
        let handles = spawn_workers(context.clone(), 2);
        context.queue.await_all_done().await;
        context.queue.close();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_success_counts_records() {
        let context = context(0, 1).await;
        context.queue.submit(chunk(3)).unwrap();
        drain(&context).await;

        let stats = context.counters.snapshot();
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.records_processed, 3);
        assert_eq!(stats.batches_failed, 0);
        assert!(stats.bytes_uploaded > 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_requeued() {
        let context = context(1, 2).await;
        context.queue.submit(chunk(2)).unwrap();
        drain(&context).await;

        let stats = context.counters.snapshot();
        assert_eq!(stats.batches_requeued, 1);
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.batches_failed, 0);
        assert_eq!(context.queue.submitted(), 2);
        assert_eq!(context.queue.completed(), 2);
    }

    #[tokio::test]
    async fn test_single_attempt_abandons_batch() {
        let context = context(1, 1).await;
        context.queue.submit(chunk(4)).unwrap();
        drain(&context).await;

        let stats = context.counters.snapshot();
        assert_eq!(stats.batches_requeued, 0);
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.records_failed, 4);
        assert_eq!(stats.batches_processed, 0);
    }

    #[tokio::test]
    async fn test_requeue_on_closed_queue_abandons() {
        let context = context(1, 3).await;
        context.queue.submit(chunk(1)).unwrap();
        context.queue.close();
        assert!(matches!(
            context.queue.submit(chunk(1)),
            Err(QueueError::Closed)
        ));

        let handles = spawn_workers(context.clone(), 1);
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = context.counters.snapshot();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(context.queue.in_flight(), 0);
    }
}
