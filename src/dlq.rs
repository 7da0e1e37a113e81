//! Dead Letter Queue for abandoned batches.
//!
//! Records the execution ids of batches that could not be written, together
//! with the stage and cause, so they can be inspected and re-run. Failures are
//! written as NDJSON.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::metrics::events::FailureStage;
use crate::storage::StorageProvider;

/// A record describing one abandoned batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    /// Dispatch sequence number of the batch.
    pub sequence: usize,
    /// Execution ids the batch was meant to export.
    pub execution_ids: Vec<String>,
    /// Error message describing the failure.
    pub error: String,
    /// Stage at which the failure occurred.
    pub stage: FailureStage,
    /// Batch attempts made before giving up.
    pub attempts: u32,
    /// Timestamp when the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Statistics about failures by stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub fetch: usize,
    pub encode: usize,
    pub upload: usize,
}

impl FailureStats {
    /// Increment the count for a specific stage.
    pub fn increment(&mut self, stage: FailureStage) {
        match stage {
            FailureStage::Fetch => self.fetch += 1,
            FailureStage::Encode => self.encode += 1,
            FailureStage::Upload => self.upload += 1,
        }
    }

    /// Get total failure count.
    pub fn total(&self) -> usize {
        self.fetch + self.encode + self.upload
    }
}

/// Dead Letter Queue for recording abandoned batches.
///
/// Every flush writes a new object named after the run's start time and a
/// part number, so earlier flushes are never overwritten.
pub struct DeadLetterQueue {
    storage: Arc<StorageProvider>,
    run_id: String,
    parts_written: AtomicUsize,
    buffer: Mutex<Vec<FailedBatch>>,
    stats: Mutex<FailureStats>,
    buffer_size: usize,
}

impl DeadLetterQueue {
    /// Create a new DLQ from configuration.
    ///
    /// Returns `None` if no DLQ path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        info!("DLQ enabled: {}", storage.url());
        Ok(Some(Self::new(Arc::new(storage))))
    }

    /// Create a DLQ writing to an existing storage provider.
    pub fn new(storage: Arc<StorageProvider>) -> Self {
        Self {
            storage,
            run_id: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            parts_written: AtomicUsize::new(0),
            buffer: Mutex::new(Vec::new()),
            stats: Mutex::new(FailureStats::default()),
            buffer_size: 100,
        }
    }

    /// Record an abandoned batch.
    pub async fn record_failure(&self, failed: FailedBatch) {
        debug!(
            "Recording DLQ failure: batch {} at stage {}",
            failed.sequence,
            failed.stage.as_str()
        );

        self.stats.lock().await.increment(failed.stage);

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(failed);
            buffer.len() >= self.buffer_size
        };

        if should_flush && let Err(e) = self.flush().await {
            error!("Failed to flush DLQ: {}", e);
        }
    }

    /// Flush buffered records to storage.
    ///
    /// On failure the records go back to the front of the buffer, so a later
    /// flush writes them.
    pub async fn flush(&self) -> Result<(), DlqError> {
        let records = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        if let Err(e) = self.write_part(&records).await {
            let mut buffer = self.buffer.lock().await;
            let newer = std::mem::replace(&mut *buffer, records);
            buffer.extend(newer);
            return Err(e);
        }
        Ok(())
    }

    async fn write_part(&self, records: &[FailedBatch]) -> Result<(), DlqError> {
        let mut ndjson = String::new();
        for record in records {
            let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let part = self.parts_written.fetch_add(1, Ordering::Relaxed);
        let path = Path::from(format!("failures-{}-{:04}.ndjson", self.run_id, part));
        self.storage
            .put(&path, Bytes::from(ndjson))
            .await
            .context(DlqWriteSnafu)?;

        info!("Flushed {} records to DLQ ({})", records.len(), path);
        Ok(())
    }

    /// Get current failure statistics.
    pub async fn stats(&self) -> FailureStats {
        self.stats.lock().await.clone()
    }

    /// Finalize the DLQ, flushing any remaining records.
    pub async fn finalize(&self) -> Result<FailureStats, DlqError> {
        self.flush().await?;
        let stats = self.stats().await;
        info!(
            "DLQ finalized: {} total failures (fetch={}, encode={}, upload={})",
            stats.total(),
            stats.fetch,
            stats.encode,
            stats.upload
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn failed_batch(sequence: usize, stage: FailureStage) -> FailedBatch {
        FailedBatch {
            sequence,
            execution_ids: vec![format!("id-{sequence}-a"), format!("id-{sequence}-b")],
            error: "connection reset".to_string(),
            stage,
            attempts: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_failure_stats_increment() {
        let mut stats = FailureStats::default();
        stats.increment(FailureStage::Fetch);
        stats.increment(FailureStage::Fetch);
        stats.increment(FailureStage::Upload);

        assert_eq!(stats.fetch, 2);
        assert_eq!(stats.upload, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_failed_batch_deserialization() {
        let json = r#"{"sequence":7,"execution_ids":["a","b"],"error":"throttled","stage":"fetch","attempts":3,"timestamp":"2025-01-26T10:30:00Z"}"#;
        let failed: FailedBatch = serde_json::from_str(json).unwrap();

        assert_eq!(failed.sequence, 7);
        assert_eq!(failed.execution_ids, vec!["a", "b"]);
        assert_eq!(failed.stage, FailureStage::Fetch);
        assert_eq!(failed.attempts, 3);
    }

    #[tokio::test]
    async fn test_dlq_from_config_none_when_no_path() {
        let config = ErrorHandlingConfig::default();
        let dlq = DeadLetterQueue::from_config(&config).await.unwrap();
        assert!(dlq.is_none());
    }

    #[tokio::test]
    async fn test_dlq_flushes_ndjson_to_storage() {
        let temp_dir = TempDir::new().unwrap();
        let dlq_path = temp_dir.path().to_str().unwrap().to_string();

        let config = ErrorHandlingConfig {
            max_failures: 0,
            dlq_path: Some(dlq_path.clone()),
            dlq_storage_options: HashMap::new(),
        };

        let dlq = DeadLetterQueue::from_config(&config)
            .await
            .unwrap()
            .unwrap();

        dlq.record_failure(failed_batch(1, FailureStage::Fetch)).await;
        dlq.record_failure(failed_batch(2, FailureStage::Encode)).await;

        let stats = dlq.finalize().await.unwrap();
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.encode, 1);

        let entries: Vec<_> = std::fs::read_dir(&dlq_path)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);

        let content = std::fs::read_to_string(entries[0].path()).unwrap();
        let lines: Vec<FailedBatch> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].sequence, 1);
        assert_eq!(lines[1].execution_ids, vec!["id-2-a", "id-2-b"]);
    }

    #[tokio::test]
    async fn test_each_flush_writes_a_new_part() {
        let storage = Arc::new(
            StorageProvider::for_url_with_options("memory://", HashMap::new())
                .await
                .unwrap(),
        );
        let dlq = DeadLetterQueue::new(storage.clone());

        dlq.record_failure(failed_batch(1, FailureStage::Upload)).await;
        dlq.flush().await.unwrap();
        dlq.record_failure(failed_batch(2, FailureStage::Upload)).await;
        dlq.flush().await.unwrap();
        // Nothing buffered: no new object.
        dlq.flush().await.unwrap();

        let paths = storage.list(None).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].to_string().ends_with("-0000.ndjson"));
        assert!(paths[1].to_string().ends_with("-0001.ndjson"));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_records_for_the_next_one() {
        let temp_dir = TempDir::new().unwrap();
        let dlq_dir = temp_dir.path().join("dlq");
        let storage = Arc::new(
            StorageProvider::for_url_with_options(dlq_dir.to_str().unwrap(), HashMap::new())
                .await
                .unwrap(),
        );
        let dlq = DeadLetterQueue::new(storage);

        // A regular file where the directory should be makes every write fail.
        std::fs::remove_dir(&dlq_dir).unwrap();
        std::fs::write(&dlq_dir, b"").unwrap();

        dlq.record_failure(failed_batch(1, FailureStage::Fetch)).await;
        assert!(dlq.flush().await.is_err());
        dlq.record_failure(failed_batch(2, FailureStage::Upload)).await;

        std::fs::remove_file(&dlq_dir).unwrap();
        std::fs::create_dir(&dlq_dir).unwrap();
        dlq.flush().await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(&dlq_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);

        let content = std::fs::read_to_string(entries[0].path()).unwrap();
        let sequences: Vec<usize> = content
            .lines()
            .map(|line| serde_json::from_str::<FailedBatch>(line).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }
}
