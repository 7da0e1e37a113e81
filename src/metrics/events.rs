//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when identifiers are read from a listing page.
pub struct ExecutionIdsListed {
    pub count: u64,
}

impl InternalEvent for ExecutionIdsListed {
    fn emit(self) {
        trace!(count = self.count, "Execution ids listed");
        counter!("flurry_execution_ids_listed_total").increment(self.count);
    }
}

/// Event emitted when a batch is handed to the worker pool.
pub struct BatchDispatched {
    pub ids: u64,
}

impl InternalEvent for BatchDispatched {
    fn emit(self) {
        trace!(ids = self.ids, "Batch dispatched");
        counter!("flurry_batches_dispatched_total").increment(1);
        counter!("flurry_ids_dispatched_total").increment(self.ids);
    }
}

/// Event emitted when records have been written to storage.
pub struct RecordsProcessed {
    pub count: u64,
}

impl InternalEvent for RecordsProcessed {
    fn emit(self) {
        trace!(count = self.count, "Records processed");
        counter!("flurry_records_processed_total").increment(self.count);
    }
}

/// Event emitted when compressed bytes are uploaded.
pub struct BytesUploaded {
    pub bytes: u64,
}

impl InternalEvent for BytesUploaded {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes uploaded");
        counter!("flurry_bytes_uploaded_total").increment(self.bytes);
    }
}

/// Final status of a batch.
#[derive(Debug, Clone, Copy)]
pub enum BatchStatus {
    Success,
    Requeued,
    Failed,
}

impl BatchStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Requeued => "requeued",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Stage at which a batch failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Encode,
    Upload,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Encode => "encode",
            FailureStage::Upload => "upload",
        }
    }
}

/// Event emitted when a batch leaves a worker.
pub struct BatchProcessed {
    pub status: BatchStatus,
}

impl InternalEvent for BatchProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Batch processed");
        counter!("flurry_batches_processed_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Event emitted when a batch is abandoned.
pub struct BatchFailed {
    pub stage: FailureStage,
}

impl InternalEvent for BatchFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Batch failed");
        counter!("flurry_batches_failed_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// Event emitted when the service reports identifiers it could not describe.
pub struct UnprocessedExecutions {
    pub count: u64,
}

impl InternalEvent for UnprocessedExecutions {
    fn emit(self) {
        trace!(count = self.count, "Unprocessed executions");
        counter!("flurry_unprocessed_executions_total").increment(self.count);
    }
}

/// Event emitted when a remote call is retried.
pub struct CallRetried {
    pub operation: &'static str,
}

impl InternalEvent for CallRetried {
    fn emit(self) {
        trace!(operation = self.operation, "Call retried");
        counter!("flurry_call_retries_total", "operation" => self.operation).increment(1);
    }
}

// ============================================================================
// Gauge events
// ============================================================================

/// Event emitted when the number of submitted-but-unfinished batches changes.
pub struct BatchesInFlight {
    pub count: usize,
}

impl InternalEvent for BatchesInFlight {
    fn emit(self) {
        trace!(count = self.count, "Batches in flight");
        gauge!("flurry_batches_in_flight").set(self.count as f64);
    }
}

/// Event emitted when a worker starts or stops processing a batch.
pub struct ActiveWorkers {
    pub count: usize,
}

impl InternalEvent for ActiveWorkers {
    fn emit(self) {
        trace!(count = self.count, "Active workers");
        gauge!("flurry_active_workers").set(self.count as f64);
    }
}

// ============================================================================
// Storage and catalog request events
// ============================================================================

/// Request status for remote operations.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_ok(ok: bool) -> Self {
        if ok {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Storage operation type.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
        }
    }
}

/// Event emitted for each storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "flurry_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted with the duration of a storage request.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "flurry_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Event emitted for each catalog request.
pub struct CatalogRequest {
    pub operation: &'static str,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for CatalogRequest {
    fn emit(self) {
        trace!(
            operation = self.operation,
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Catalog request"
        );
        counter!(
            "flurry_catalog_requests_total",
            "operation" => self.operation,
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "flurry_catalog_request_duration_seconds",
            "operation" => self.operation
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Event emitted with the time a worker spent on one batch.
pub struct BatchDuration {
    pub duration: Duration,
}

impl InternalEvent for BatchDuration {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis(), "Batch duration");
        histogram!("flurry_batch_duration_seconds").record(self.duration.as_secs_f64());
    }
}
