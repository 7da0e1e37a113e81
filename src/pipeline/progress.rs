//! Run-wide progress counters shared by the dispatcher and workers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Statistics about the pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub batches_dispatched: usize,
    pub ids_dispatched: usize,
    pub batches_processed: usize,
    pub records_processed: usize,
    pub batches_failed: usize,
    pub records_failed: usize,
    pub batches_requeued: usize,
    pub bytes_uploaded: u64,
}

/// Atomic counters, updated once per batch outcome.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    batches_dispatched: AtomicUsize,
    ids_dispatched: AtomicUsize,
    batches_processed: AtomicUsize,
    records_processed: AtomicUsize,
    batches_failed: AtomicUsize,
    records_failed: AtomicUsize,
    batches_requeued: AtomicUsize,
    bytes_uploaded: AtomicU64,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk handed to the pool; returns the running id total.
    pub fn record_dispatched(&self, ids: usize) -> usize {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.ids_dispatched.fetch_add(ids, Ordering::Relaxed) + ids
    }

    /// Record an uploaded batch; returns the running record total.
    pub fn record_processed(&self, records: usize, bytes: u64) -> usize {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.records_processed.fetch_add(records, Ordering::Relaxed) + records
    }

    /// Record an abandoned batch; returns the number of failed batches so far.
    pub fn record_failed(&self, ids: usize) -> usize {
        self.records_failed.fetch_add(ids, Ordering::Relaxed);
        self.batches_failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_requeued(&self) {
        self.batches_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batches_failed(&self) -> usize {
        self.batches_failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            ids_dispatched: self.ids_dispatched.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            batches_requeued: self.batches_requeued.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}
