//! Work queue between the dispatcher and the worker pool.
//!
//! A single producer submits items; any number of workers take them. Every
//! submitted item is counted as in flight until the worker holding it marks
//! it done, and [`WorkQueue::await_all_done`] waits for that count to reach
//! zero. The count lives in a `watch` channel so waiting never misses an
//! update.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::emit;
use crate::error::{ClosedSnafu, QueueError};
use crate::metrics::events::BatchesInFlight;

#[derive(Debug)]
struct Accounting {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    in_flight: watch::Sender<usize>,
}

impl Accounting {
    fn begin(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.in_flight.send_modify(|n| *n += 1);
        emit!(BatchesInFlight {
            count: *self.in_flight.borrow()
        });
    }

    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        emit!(BatchesInFlight {
            count: *self.in_flight.borrow()
        });
    }
}

/// Unbounded FIFO with explicit completion accounting.
pub struct WorkQueue<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    accounting: Arc<Accounting>,
    shutdown: CancellationToken,
}

impl<T> WorkQueue<T> {
    /// Create a queue whose `take` gives up once `shutdown` is cancelled.
    pub fn new(shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (in_flight, _) = watch::channel(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            accounting: Arc::new(Accounting {
                submitted: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                in_flight,
            }),
            shutdown,
        }
    }

    /// Enqueue an item. The item counts as in flight from this point on.
    pub fn submit(&self, item: T) -> Result<(), QueueError> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return ClosedSnafu.fail();
        };

        self.accounting.begin();
        if tx.send(item).is_err() {
            self.accounting.finish();
            return ClosedSnafu.fail();
        }
        Ok(())
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and drained, or when shutdown
    /// is requested.
    pub async fn take(&self) -> Option<Ticket<T>> {
        let mut rx = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };

        let item = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return None,
            item = rx.recv() => item?,
        };

        Some(Ticket {
            item,
            completion: Completion {
                accounting: self.accounting.clone(),
                done: false,
            },
        })
    }

    /// Stop accepting items. Items already queued can still be taken.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Wait until every submitted item has been marked done.
    pub async fn await_all_done(&self) {
        let mut in_flight = self.accounting.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = in_flight.wait_for(|n| *n == 0).await;
    }

    /// Items submitted but not yet marked done.
    pub fn in_flight(&self) -> usize {
        *self.accounting.in_flight.borrow()
    }

    pub fn submitted(&self) -> usize {
        self.accounting.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.accounting.completed.load(Ordering::SeqCst)
    }
}

/// An item taken from the queue. Marks itself done when dropped.
#[derive(Debug)]
pub struct Ticket<T> {
    item: T,
    completion: Completion,
}

impl<T> Ticket<T> {
    pub fn item(&self) -> &T {
        &self.item
    }

    /// Separate the item from its completion handle, e.g. to re-queue the
    /// item before acknowledging it.
    pub fn into_parts(self) -> (T, Completion) {
        (self.item, self.completion)
    }

    pub fn mark_done(self) {
        self.completion.mark_done();
    }
}

/// Acknowledges one taken item exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct Completion {
    accounting: Arc<Accounting>,
    done: bool,
}

impl Completion {
    pub fn mark_done(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if !self.done {
            self.done = true;
            self.accounting.finish();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.complete();
    }
}
