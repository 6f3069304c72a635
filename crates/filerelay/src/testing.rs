//! Queue doubles shared by unit tests.

use async_trait::async_trait;
use filerelay_store::{
    AppendOutcome, DeliveryQueue, DeliveryTask, Result, SqliteDeliveryQueue, StatusBatch, StoreError,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Delegates to a real queue after failing a set number of calls with a
/// transient I/O error.
pub(crate) struct FlakyQueue {
    inner: SqliteDeliveryQueue,
    append_failures: AtomicUsize,
    read_failures: AtomicUsize,
    pub(crate) append_calls: AtomicUsize,
    pub(crate) read_calls: AtomicUsize,
}

impl FlakyQueue {
    pub(crate) fn new(inner: SqliteDeliveryQueue) -> Self {
        Self {
            inner,
            append_failures: AtomicUsize::new(0),
            read_failures: AtomicUsize::new(0),
            append_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` calls to `append` and `append_once`.
    pub(crate) fn fail_appends(self, count: usize) -> Self {
        self.append_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` calls to `read_status`.
    pub(crate) fn fail_reads(self, count: usize) -> Self {
        self.read_failures.store(count, Ordering::SeqCst);
        self
    }

    fn take_failure(counter: &AtomicUsize) -> Result<()> {
        let failing = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "database is busy")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeliveryQueue for FlakyQueue {
    async fn append(&self, task: &DeliveryTask) -> Result<i64> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_failure(&self.append_failures)?;
        self.inner.append(task).await
    }

    async fn append_once(&self, task: &DeliveryTask, dedupe_key: &str) -> Result<AppendOutcome> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_failure(&self.append_failures)?;
        self.inner.append_once(task, dedupe_key).await
    }

    async fn read_status(&self, from: i64, max: usize, timeout: Duration) -> Result<StatusBatch> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_failure(&self.read_failures)?;
        self.inner.read_status(from, max, timeout).await
    }

    async fn latest_sequence_number(&self) -> Result<Option<i64>> {
        self.inner.latest_sequence_number().await
    }
}
