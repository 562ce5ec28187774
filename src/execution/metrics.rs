use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Cumulative row-level counters for a [`super::RowExecutor`].
///
/// The executor updates these during every stage it serves; callers can snapshot at any time.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    rows_processed: AtomicU64,
    chunks_started: AtomicU64,
    chunks_finished: AtomicU64,
    throttle_wait_ns: AtomicU64,
    active_chunks: AtomicUsize,
    max_active_chunks: AtomicUsize,
}

impl ExecutionMetrics {
    pub(crate) fn on_rows_processed(&self, n: usize) {
        self.rows_processed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_chunk_start(&self) {
        self.chunks_started.fetch_add(1, Ordering::Relaxed);
        let now = self.active_chunks.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_chunks.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn on_chunk_end(&self) {
        self.chunks_finished.fetch_add(1, Ordering::Relaxed);
        self.active_chunks.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn on_throttle_wait(&self, d: Duration) {
        let add = d.as_nanos().min(u64::MAX as u128) as u64;
        self.throttle_wait_ns.fetch_add(add, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutionMetricsSnapshot {
        ExecutionMetricsSnapshot {
            rows_processed: self.rows_processed.load(Ordering::SeqCst),
            chunks_started: self.chunks_started.load(Ordering::SeqCst),
            chunks_finished: self.chunks_finished.load(Ordering::SeqCst),
            throttle_wait: Duration::from_nanos(self.throttle_wait_ns.load(Ordering::SeqCst)),
            max_active_chunks: self.max_active_chunks.load(Ordering::SeqCst),
        }
    }
}

/// Immutable snapshot of [`ExecutionMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMetricsSnapshot {
    pub rows_processed: u64,
    pub chunks_started: u64,
    pub chunks_finished: u64,
    pub throttle_wait: Duration,
    pub max_active_chunks: usize,
}

impl fmt::Display for ExecutionMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows_processed={}, chunks={}/{}, max_active_chunks={}, throttle_wait={:?}",
            self.rows_processed, self.chunks_finished, self.chunks_started, self.max_active_chunks, self.throttle_wait
        )
    }
}
