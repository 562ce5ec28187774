//! Row-level execution for stages, plus wall-clock budgets.
//!
//! This module sits "below" [`crate::stages`] and provides:
//!
//! - Parallel (chunked) filter/map over a [`RowSet`] with deterministic output order
//! - Resource limits / throttling (in-flight chunks)
//! - Cumulative metrics for monitoring
//! - [`run_with_budget`], which bounds how long a unit of work may block its caller

mod deadline;
mod metrics;
mod semaphore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;

use crate::types::{RowSet, Value};

pub use deadline::{run_with_budget, BudgetError, CancellationToken};
pub use metrics::{ExecutionMetrics, ExecutionMetricsSnapshot};

use semaphore::Semaphore;

/// Configuration for the [`RowExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Number of worker threads.
    ///
    /// If `None`, uses the platform's available parallelism.
    pub num_threads: Option<usize>,
    /// Number of rows per chunk.
    pub chunk_size: usize,
    /// Upper bound on concurrently executing chunks, on top of `num_threads`.
    pub max_in_flight_chunks: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            num_threads: Some(n),
            chunk_size: 4_096,
            max_in_flight_chunks: n.max(1),
        }
    }
}

/// Chunked, order-preserving parallel filter/map over row-sets.
///
/// Chunks run concurrently on a dedicated rayon pool; results are concatenated in chunk order, so
/// the output is identical to a sequential pass regardless of scheduling.
pub struct RowExecutor {
    pool: ThreadPool,
    opts: ExecutionOptions,
    metrics: Arc<ExecutionMetrics>,
}

impl fmt::Debug for RowExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowExecutor")
            .field("threads", &self.pool.current_num_threads())
            .field("opts", &self.opts)
            .finish()
    }
}

impl RowExecutor {
    /// Create a new executor with the given options.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size == 0`, `max_in_flight_chunks == 0`, `num_threads == Some(0)`, or if the
    /// rayon pool cannot be built.
    pub fn new(opts: ExecutionOptions) -> Self {
        assert!(opts.chunk_size > 0, "chunk_size must be > 0");
        assert!(opts.max_in_flight_chunks > 0, "max_in_flight_chunks must be > 0");
        if let Some(n) = opts.num_threads {
            assert!(n > 0, "num_threads must be > 0 when set");
        }

        let n_threads = opts
            .num_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1);

        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("tabular-rows-{i}"))
            .build()
            .expect("failed to build rayon thread pool");

        Self {
            pool,
            opts,
            metrics: Arc::new(ExecutionMetrics::default()),
        }
    }

    /// Handle to the cumulative metrics of this executor.
    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Keep rows for which `predicate` holds, preserving input order.
    pub fn filter_parallel<F>(&self, rows: &RowSet, predicate: F) -> RowSet
    where
        F: Fn(&[Value]) -> bool + Send + Sync,
    {
        let kept = self.run_chunks(rows, |chunk| {
            chunk
                .iter()
                .filter(|row| predicate(row.as_slice()))
                .cloned()
                .collect()
        });
        RowSet::new(rows.schema.clone(), kept)
    }

    /// Apply `mapper` to every row, preserving input order and schema.
    ///
    /// # Panics
    ///
    /// Panics if `mapper` returns rows with a different length than the schema field count.
    pub fn map_parallel<F>(&self, rows: &RowSet, mapper: F) -> RowSet
    where
        F: Fn(&[Value]) -> Vec<Value> + Send + Sync,
    {
        let expected_len = rows.schema.len();
        let mapped = self.run_chunks(rows, |chunk| {
            chunk
                .iter()
                .map(|row| {
                    let out = mapper(row.as_slice());
                    assert!(
                        out.len() == expected_len,
                        "mapped row length {} does not match schema length {}",
                        out.len(),
                        expected_len
                    );
                    out
                })
                .collect()
        });
        RowSet::new(rows.schema.clone(), mapped)
    }

    fn run_chunks<F>(&self, rows: &RowSet, work: F) -> Vec<Vec<Value>>
    where
        F: Fn(&[Vec<Value>]) -> Vec<Vec<Value>> + Send + Sync,
    {
        let sem = Semaphore::new(self.opts.max_in_flight_chunks);
        let ranges = chunk_ranges(rows.row_count(), self.opts.chunk_size);

        let per_chunk: Vec<Vec<Vec<Value>>> = self.pool.install(|| {
            ranges
                .into_par_iter()
                .map(|range| {
                    let (_permit, waited) = sem.acquire();
                    if waited > Duration::ZERO {
                        self.metrics.on_throttle_wait(waited);
                    }
                    self.metrics.on_chunk_start();
                    let len = range.len();
                    let out = work(&rows.rows[range]);
                    self.metrics.on_rows_processed(len);
                    self.metrics.on_chunk_end();
                    out
                })
                .collect()
        });

        per_chunk.into_iter().flatten().collect()
    }
}

impl Default for RowExecutor {
    fn default() -> Self {
        Self::new(ExecutionOptions::default())
    }
}

fn chunk_ranges(row_count: usize, chunk_size: usize) -> Vec<std::ops::Range<usize>> {
    (0..row_count)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(row_count))
        .collect()
}
