use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::execution::ExecutionMetricsSnapshot;
use crate::stages::StageKind;

use super::{Fingerprint, StageId};

/// Events emitted while a run executes.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        stages: usize,
    },
    StageStarted {
        stage: StageId,
        kind: StageKind,
        rows_in: usize,
    },
    StageCacheHit {
        stage: StageId,
        kind: StageKind,
        input: Fingerprint,
        config: Fingerprint,
    },
    StageFinished {
        stage: StageId,
        kind: StageKind,
        rows_in: usize,
        rows_out: usize,
        elapsed: Duration,
    },
    StageFailed {
        stage: StageId,
        error: PipelineError,
    },
    RunFinished {
        run_id: String,
        elapsed: Duration,
        error: Option<PipelineError>,
    },
}

/// Observer hook for pipeline events.
///
/// Called synchronously on the thread driving the run; never while controller state is locked.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Writes one bracket-tagged line per event to stderr.
#[derive(Debug, Default)]
pub struct StdErrObserver;

impl PipelineObserver for StdErrObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RunStarted { run_id, stages } => {
                eprintln!("[pipeline][run] id={run_id} stages={stages}");
            }
            PipelineEvent::StageStarted { stage, kind, rows_in } => {
                eprintln!("[pipeline][start] stage={stage} kind={kind} rows_in={rows_in}");
            }
            PipelineEvent::StageCacheHit { stage, input, config, .. } => {
                eprintln!(
                    "[pipeline][cached] stage={stage} input={} config={}",
                    input.short(),
                    config.short()
                );
            }
            PipelineEvent::StageFinished {
                stage,
                rows_in,
                rows_out,
                elapsed,
                ..
            } => {
                eprintln!("[pipeline][ok] stage={stage} rows={rows_in}->{rows_out} elapsed={elapsed:?}");
            }
            PipelineEvent::StageFailed { stage, error } => {
                eprintln!("[pipeline][failed] stage={stage} err={error}");
            }
            PipelineEvent::RunFinished { run_id, elapsed, error } => match error {
                Some(e) => eprintln!("[pipeline][run-failed] id={run_id} elapsed={elapsed:?} err={e}"),
                None => eprintln!("[pipeline][run-ok] id={run_id} elapsed={elapsed:?}"),
            },
        }
    }
}

/// Forwards pipeline events to the `log` facade under the `tabular_console::pipeline` target.
#[derive(Debug, Default)]
pub struct LogObserver;

impl PipelineObserver for LogObserver {
    fn on_event(&self, event: &PipelineEvent) {
        const TARGET: &str = "tabular_console::pipeline";
        match event {
            PipelineEvent::RunStarted { run_id, stages } => {
                log::info!(target: TARGET, "run {run_id} started with {stages} stage(s)");
            }
            PipelineEvent::StageStarted { stage, kind, rows_in } => {
                log::debug!(target: TARGET, "stage {stage} ({kind}) started on {rows_in} rows");
            }
            PipelineEvent::StageCacheHit { stage, input, .. } => {
                log::debug!(target: TARGET, "stage {stage} reused memoized result for input {}", input.short());
            }
            PipelineEvent::StageFinished {
                stage,
                rows_in,
                rows_out,
                elapsed,
                ..
            } => {
                log::info!(target: TARGET, "stage {stage} finished: {rows_in} -> {rows_out} rows in {elapsed:?}");
            }
            PipelineEvent::StageFailed { stage, error } => {
                log::warn!(target: TARGET, "stage {stage} failed: {error}");
            }
            PipelineEvent::RunFinished { run_id, elapsed, error } => match error {
                Some(e) => log::warn!(target: TARGET, "run {run_id} failed after {elapsed:?}: {e}"),
                None => log::info!(target: TARGET, "run {run_id} finished in {elapsed:?}"),
            },
        }
    }
}

/// Fan-out observer.
pub struct CompositeObserver {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn PipelineObserver>>) -> Self {
        Self { observers }
    }
}

impl PipelineObserver for CompositeObserver {
    fn on_event(&self, event: &PipelineEvent) {
        for o in &self.observers {
            o.on_event(event);
        }
    }
}

/// Cumulative engine counters. `stage_executions` counts actual stage invocations, so a memo hit
/// leaves it unchanged.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    stage_executions: AtomicU64,
    cache_hits: AtomicU64,
    stage_failures: AtomicU64,
}

impl PipelineMetrics {
    pub(crate) fn on_execution(&self) {
        self.stage_executions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn on_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn on_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshot combined with the row-level counters of the engine's executor.
    pub fn snapshot(&self, rows: ExecutionMetricsSnapshot) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            stage_executions: self.stage_executions.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            stage_failures: self.stage_failures.load(Ordering::SeqCst),
            rows_processed: rows.rows_processed,
            chunks_processed: rows.chunks_finished,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    pub stage_executions: u64,
    pub cache_hits: u64,
    pub stage_failures: u64,
    pub rows_processed: u64,
    pub chunks_processed: u64,
}

impl fmt::Display for PipelineMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage_executions={}, cache_hits={}, stage_failures={}, rows_processed={}, chunks={}",
            self.stage_executions, self.cache_hits, self.stage_failures, self.rows_processed, self.chunks_processed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PipelineObserver for Recorder {
        fn on_event(&self, event: &PipelineEvent) {
            self.0.lock().unwrap().push(format!("{event:?}"));
        }
    }

    #[test]
    fn composite_fans_out_to_every_observer() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let composite = CompositeObserver::new(vec![
            a.clone() as Arc<dyn PipelineObserver>,
            b.clone() as Arc<dyn PipelineObserver>,
            Arc::new(StdErrObserver),
        ]);
        composite.on_event(&PipelineEvent::RunStarted {
            run_id: "r1".into(),
            stages: 4,
        });
        assert_eq!(a.0.lock().unwrap().len(), 1);
        assert_eq!(b.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn snapshot_merges_row_counters() {
        let m = PipelineMetrics::default();
        m.on_execution();
        m.on_execution();
        m.on_cache_hit();
        let snap = m.snapshot(ExecutionMetricsSnapshot {
            rows_processed: 10,
            chunks_started: 2,
            chunks_finished: 2,
            throttle_wait: Duration::ZERO,
            max_active_chunks: 1,
        });
        assert_eq!(snap.stage_executions, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.chunks_processed, 2);
        assert_eq!(
            snap.to_string(),
            "stage_executions=2, cache_hits=1, stage_failures=0, rows_processed=10, chunks=2"
        );
    }
}
