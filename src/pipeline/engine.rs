use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::decode::DecodedBatch;
use crate::error::{PipelineError, PipelineResult, StageError};
use crate::execution::{run_with_budget, BudgetError, CancellationToken, ExecutionOptions, RowExecutor};
use crate::processing::group::{first_duplicate, resolve_column};
use crate::stages::{self, StageContext, StageDiagnostics, StageKind};
use crate::types::RowSet;

use super::observer::{PipelineEvent, PipelineMetrics, PipelineMetricsSnapshot, PipelineObserver};
use super::{Fingerprint, PlannedStage, StageId};

/// Default wall-clock budget for one stage invocation.
pub const DEFAULT_STAGE_BUDGET: Duration = Duration::from_secs(60);

/// Per-stage state as seen by the run controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Options for the [`PipelineEngine`].
#[derive(Clone)]
pub struct PipelineOptions {
    /// Wall-clock budget per stage; `None` runs stages inline without a deadline.
    pub stage_budget: Option<Duration>,
    /// Column that must be unique in the final output of a complete run.
    pub entity_key: Option<String>,
    /// Row-level executor settings shared by all stages.
    pub execution: ExecutionOptions,
    pub observer: Option<Arc<dyn PipelineObserver>>,
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("stage_budget", &self.stage_budget)
            .field("entity_key", &self.entity_key)
            .field("execution", &self.execution)
            .field("observer_set", &self.observer.is_some())
            .finish()
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stage_budget: Some(DEFAULT_STAGE_BUDGET),
            entity_key: None,
            execution: ExecutionOptions::default(),
            observer: None,
        }
    }
}

/// Primary row-set of a run plus the named tables stages may join against.
///
/// Fingerprints are computed once, when a table is added.
#[derive(Debug, Clone)]
pub struct Dataset {
    primary: Arc<RowSet>,
    primary_fingerprint: Fingerprint,
    tables: Arc<BTreeMap<String, Arc<RowSet>>>,
    table_fingerprints: BTreeMap<String, Fingerprint>,
}

impl Dataset {
    /// Dataset over `primary` with no named tables.
    pub fn new(primary: RowSet) -> Self {
        let primary_fingerprint = Fingerprint::of_rows(&primary);
        Self {
            primary: Arc::new(primary),
            primary_fingerprint,
            tables: Arc::new(BTreeMap::new()),
            table_fingerprints: BTreeMap::new(),
        }
    }

    /// Register `rows` under `name` for join stages, replacing any table of that name.
    pub fn with_table(mut self, name: impl Into<String>, rows: RowSet) -> Self {
        let name = name.into();
        self.table_fingerprints.insert(name.clone(), Fingerprint::of_rows(&rows));
        Arc::make_mut(&mut self.tables).insert(name, Arc::new(rows));
        self
    }

    /// Dataset whose primary row-set is the decoded file named `primary`.
    ///
    /// Every other decoded file becomes a named table, reachable by file name and by file stem
    /// (`schools.csv` and `schools`).
    pub fn from_batch(batch: &DecodedBatch, primary: &str) -> Option<Self> {
        let mut dataset = Self::new(batch.table(primary)?.clone());
        for decoded in batch.decoded.iter().filter(|d| d.file.name() != primary) {
            let name = decoded.file.name();
            dataset = dataset.with_table(name, decoded.rows.clone());
            if let Some(stem) = Path::new(name).file_stem().and_then(|s| s.to_str()) {
                if !dataset.tables.contains_key(stem) {
                    dataset = dataset.with_table(stem, decoded.rows.clone());
                }
            }
        }
        Some(dataset)
    }

    /// Row-set fed to the first stage.
    pub fn primary(&self) -> &RowSet {
        &self.primary
    }

    /// Content fingerprint of the primary row-set.
    pub fn fingerprint(&self) -> Fingerprint {
        self.primary_fingerprint
    }

    /// Named table, as a join stage's `right` option would resolve it.
    pub fn table(&self, name: &str) -> Option<&RowSet> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    fn table_fingerprint(&self, name: &str) -> Fingerprint {
        self.table_fingerprints
            .get(name)
            .copied()
            .unwrap_or_else(|| Fingerprint::combine(&[]))
    }
}

/// Completed output of one stage invocation. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage_id: StageId,
    pub kind: StageKind,
    pub input_fingerprint: Fingerprint,
    pub config_fingerprint: Fingerprint,
    pub output_fingerprint: Fingerprint,
    pub output: Arc<RowSet>,
    pub diagnostics: StageDiagnostics,
}

/// Results of the stages that completed, in order, plus the failure that stopped the run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub results: Vec<Arc<StageResult>>,
    pub error: Option<PipelineError>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Output of the last completed stage.
    pub fn final_output(&self) -> Option<&Arc<RowSet>> {
        self.results.last().map(|r| &r.output)
    }

    /// Completed results, or the error that stopped the run.
    pub fn into_result(self) -> PipelineResult<Vec<Arc<StageResult>>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    stage: StageId,
    input: Fingerprint,
    config: Fingerprint,
}

/// Sequential stage runner with a memo table shared across runs.
pub struct PipelineEngine {
    options: PipelineOptions,
    executor: Arc<RowExecutor>,
    memo: Mutex<HashMap<MemoKey, Arc<StageResult>>>,
    metrics: PipelineMetrics,
}

impl fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("options", &self.options)
            .field("cached_results", &self.cached_results())
            .finish()
    }
}

impl PipelineEngine {
    /// # Panics
    ///
    /// Panics if `options.execution` is invalid (see [`RowExecutor::new`]).
    pub fn new(options: PipelineOptions) -> Self {
        let executor = Arc::new(RowExecutor::new(options.execution.clone()));
        Self {
            options,
            executor,
            memo: Mutex::new(HashMap::new()),
            metrics: PipelineMetrics::default(),
        }
    }

    /// Options this engine was built with.
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Point-in-time copy of the stage counters merged with the row executor's counters.
    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        self.metrics.snapshot(self.executor.metrics().snapshot())
    }

    /// Number of memoized stage results.
    pub fn cached_results(&self) -> usize {
        self.memo().len()
    }

    /// Drop every memoized result.
    ///
    /// The memo table keeps one entry per distinct `(stage, input, config)` it has completed and
    /// never evicts on its own; [`PipelineEngine::prune_stage`] trims a single stage.
    pub fn clear_cache(&self) {
        self.memo().clear();
    }

    /// Drop the memoized results of `stage` built under any config other than `keep`.
    ///
    /// Returns the number of entries removed.
    pub fn prune_stage(&self, stage: &StageId, keep: Fingerprint) -> usize {
        let mut memo = self.memo();
        let before = memo.len();
        memo.retain(|key, _| &key.stage != stage || key.config == keep);
        before - memo.len()
    }

    /// Run `stages` in order over the dataset's primary row-set.
    ///
    /// Stops at the first failure, the first observed cancellation, or when the output of the last
    /// stage violates the configured entity key. `progress` sees every status transition.
    pub fn run<P>(&self, dataset: &Dataset, stages: &[PlannedStage], cancel: &CancellationToken, progress: P) -> PipelineOutcome
    where
        P: FnMut(&StageId, StageStatus),
    {
        self.run_stages(dataset, stages, cancel, true, progress)
    }

    pub(crate) fn run_stages<P>(
        &self,
        dataset: &Dataset,
        stages: &[PlannedStage],
        cancel: &CancellationToken,
        check_entity_key: bool,
        mut progress: P,
    ) -> PipelineOutcome
    where
        P: FnMut(&StageId, StageStatus),
    {
        let mut outcome = PipelineOutcome {
            results: Vec::with_capacity(stages.len()),
            error: None,
        };
        let mut input = Arc::clone(&dataset.primary);
        let mut input_fingerprint = dataset.primary_fingerprint;

        for stage in stages {
            if cancel.is_cancelled() {
                outcome.error = Some(PipelineError::Cancelled { stage: stage.id.clone() });
                break;
            }
            progress(&stage.id, StageStatus::Processing);
            match self.run_stage(dataset, stage, Arc::clone(&input), input_fingerprint) {
                Ok(result) => {
                    input = Arc::clone(&result.output);
                    input_fingerprint = result.output_fingerprint;
                    outcome.results.push(result);
                    progress(&stage.id, StageStatus::Completed);
                    if cancel.is_cancelled() {
                        outcome.error = Some(PipelineError::Cancelled { stage: stage.id.clone() });
                        break;
                    }
                }
                Err(err) => {
                    progress(&stage.id, StageStatus::Failed);
                    // `StageFailed` already carried `err`; a pending cancellation settles the run.
                    outcome.error = Some(if cancel.is_cancelled() {
                        PipelineError::Cancelled { stage: stage.id.clone() }
                    } else {
                        err
                    });
                    break;
                }
            }
        }

        if check_entity_key && outcome.error.is_none() {
            if let Err(err) = self.check_entity_key(&outcome.results) {
                if let Some(last) = outcome.results.pop() {
                    progress(&last.stage_id, StageStatus::Failed);
                }
                self.fail(err.clone());
                outcome.error = Some(err);
            }
        }
        outcome
    }

    /// Run a single stage on `input`, or return the memoized result for the same
    /// `(stage id, input, config)`.
    pub fn run_stage(
        &self,
        dataset: &Dataset,
        stage: &PlannedStage,
        input: Arc<RowSet>,
        input_fingerprint: Fingerprint,
    ) -> PipelineResult<Arc<StageResult>> {
        let config_fingerprint = Fingerprint::of_config(&stage.config);
        let input_fingerprint = match stage.config.right_table() {
            Some(name) => Fingerprint::combine(&[input_fingerprint, dataset.table_fingerprint(name)]),
            None => input_fingerprint,
        };
        let key = MemoKey {
            stage: stage.id.clone(),
            input: input_fingerprint,
            config: config_fingerprint,
        };

        let cached = self.memo().get(&key).cloned();
        if let Some(hit) = cached {
            self.metrics.on_cache_hit();
            self.emit(PipelineEvent::StageCacheHit {
                stage: stage.id.clone(),
                kind: stage.kind(),
                input: input_fingerprint,
                config: config_fingerprint,
            });
            return Ok(hit);
        }

        let rows_in = input.row_count();
        self.emit(PipelineEvent::StageStarted {
            stage: stage.id.clone(),
            kind: stage.kind(),
            rows_in,
        });
        self.metrics.on_execution();
        let started = Instant::now();

        let ctx = StageContext::new(Arc::clone(&self.executor)).with_tables(Arc::clone(&dataset.tables));
        let config = stage.config.clone();
        let output = match run_with_budget(self.options.stage_budget, move || stages::apply(&config, &input, &ctx)) {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(self.fail(PipelineError::Stage {
                    stage: stage.id.clone(),
                    source,
                }));
            }
            Err(BudgetError::Exceeded) => {
                return Err(self.fail(PipelineError::Timeout {
                    stage: stage.id.clone(),
                    budget: self.options.stage_budget.unwrap_or_default(),
                }));
            }
            Err(BudgetError::Panicked) => {
                return Err(self.fail(PipelineError::Aborted { stage: stage.id.clone() }));
            }
        };

        let result = Arc::new(StageResult {
            stage_id: stage.id.clone(),
            kind: stage.kind(),
            input_fingerprint,
            config_fingerprint,
            output_fingerprint: Fingerprint::of_rows(&output.rows),
            output: Arc::new(output.rows),
            diagnostics: output.diagnostics,
        });
        self.emit(PipelineEvent::StageFinished {
            stage: stage.id.clone(),
            kind: stage.kind(),
            rows_in,
            rows_out: result.output.row_count(),
            elapsed: started.elapsed(),
        });

        Ok(Arc::clone(self.memo().entry(key).or_insert(result)))
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        if let Some(observer) = &self.options.observer {
            observer.on_event(&event);
        }
    }

    fn fail(&self, err: PipelineError) -> PipelineError {
        self.metrics.on_failure();
        if let Some(stage) = err.stage() {
            self.emit(PipelineEvent::StageFailed {
                stage: stage.clone(),
                error: err.clone(),
            });
        }
        err
    }

    fn check_entity_key(&self, results: &[Arc<StageResult>]) -> PipelineResult<()> {
        let (Some(column), Some(last)) = (&self.options.entity_key, results.last()) else {
            return Ok(());
        };
        let to_error = |source: StageError| PipelineError::Stage {
            stage: last.stage_id.clone(),
            source,
        };
        let idx = resolve_column(&last.output.schema, column).map_err(to_error)?;
        match first_duplicate(&last.output.rows, &[idx]) {
            Some(key) => Err(to_error(StageError::DuplicateKey {
                column: column.clone(),
                key,
            })),
            None => Ok(()),
        }
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<MemoKey, Arc<StageResult>>> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
