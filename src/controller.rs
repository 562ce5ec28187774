//! Run Controller: the single writer of pipeline state for one uploaded dataset.
//!
//! The controller accepts two command shapes, [`Command::RunAll`] and [`Command::RunOne`], and
//! keeps the per-stage status machine (`pending -> processing -> completed | failed`) together
//! with the committed result table. At most one run is in flight at a time; a second request is
//! refused with [`PipelineError::RunInProgress`] instead of being queued.
//!
//! ```rust
//! use tabular_console::controller::{Command, RunController};
//! use tabular_console::pipeline::{Dataset, PipelineEngine, PipelineOptions, PipelinePlan, StageStatus};
//! use tabular_console::stages::StageRegistry;
//! use tabular_console::types::{DataType, Field, RowSet, Schema, Value};
//!
//! let rows = RowSet::new(
//!     Schema::new(vec![Field::new("id", DataType::Utf8)]),
//!     vec![vec![Value::Utf8("a".into())], vec![Value::Utf8("a".into())]],
//! );
//! let registry = StageRegistry::default();
//! let plan = PipelinePlan::from_json(r#"{"stages": [{"kind": "clean", "options": {"dedupeBy": "id"}}]}"#, &registry)
//!     .unwrap();
//! let controller = RunController::new(PipelineEngine::new(PipelineOptions::default()), registry, plan, Dataset::new(rows));
//!
//! let run = controller.execute(Command::RunAll).unwrap();
//! assert_eq!(run.committed_result.unwrap().row_count(), 1);
//! assert_eq!(controller.status().stages[0].status, StageStatus::Completed);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::execution::CancellationToken;
use crate::pipeline::{
    Dataset, Fingerprint, PipelineEngine, PipelineEvent, PipelinePlan, PlannedStage, StageId, StageResult,
    StageStatus,
};
use crate::stages::{StageDiagnostics, StageKind, StageRegistry};
use crate::types::{RowSet, Table};

/// A request issued by the command layer.
///
/// Deserializes from `{"command": "runAll"}` or
/// `{"command": "runOne", "stage": "clean", "overrides": {"keepPolicy": "first"}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    RunAll,
    RunOne {
        stage: String,
        #[serde(default)]
        overrides: Map<String, JsonValue>,
    },
}

impl Command {
    /// `RunOne` for `stage` with the given option overrides.
    pub fn run_one(stage: impl Into<String>, overrides: Map<String, JsonValue>) -> Self {
        Self::RunOne {
            stage: stage.into(),
            overrides,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunAll => f.write_str("runAll"),
            Self::RunOne { stage, .. } => write!(f, "runOne({stage})"),
        }
    }
}

/// Record of one full or partial execution. Immutable once returned.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: String,
    /// Status of every plan stage when the run settled, in plan order.
    pub per_stage_status: Vec<(StageId, StageStatus)>,
    /// Output of the last requested stage; `None` when the run failed.
    pub committed_result: Option<Arc<RowSet>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<PipelineError>,
}

impl PipelineRun {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.per_stage_status
            .iter()
            .find(|(id, _)| id.as_str() == stage)
            .map(|(_, s)| *s)
    }
}

/// Read-only projection of one plan stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageView {
    pub id: StageId,
    pub kind: StageKind,
    pub status: StageStatus,
    pub diagnostics: Option<StageDiagnostics>,
}

/// What `status()` hands to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub stages: Vec<StageView>,
    pub committed_stage: Option<StageId>,
    /// Rendered committed result.
    pub table: Option<Table>,
    #[serde(skip)]
    pub committed: Option<Arc<RowSet>>,
    pub in_flight: bool,
    pub last_run_id: Option<String>,
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.id.as_str() == stage).map(|s| s.status)
    }
}

struct ControllerState {
    plan: PipelinePlan,
    statuses: Vec<StageStatus>,
    results: Vec<Option<Arc<StageResult>>>,
    committed: Option<Arc<RowSet>>,
    committed_stage: Option<StageId>,
    in_flight: Option<CancellationToken>,
    last_run: Option<PipelineRun>,
}

impl ControllerState {
    fn per_stage_status(&self) -> Vec<(StageId, StageStatus)> {
        self.plan.ids().cloned().zip(self.statuses.iter().copied()).collect()
    }
}

struct RunTicket {
    run_id: String,
    stages: Vec<PlannedStage>,
    cancel: CancellationToken,
    check_entity_key: bool,
    started_at: DateTime<Utc>,
}

/// Drives the [`PipelineEngine`] for one dataset and owns its run state.
pub struct RunController {
    engine: PipelineEngine,
    registry: StageRegistry,
    dataset: Dataset,
    state: Mutex<ControllerState>,
}

impl fmt::Debug for RunController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("engine", &self.engine)
            .field("plan", &self.plan())
            .finish_non_exhaustive()
    }
}

impl RunController {
    /// Controller for `dataset` with every stage of `plan` pending.
    ///
    /// `registry` validates the overrides of later `runOne` requests.
    pub fn new(engine: PipelineEngine, registry: StageRegistry, plan: PipelinePlan, dataset: Dataset) -> Self {
        let stages = plan.len();
        Self {
            engine,
            registry,
            dataset,
            state: Mutex::new(ControllerState {
                plan,
                statuses: vec![StageStatus::Pending; stages],
                results: vec![None; stages],
                committed: None,
                committed_stage: None,
                in_flight: None,
                last_run: None,
            }),
        }
    }

    /// Engine shared by every run, including its memo table and metrics.
    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    /// Dataset every run starts from.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Current plan, including every override applied so far.
    pub fn plan(&self) -> PipelinePlan {
        self.state().plan.clone()
    }

    /// Dispatch a command from the command layer to [`RunController::run_all`] or
    /// [`RunController::run_one`].
    pub fn execute(&self, command: Command) -> PipelineResult<PipelineRun> {
        match command {
            Command::RunAll => self.run_all(),
            Command::RunOne { stage, overrides } => self.run_one(&stage, &overrides),
        }
    }

    /// Run every stage in order, stopping at the first failure.
    ///
    /// On success the final stage's output becomes the committed result. On failure the previous
    /// committed result stays in place and the returned error names the failing stage; the
    /// settled [`PipelineRun`] is still available from [`RunController::last_run`].
    pub fn run_all(&self) -> PipelineResult<PipelineRun> {
        let ticket = self.begin(|state| {
            let stages = state.plan.stages().to_vec();
            state.statuses.fill(StageStatus::Pending);
            state.results.fill(None);
            Ok(stages)
        })?;
        self.drive(ticket)
    }

    /// Re-run `stage` with `overrides` merged into its options.
    ///
    /// The overrides are validated before anything runs; an invalid override leaves the plan and
    /// every status untouched. Upstream stages are served from the memo table. Every stage after
    /// `stage` is reset to pending, since its cached result was built from the old output.
    pub fn run_one(&self, stage: &str, overrides: &Map<String, JsonValue>) -> PipelineResult<PipelineRun> {
        let ticket = self.begin(|state| {
            let idx = state.plan.position(stage).ok_or_else(|| PipelineError::UnknownStage {
                stage: stage.to_string(),
            })?;
            let rebuilt = state.plan.stages()[idx].with_overrides(&self.registry, overrides)?;
            let pruned = self.engine.prune_stage(&rebuilt.id, Fingerprint::of_config(&rebuilt.config));
            if pruned > 0 {
                log::debug!("dropped {pruned} memoized result(s) of stage '{}'", rebuilt.id);
            }
            state.plan.replace(idx, rebuilt);
            for i in idx..state.statuses.len() {
                state.statuses[i] = StageStatus::Pending;
                state.results[i] = None;
            }
            Ok(state.plan.stages()[..=idx].to_vec())
        })?;
        self.drive(ticket)
    }

    /// Request cancellation of the in-flight run. Returns `false` when nothing is running.
    ///
    /// The run stops at the next stage boundary and settles with [`PipelineError::Cancelled`].
    pub fn cancel(&self) -> bool {
        match &self.state().in_flight {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().in_flight.is_some()
    }

    /// Snapshot of per-stage status, diagnostics and the committed table.
    ///
    /// Safe to poll from other threads while a run is in flight.
    pub fn status(&self) -> StatusSnapshot {
        let state = self.state();
        let stages = state
            .plan
            .stages()
            .iter()
            .zip(&state.statuses)
            .zip(&state.results)
            .map(|((stage, status), result)| StageView {
                id: stage.id.clone(),
                kind: stage.kind(),
                status: *status,
                diagnostics: result.as_ref().map(|r| r.diagnostics.clone()),
            })
            .collect();
        StatusSnapshot {
            stages,
            committed_stage: state.committed_stage.clone(),
            table: state.committed.as_ref().map(|rows| rows.to_table()),
            committed: state.committed.clone(),
            in_flight: state.in_flight.is_some(),
            last_run_id: state.last_run.as_ref().map(|r| r.run_id.clone()),
            last_error: state
                .last_run
                .as_ref()
                .and_then(|r| r.error.as_ref())
                .map(ToString::to_string),
        }
    }

    /// The most recently settled run, successful or not.
    pub fn last_run(&self) -> Option<PipelineRun> {
        self.state().last_run.clone()
    }

    /// Diagnostics of every stage that currently holds a result, in plan order.
    pub fn diagnostics(&self) -> Vec<(StageId, StageDiagnostics)> {
        let state = self.state();
        state
            .results
            .iter()
            .flatten()
            .map(|r| (r.stage_id.clone(), r.diagnostics.clone()))
            .collect()
    }

    /// Claim the single run slot and prepare the stage list under one lock.
    fn begin<F>(&self, prepare: F) -> PipelineResult<RunTicket>
    where
        F: FnOnce(&mut ControllerState) -> PipelineResult<Vec<PlannedStage>>,
    {
        let mut state = self.state();
        if state.in_flight.is_some() {
            log::warn!("run request refused: another run is in flight");
            return Err(PipelineError::RunInProgress);
        }
        let stages = prepare(&mut state)?;
        let cancel = CancellationToken::new();
        state.in_flight = Some(cancel.clone());
        Ok(RunTicket {
            run_id: Uuid::new_v4().to_string(),
            check_entity_key: stages.len() == state.plan.len(),
            stages,
            cancel,
            started_at: Utc::now(),
        })
    }

    fn drive(&self, ticket: RunTicket) -> PipelineResult<PipelineRun> {
        let clock = Instant::now();
        self.engine.emit(PipelineEvent::RunStarted {
            run_id: ticket.run_id.clone(),
            stages: ticket.stages.len(),
        });

        let outcome = self.engine.run_stages(
            &self.dataset,
            &ticket.stages,
            &ticket.cancel,
            ticket.check_entity_key,
            |id, status| self.set_status(id, status),
        );

        let run = {
            let mut state = self.state();
            for (i, result) in outcome.results.iter().enumerate() {
                state.results[i] = Some(Arc::clone(result));
            }
            let committed_result = match (&outcome.error, outcome.results.last()) {
                (None, Some(last)) => {
                    state.committed = Some(Arc::clone(&last.output));
                    state.committed_stage = Some(last.stage_id.clone());
                    Some(Arc::clone(&last.output))
                }
                _ => None,
            };
            let run = PipelineRun {
                run_id: ticket.run_id,
                per_stage_status: state.per_stage_status(),
                committed_result,
                started_at: ticket.started_at,
                finished_at: Utc::now(),
                error: outcome.error,
            };
            state.last_run = Some(run.clone());
            state.in_flight = None;
            run
        };

        self.engine.emit(PipelineEvent::RunFinished {
            run_id: run.run_id.clone(),
            elapsed: clock.elapsed(),
            error: run.error.clone(),
        });
        match &run.error {
            Some(err) => Err(err.clone()),
            None => Ok(run),
        }
    }

    fn set_status(&self, id: &StageId, status: StageStatus) {
        let mut state = self.state();
        if let Some(idx) = state.plan.position(id.as_str()) {
            state.statuses[idx] = status;
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::pipeline::PipelineOptions;
    use crate::types::{DataType, Field, Schema, Value};

    fn controller() -> RunController {
        let rows = RowSet::new(
            Schema::new(vec![Field::new("id", DataType::Utf8), Field::new("n", DataType::Int64)]),
            vec![
                vec![Value::Utf8("a".into()), Value::Int64(1)],
                vec![Value::Utf8("b".into()), Value::Null],
                vec![Value::Utf8("a".into()), Value::Int64(3)],
            ],
        );
        let registry = StageRegistry::default();
        let plan = PipelinePlan::from_json(
            r#"{"stages": [
                {"kind": "clean", "options": {"dedupeBy": "id"}},
                {"kind": "aggregate", "options": {"key": "id", "eventColumn": "n"}}
            ]}"#,
            &registry,
        )
        .unwrap();
        RunController::new(
            PipelineEngine::new(PipelineOptions::default()),
            registry,
            plan,
            Dataset::new(rows),
        )
    }

    #[test]
    fn commands_parse_from_json() {
        let all: Command = serde_json::from_str(r#"{"command": "runAll"}"#).unwrap();
        assert_eq!(all, Command::RunAll);
        let one: Command =
            serde_json::from_str(r#"{"command": "runOne", "stage": "clean", "overrides": {"keepPolicy": "first"}}"#)
                .unwrap();
        assert_eq!(one.to_string(), "runOne(clean)");
        assert!(serde_json::from_str::<Command>(r#"{"command": "runSome"}"#).is_err());
    }

    #[test]
    fn fresh_controller_reports_pending_stages() {
        let c = controller();
        let snap = c.status();
        assert_eq!(snap.stages.len(), 2);
        assert!(snap.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert!(snap.table.is_none());
        assert!(!snap.in_flight);
        assert!(!c.cancel());
    }

    #[test]
    fn run_all_commits_the_final_output() {
        let c = controller();
        let run = c.run_all().unwrap();
        assert!(run.is_success());
        assert_eq!(run.status_of("aggregate"), Some(StageStatus::Completed));
        assert_eq!(run.committed_result.as_ref().map(|r| r.row_count()), Some(2));

        let snap = c.status();
        assert_eq!(snap.committed_stage, Some(StageId::from("aggregate")));
        assert_eq!(snap.table.unwrap().columns, vec!["id", "n"]);
        assert_eq!(c.diagnostics().len(), 2);
        assert!(!c.is_running());
    }

    #[test]
    fn run_one_resets_downstream_stages() {
        let c = controller();
        c.run_all().unwrap();
        let overrides = serde_json::from_str(r#"{"keepPolicy": "first"}"#).unwrap();
        let run = c.run_one("clean", &overrides).unwrap();
        // The replaced clean config's result is pruned; aggregate's entry is untouched.
        assert_eq!(c.engine().cached_results(), 2);
        assert_eq!(run.status_of("clean"), Some(StageStatus::Completed));
        assert_eq!(run.status_of("aggregate"), Some(StageStatus::Pending));

        let snap = c.status();
        assert_eq!(snap.committed_stage, Some(StageId::from("clean")));
        assert!(snap.stages[1].diagnostics.is_none());
        assert_eq!(c.plan().stages()[0].options().get("keepPolicy"), Some(&JsonValue::from("first")));
    }

    #[test]
    fn invalid_override_changes_nothing() {
        let c = controller();
        c.run_all().unwrap();
        let before = c.plan();
        let overrides = serde_json::from_str(r#"{"keep": "first"}"#).unwrap();
        let err = c.run_one("clean", &overrides).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::UnknownOption { .. })));
        assert_eq!(c.plan(), before);
        assert_eq!(c.status().status_of("aggregate"), Some(StageStatus::Completed));
        assert_eq!(c.engine().metrics().stage_executions, 2);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let c = controller();
        assert_eq!(
            c.execute(Command::run_one("pivot", Map::new())).unwrap_err(),
            PipelineError::UnknownStage { stage: "pivot".into() }
        );
        assert!(c.last_run().is_none());
    }

    #[test]
    fn failed_run_keeps_previous_commit() {
        let c = controller();
        c.run_all().unwrap();
        let overrides = serde_json::from_str(r#"{"dedupeBy": "missing"}"#).unwrap();
        let err = c.run_one("clean", &overrides).unwrap_err();
        assert_eq!(err.stage(), Some(&StageId::from("clean")));

        let snap = c.status();
        assert_eq!(snap.status_of("clean"), Some(StageStatus::Failed));
        assert_eq!(snap.committed_stage, Some(StageId::from("aggregate")));
        assert!(snap.last_error.unwrap().contains("missing"));
        assert!(!c.last_run().unwrap().is_success());
    }
}
