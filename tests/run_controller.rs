use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use tabular_console::controller::{Command, RunController};
use tabular_console::pipeline::{
    Dataset, LogObserver, PipelineEngine, PipelineEvent, PipelineObserver, PipelineOptions, PipelinePlan,
    StageStatus,
};
use tabular_console::stages::StageRegistry;
use tabular_console::types::{DataType, Field, RowSet, Schema, Value};
use tabular_console::PipelineError;

const PLAN: &str = r#"{"stages": [
    {"kind": "clean", "options": {"dedupeBy": "id", "trimWhitespace": true}},
    {"kind": "transform", "options": {"categoryNormalization": {"club": {"Soccer": ["soccer", "football"]}}}},
    {"kind": "aggregate", "options": {"key": "id", "eventColumn": "day"}}
]}"#;

fn rows() -> RowSet {
    RowSet::new(
        Schema::new(vec![
            Field::new("id", DataType::Utf8),
            Field::new("club", DataType::Utf8),
            Field::new("day", DataType::Int64),
        ]),
        vec![
            vec![Value::Utf8("S1".into()), Value::Utf8(" football ".into()), Value::Int64(3)],
            vec![Value::Utf8("S2".into()), Value::Utf8("soccer".into()), Value::Int64(1)],
            vec![Value::Utf8("S1".into()), Value::Utf8("Soccer".into()), Value::Int64(2)],
        ],
    )
}

/// Observer that reaches back into the controller it observes.
#[derive(Default)]
struct Reentrant {
    controller: OnceLock<Weak<RunController>>,
    on_stage: Option<&'static str>,
    cancel: bool,
    nested: Mutex<Vec<Result<(), PipelineError>>>,
    events: Mutex<Vec<String>>,
}

impl Reentrant {
    fn controller(&self) -> Option<Arc<RunController>> {
        self.controller.get().and_then(Weak::upgrade)
    }
}

impl PipelineObserver for Reentrant {
    fn on_event(&self, event: &PipelineEvent) {
        let label = match event {
            PipelineEvent::RunStarted { .. } => "run-started".to_string(),
            PipelineEvent::StageStarted { stage, .. } => format!("started:{stage}"),
            PipelineEvent::StageCacheHit { stage, .. } => format!("cached:{stage}"),
            PipelineEvent::StageFinished { stage, .. } => format!("finished:{stage}"),
            PipelineEvent::StageFailed { stage, .. } => format!("failed:{stage}"),
            PipelineEvent::RunFinished { error, .. } => {
                format!("run-finished:{}", if error.is_some() { "err" } else { "ok" })
            }
        };
        self.events.lock().unwrap().push(label);

        let PipelineEvent::StageFinished { stage, .. } = event else {
            return;
        };
        if Some(stage.as_str()) != self.on_stage {
            return;
        }
        let Some(controller) = self.controller() else {
            return;
        };
        if self.cancel {
            assert!(controller.cancel());
        } else {
            let nested = controller.execute(Command::RunAll).map(|_| ());
            self.nested.lock().unwrap().push(nested);
        }
    }
}

fn controller_observed_by(observer: Arc<Reentrant>) -> Arc<RunController> {
    let registry = StageRegistry::default();
    let plan = PipelinePlan::from_json(PLAN, &registry).unwrap();
    let controller = Arc::new(RunController::new(
        PipelineEngine::new(PipelineOptions {
            observer: Some(observer.clone()),
            ..Default::default()
        }),
        registry,
        plan,
        Dataset::new(rows()),
    ));
    let _ = observer.controller.set(Arc::downgrade(&controller));
    controller
}

#[test]
fn second_request_while_running_is_refused() {
    let observer = Arc::new(Reentrant {
        on_stage: Some("clean"),
        ..Default::default()
    });
    let controller = controller_observed_by(observer.clone());

    let run = controller.execute(Command::RunAll).unwrap();
    assert!(run.is_success());
    assert_eq!(*observer.nested.lock().unwrap(), vec![Err(PipelineError::RunInProgress)]);
    assert_eq!(controller.engine().metrics().stage_executions, 3);

    // Once settled, the next request is accepted.
    assert!(controller.execute(Command::RunAll).is_ok());
}

#[test]
fn cancellation_is_honoured_at_the_next_stage_boundary() {
    let observer = Arc::new(Reentrant {
        on_stage: Some("transform"),
        cancel: true,
        ..Default::default()
    });
    let controller = controller_observed_by(observer.clone());

    let err = controller.run_all().unwrap_err();
    assert_eq!(err, PipelineError::Cancelled { stage: "transform".into() });

    let status = controller.status();
    assert_eq!(status.status_of("clean"), Some(StageStatus::Completed));
    assert_eq!(status.status_of("transform"), Some(StageStatus::Completed));
    assert_eq!(status.status_of("aggregate"), Some(StageStatus::Pending));
    assert!(status.table.is_none());
    assert!(!status.in_flight);
    assert!(status.last_error.unwrap().contains("cancelled"));
    assert!(!controller.cancel());

    let events = observer.events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("run-started"));
    assert_eq!(events.last().map(String::as_str), Some("run-finished:err"));
    assert!(!events.iter().any(|e| e == "started:aggregate"));
}

/// Cancels the observed controller as soon as any stage starts executing.
#[derive(Default)]
struct CancelOnStart {
    controller: OnceLock<Weak<RunController>>,
    failures: Mutex<Vec<PipelineError>>,
}

impl PipelineObserver for CancelOnStart {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { .. } => {
                if let Some(controller) = self.controller.get().and_then(Weak::upgrade) {
                    assert!(controller.cancel());
                }
            }
            PipelineEvent::StageFailed { error, .. } => self.failures.lock().unwrap().push(error.clone()),
            _ => {}
        }
    }
}

#[test]
fn cancellation_wins_over_a_stage_timeout() {
    let wide = RowSet::new(
        Schema::new(vec![Field::new("club", DataType::Utf8)]),
        (0..300_000).map(|_| vec![Value::Utf8(" football ".into())]).collect(),
    );
    let registry = StageRegistry::default();
    let plan = PipelinePlan::from_json(
        r#"{"stages": [{"kind": "clean", "options": {"trimWhitespace": true}}]}"#,
        &registry,
    )
    .unwrap();
    let observer = Arc::new(CancelOnStart::default());
    let controller = Arc::new(RunController::new(
        PipelineEngine::new(PipelineOptions {
            stage_budget: Some(Duration::from_micros(1)),
            observer: Some(observer.clone()),
            ..Default::default()
        }),
        registry,
        plan,
        Dataset::new(wide),
    ));
    let _ = observer.controller.set(Arc::downgrade(&controller));

    let err = controller.run_all().unwrap_err();
    assert_eq!(err, PipelineError::Cancelled { stage: "clean".into() });
    assert!(matches!(
        observer.failures.lock().unwrap().as_slice(),
        [PipelineError::Timeout { .. }]
    ));
    assert_eq!(controller.status().status_of("clean"), Some(StageStatus::Failed));
    assert!(!controller.is_running());
}

#[test]
fn run_one_status_walks_through_processing() {
    let observer = Arc::new(Reentrant::default());
    let controller = controller_observed_by(observer.clone());
    controller.run_all().unwrap();
    observer.events.lock().unwrap().clear();

    let overrides = serde_json::from_str(r#"{"categoryNormalization": {}}"#).unwrap();
    controller.run_one("transform", &overrides).unwrap();
    let events = observer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "run-started",
            "cached:clean",
            "started:transform",
            "finished:transform",
            "run-finished:ok"
        ]
    );
    assert_eq!(controller.status().status_of("aggregate"), Some(StageStatus::Pending));
}

#[test]
fn status_is_readable_from_other_threads() {
    let registry = StageRegistry::default();
    let plan = PipelinePlan::from_json(PLAN, &registry).unwrap();
    let controller = Arc::new(RunController::new(
        PipelineEngine::new(PipelineOptions {
            observer: Some(Arc::new(LogObserver)),
            ..Default::default()
        }),
        registry,
        plan,
        Dataset::new(rows()),
    ));

    let runner = {
        let c = Arc::clone(&controller);
        thread::spawn(move || c.run_all())
    };
    let pollers: Vec<_> = (0..4)
        .map(|_| {
            let c = Arc::clone(&controller);
            thread::spawn(move || {
                for _ in 0..50 {
                    let snapshot = c.status();
                    assert_eq!(snapshot.stages.len(), 3);
                }
            })
        })
        .collect();
    for p in pollers {
        p.join().unwrap();
    }
    runner.join().unwrap().unwrap();

    let table = controller.status().table.unwrap();
    assert_eq!(table.columns, vec!["id", "club", "day"]);
    assert_eq!(
        table.rows,
        vec![vec!["S2", "Soccer", "1"], vec!["S1", "Soccer", "2"]]
    );
    let json = serde_json::to_value(controller.status()).unwrap();
    assert_eq!(json["stages"][0]["status"], "completed");
    assert_eq!(json["committedStage"], "aggregate");
}
