//! Pipeline engine: runs an ordered list of stages with memoization, budgets and cancellation.
//!
//! Each stage invocation is keyed by `(stage id, input fingerprint, config fingerprint)`. When the
//! memo table already holds a result for that key, the stored [`StageResult`] is returned as-is
//! (same `Arc`), so re-running a late stage with new parameters reuses every earlier stage.
//!
//! ```rust
//! use tabular_console::pipeline::{Dataset, PipelineEngine, PipelineOptions, PipelinePlan};
//! use tabular_console::execution::CancellationToken;
//! use tabular_console::stages::StageRegistry;
//! use tabular_console::types::{DataType, Field, RowSet, Schema, Value};
//!
//! let rows = RowSet::new(
//!     Schema::new(vec![Field::new("id", DataType::Utf8), Field::new("n", DataType::Int64)]),
//!     vec![
//!         vec![Value::Utf8("a".into()), Value::Int64(1)],
//!         vec![Value::Utf8("a".into()), Value::Int64(2)],
//!     ],
//! );
//! let plan = PipelinePlan::from_json(
//!     r#"{"stages": [{"kind": "clean", "options": {"dedupeBy": "id"}}]}"#,
//!     &StageRegistry::default(),
//! )
//! .unwrap();
//!
//! let engine = PipelineEngine::new(PipelineOptions::default());
//! let outcome = engine.run(&Dataset::new(rows), plan.stages(), &CancellationToken::new(), |_, _| {});
//! assert!(outcome.error.is_none());
//! assert_eq!(outcome.final_output().unwrap().row_count(), 1);
//! ```

mod engine;
mod fingerprint;
mod observer;
mod plan;

use std::fmt;

use serde::Serialize;

pub use engine::{
    Dataset, PipelineEngine, PipelineOptions, PipelineOutcome, StageResult, StageStatus, DEFAULT_STAGE_BUDGET,
};
pub use fingerprint::Fingerprint;
pub use observer::{
    CompositeObserver, LogObserver, PipelineEvent, PipelineMetrics, PipelineMetricsSnapshot, PipelineObserver,
    StdErrObserver,
};
pub use plan::{PipelinePlan, PlannedStage};

/// Identifier of a stage within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
