//! `tabular-console` is the core of a conversational data-processing console: it validates uploaded
//! files, decodes them into typed in-memory tables and runs a memoized
//! clean/transform/join/aggregate pipeline over them.
//!
//! Data flows through the crate in one direction:
//!
//! 1. [`ingestion::submit`] checks declared type and size and rejects files per entry
//! 2. [`decode::decode_batch`] turns accepted CSV/XLSX uploads into [`types::RowSet`]s
//! 3. [`pipeline::PipelineEngine`] runs the configured [`stages`] in order, reusing memoized results
//! 4. [`controller::RunController`] owns run state and exposes status plus the committed table
//!
//! ## What you can upload
//!
//! - **CSV**: `text/csv` (and `text/tab-separated-values`, decoded with a tab delimiter)
//! - **Spreadsheets** (Cargo feature `excel`, on by default):
//!   `application/vnd.openxmlformats-officedocument.spreadsheetml.sheet`, `application/vnd.ms-excel`
//!
//! Files larger than [`ingestion::DEFAULT_MAX_FILE_BYTES`] (10 MiB) are rejected before any byte is
//! read. Column types are inferred per column: [`types::DataType::Int64`],
//! [`types::DataType::Float64`], [`types::DataType::Date`] or [`types::DataType::Utf8`]. Empty cells
//! become [`types::Value::Null`].
//!
//! ## Quick example: upload, decode, run
//!
//! ```rust
//! use tabular_console::controller::{Command, RunController};
//! use tabular_console::decode::{decode_batch, DecodeOptions};
//! use tabular_console::ingestion::{submit, FileSubmission, IngestionOptions};
//! use tabular_console::pipeline::{Dataset, PipelineEngine, PipelineOptions, PipelinePlan};
//! use tabular_console::stages::StageRegistry;
//!
//! let csv = "id,name,firstEventDate\nS001,Aoki,2024-04-01\nS002,Baba,2024-04-03\nS001,Aoki,2024-04-09\n";
//! let batch = submit(
//!     vec![FileSubmission::new("students.csv", "text/csv", csv.as_bytes().to_vec())],
//!     &IngestionOptions::default(),
//! );
//! assert!(batch.rejected.is_empty());
//!
//! let decoded = decode_batch(&batch.accepted, &DecodeOptions::default());
//! let dataset = Dataset::from_batch(&decoded, "students.csv").unwrap();
//!
//! let registry = StageRegistry::default();
//! let plan = PipelinePlan::from_json(
//!     r#"{"stages": [
//!         {"kind": "clean", "options": {"dedupeBy": "id", "keepPolicy": "last"}},
//!         {"kind": "aggregate", "options": {"key": "id", "eventColumn": "firstEventDate"}}
//!     ]}"#,
//!     &registry,
//! )
//! .unwrap();
//!
//! let controller = RunController::new(PipelineEngine::new(PipelineOptions::default()), registry, plan, dataset);
//! controller.execute(Command::RunAll).unwrap();
//!
//! let status = controller.status();
//! let table = status.table.unwrap();
//! assert_eq!(table.rows.len(), 2);
//! // The kept S001 row sits where its last occurrence was.
//! assert_eq!(table.rows[1], vec!["S001", "Aoki", "2024-04-09"]);
//! ```
//!
//! ## Stages
//!
//! | kind        | options                                                                   |
//! |-------------|---------------------------------------------------------------------------|
//! | `clean`     | `dedupeBy`, `keepPolicy`, `missingValuePolicy`, `trimWhitespace`            |
//! | `transform` | `dateFormat`, `categoryNormalization`                                      |
//! | `join`      | `right`, `on`, `joinType`, `consistencyCheck`                              |
//! | `aggregate` | `key`, `eventColumn`, `aggregationMethod`, `resolveCanonicalNames`, ...    |
//!
//! Unknown or malformed options are rejected when the config is built, before any row is touched
//! (see [`stages::StageRegistry`]).
//!
//! ## Modules
//!
//! - [`ingestion`]: upload gate and ingestion observers
//! - [`decode`]: CSV/XLSX decoding and column type inference
//! - [`types`]: schema, typed cells, row-sets and rendered tables
//! - [`processing`]: reductions and grouping helpers used by the stages
//! - [`execution`]: parallel row executor, wall-clock budgets and cancellation tokens
//! - [`stages`]: stage registry, typed stage configs and the four stage implementations
//! - [`pipeline`]: fingerprints, memo table, plans and pipeline observers
//! - [`controller`]: run state machine and the command surface
//! - [`error`]: error types for every layer

pub mod controller;
pub mod decode;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod pipeline;
pub mod processing;
pub mod stages;
pub mod types;

pub use controller::{Command, PipelineRun, RunController, StatusSnapshot};
pub use error::{
    ConfigError, ConfigResult, DecodeError, DecodeResult, PipelineError, PipelineResult, RejectionReason, StageError,
    StageOutcome,
};
