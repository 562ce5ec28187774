use std::time::Duration;

use thiserror::Error;

use crate::pipeline::StageId;
use crate::stages::StageKind;

/// Convenience result type for decoding.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Convenience result type for building stage configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Convenience result type for a single stage transformation.
pub type StageOutcome<T> = Result<T, StageError>;

/// Convenience result type for pipeline and controller operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why the ingestion gate rejected a file.
///
/// Rejections are recorded per file on the batch; they are never raised as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    /// The declared MIME type is not CSV or a spreadsheet variant.
    #[error("unsupported type '{mime}' (expected CSV or XLSX)")]
    UnsupportedType { mime: String },

    /// The file exceeds the configured size ceiling.
    #[error("file is {size}, limit is {limit_size}")]
    TooLarge {
        size: String,
        limit_size: String,
        byte_length: u64,
        limit: u64,
    },
}

/// Error type returned by the tabular decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The byte stream is empty.
    #[error("file is empty")]
    EmptyFile,

    /// A header row exists but declares no columns.
    #[error("header row has no columns")]
    NoColumns,

    /// A header row exists but no data rows follow it.
    #[error("file has a header but no data rows")]
    NoRows,

    /// A data row has a different field count than the header.
    #[error("malformed row at line {line}: expected {expected} fields, found {found}")]
    MalformedRow {
        line: u64,
        expected: usize,
        found: usize,
    },

    /// The bytes could not be read as the declared format (bad encoding, corrupt archive).
    #[error("unreadable input: {message}")]
    Unreadable { message: String },

    /// Underlying CSV reader error not covered by a more specific variant.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "excel")]
    /// Spreadsheet reader error (feature-gated behind `excel`).
    #[error("spreadsheet error: {0}")]
    Excel(#[from] calamine::Error),

    /// The file was rejected by the ingestion gate and must not be decoded.
    #[error("file was rejected at ingestion: {reason}")]
    Rejected { reason: RejectionReason },

    /// The file kind cannot be decoded by this build.
    #[error("decoding {kind} files is not enabled in this build")]
    Unsupported { kind: &'static str },

    /// Decoding did not finish within its wall-clock budget.
    #[error("decode exceeded its budget of {budget:?}")]
    Timeout { budget: Duration },
}

/// Invalid stage or plan configuration, raised before any row is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An option key the stage does not declare.
    #[error("{stage}: unknown option '{option}' (recognized: {})", .recognized.join(", "))]
    UnknownOption {
        stage: StageKind,
        option: String,
        recognized: Vec<&'static str>,
    },

    /// A recognized option with a value of the wrong shape or outside its domain.
    #[error("{stage}: invalid value for '{option}': {message}")]
    InvalidValue {
        stage: StageKind,
        option: String,
        message: String,
    },

    /// A required option is absent.
    #[error("{stage}: missing required option '{option}'")]
    MissingOption { stage: StageKind, option: &'static str },

    /// A plan names a stage kind the registry does not know.
    #[error("unknown stage kind '{kind}'")]
    UnknownStageKind { kind: String },

    /// Two stages in one plan share an id.
    #[error("duplicate stage id '{id}'")]
    DuplicateStageId { id: String },

    /// A plan document could not be parsed.
    #[error("invalid plan: {message}")]
    Plan { message: String },
}

/// Runtime failure of a single stage on a concrete row-set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// A configured column does not exist in the stage input.
    #[error("column '{column}' not found (columns: {})", .available.join(", "))]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },

    /// A join references a table that was not supplied with the dataset.
    #[error("table '{name}' not found in dataset")]
    MissingTable { name: String },

    /// The join produced rows with a null key and `consistencyCheck` is on.
    #[error("join produced {count} row(s) with a null '{column}' (first at output row {sample_row})")]
    NullJoinKeys {
        column: String,
        count: usize,
        sample_row: usize,
    },

    /// A column required to be unique holds a repeated key.
    #[error("key column '{column}' is not unique: '{key}' appears more than once")]
    DuplicateKey { column: String, key: String },

    /// A stage produced a row whose arity differs from its schema.
    #[error("row {row} has {found} cells, schema has {expected}")]
    ShapeMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Error type for pipeline runs and run-controller commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Configuration rejected before execution.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stage failed on its input.
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: StageId,
        #[source]
        source: StageError,
    },

    /// A stage did not finish within its wall-clock budget.
    #[error("stage '{stage}' exceeded its budget of {budget:?}")]
    Timeout { stage: StageId, budget: Duration },

    /// The run was cancelled; `stage` is where the cancellation was observed.
    #[error("run cancelled at stage '{stage}'")]
    Cancelled { stage: StageId },

    /// The stage worker stopped without producing a result.
    #[error("stage '{stage}' aborted without a result")]
    Aborted { stage: StageId },

    /// Another run is in flight for this dataset.
    #[error("a run is already in progress for this dataset")]
    RunInProgress,

    /// A command referenced a stage id that is not part of the plan.
    #[error("no stage with id '{stage}' in the plan")]
    UnknownStage { stage: String },
}

impl PipelineError {
    /// Stage id the failure is attributed to, when there is one.
    pub fn stage(&self) -> Option<&StageId> {
        match self {
            Self::Stage { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::Cancelled { stage }
            | Self::Aborted { stage } => Some(stage),
            _ => None,
        }
    }
}
