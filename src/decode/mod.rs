//! Tabular decoder: turns accepted uploads into typed [`crate::types::RowSet`]s.
//!
//! Most callers should use [`decode_batch`], which decodes every accepted file of a batch in
//! parallel and collects per-file failures without aborting the batch. [`decode`] handles a single
//! file. Format-specific functions are available under [`csv`] and (with the `excel` feature)
//! [`excel`]; column typing lives in [`infer`].

pub mod csv;
#[cfg(feature = "excel")]
pub mod excel;
pub mod infer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;

use crate::error::{DecodeError, DecodeResult};
use crate::execution::{run_with_budget, BudgetError};
use crate::ingestion::{DecodeStats, FileId, FileKind, IngestionObserver, IngestionSeverity, UploadedFile};
use crate::types::RowSet;

pub use infer::{CellKind, CsvInference, TypeInference};
#[cfg(feature = "excel")]
pub use excel::SpreadsheetInference;

/// Default wall-clock budget for decoding one file.
pub const DEFAULT_DECODE_BUDGET: Duration = Duration::from_secs(30);

/// Options controlling decoding.
#[derive(Clone)]
pub struct DecodeOptions {
    /// Wall-clock budget per file; `None` decodes inline without a deadline.
    pub budget: Option<Duration>,
    /// Optional observer for logging/alerts.
    pub observer: Option<Arc<dyn IngestionObserver>>,
    /// Severity threshold at which `on_alert` is invoked.
    pub alert_at_or_above: IngestionSeverity,
}

impl fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("budget", &self.budget)
            .field("observer_set", &self.observer.is_some())
            .field("alert_at_or_above", &self.alert_at_or_above)
            .finish()
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            budget: Some(DEFAULT_DECODE_BUDGET),
            observer: None,
            alert_at_or_above: IngestionSeverity::Critical,
        }
    }
}

/// A successfully decoded file.
#[derive(Debug, Clone)]
pub struct DecodedFile {
    pub file: UploadedFile,
    pub rows: RowSet,
}

/// A file that failed to decode, with the context needed to fix it.
#[derive(Debug)]
pub struct DecodeFailure {
    pub file_id: FileId,
    pub file_name: String,
    pub error: DecodeError,
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file_name, self.error)
    }
}

/// Outcome of [`decode_batch`], in submission order.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub decoded: Vec<DecodedFile>,
    pub failures: Vec<DecodeFailure>,
}

impl DecodedBatch {
    /// Decoded row-set of the first file named `name`.
    pub fn table(&self, name: &str) -> Option<&RowSet> {
        self.decoded.iter().find(|d| d.file.name() == name).map(|d| &d.rows)
    }
}

/// Decode one file without a deadline or observer.
///
/// Rejected files are refused with [`DecodeError::Rejected`].
pub fn decode(file: &UploadedFile) -> DecodeResult<RowSet> {
    if let Some(reason) = &file.validation().reason {
        return Err(DecodeError::Rejected { reason: reason.clone() });
    }
    match file.kind() {
        Some(FileKind::Csv) => csv::decode_csv(file.bytes(), file.delimiter()),
        Some(FileKind::Spreadsheet) => decode_spreadsheet_dispatch(file.bytes()),
        None => Err(DecodeError::Unsupported { kind: "unknown" }),
    }
}

/// Decode one file under `options.budget`, reporting the outcome to the observer.
pub fn decode_with(file: &UploadedFile, options: &DecodeOptions) -> DecodeResult<RowSet> {
    let result = match options.budget {
        None => decode(file),
        Some(budget) => {
            let owned = file.clone();
            match run_with_budget(Some(budget), move || decode(&owned)) {
                Ok(result) => result,
                Err(BudgetError::Exceeded) => Err(DecodeError::Timeout { budget }),
                Err(BudgetError::Panicked) => Err(DecodeError::Unreadable {
                    message: "decoder worker panicked".to_string(),
                }),
            }
        }
    };

    if let Some(obs) = options.observer.as_ref() {
        match &result {
            Ok(rows) => obs.on_decoded(
                file,
                DecodeStats {
                    rows: rows.row_count(),
                    columns: rows.schema.len(),
                },
            ),
            Err(e) => {
                let sev = severity_for_error(e);
                obs.on_decode_failed(file, sev, e);
                if sev >= options.alert_at_or_above {
                    obs.on_alert(file, sev, &e.to_string());
                }
            }
        }
    }

    result
}

/// Decode every accepted file in parallel. Files share no state; order is preserved.
pub fn decode_batch(files: &[UploadedFile], options: &DecodeOptions) -> DecodedBatch {
    let outcomes: Vec<(UploadedFile, DecodeResult<RowSet>)> = files
        .par_iter()
        .filter(|f| f.is_accepted())
        .map(|f| (f.clone(), decode_with(f, options)))
        .collect();

    let mut batch = DecodedBatch::default();
    for (file, result) in outcomes {
        match result {
            Ok(rows) => batch.decoded.push(DecodedFile { file, rows }),
            Err(error) => batch.failures.push(DecodeFailure {
                file_id: file.id().clone(),
                file_name: file.name().to_string(),
                error,
            }),
        }
    }
    batch
}

fn severity_for_error(e: &DecodeError) -> IngestionSeverity {
    match e {
        DecodeError::Unreadable { .. } | DecodeError::Timeout { .. } => IngestionSeverity::Critical,
        DecodeError::Csv(err) => match err.kind() {
            ::csv::ErrorKind::Io(_) => IngestionSeverity::Critical,
            _ => IngestionSeverity::Error,
        },
        _ => IngestionSeverity::Error,
    }
}

fn decode_spreadsheet_dispatch(bytes: &[u8]) -> DecodeResult<RowSet> {
    #[cfg(feature = "excel")]
    {
        excel::decode_spreadsheet(bytes)
    }

    #[cfg(not(feature = "excel"))]
    {
        let _ = bytes;
        Err(DecodeError::Unsupported { kind: "spreadsheet" })
    }
}
