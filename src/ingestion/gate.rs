//! Type/size validation of incoming files.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::RejectionReason;

use super::observability::{IngestionObserver, IngestionSeverity};

/// Default upload ceiling: 10 MiB.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

const CSV_MIME_TYPES: &[&str] = &["text/csv", "application/csv"];
const TSV_MIME_TYPES: &[&str] = &["text/tab-separated-values"];
const SPREADSHEET_MIME_TYPES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
    "application/vnd.ms-excel.sheet.macroenabled.12",
    "application/vnd.oasis.opendocument.spreadsheet",
];

/// Opaque identifier assigned to every submitted file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(String);

impl FileId {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tabular format a file was declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Delimited text.
    Csv,
    /// Workbook (`.xlsx`, `.xls`, `.ods`); the first sheet is decoded.
    Spreadsheet,
}

impl FileKind {
    /// Classify a declared MIME type, ignoring parameters such as `; charset=utf-8`.
    ///
    /// Returns the kind plus the delimiter implied by the type (tab for TSV).
    pub fn from_mime(mime: &str) -> Option<(Self, Option<u8>)> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if CSV_MIME_TYPES.contains(&essence.as_str()) {
            Some((Self::Csv, None))
        } else if TSV_MIME_TYPES.contains(&essence.as_str()) {
            Some((Self::Csv, Some(b'\t')))
        } else if SPREADSHEET_MIME_TYPES.contains(&essence.as_str()) {
            Some((Self::Spreadsheet, None))
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Spreadsheet => "spreadsheet",
        }
    }
}

/// One file as handed over by the transport layer.
#[derive(Clone)]
pub struct FileSubmission {
    pub name: String,
    pub declared_mime: String,
    pub byte_length: u64,
    pub bytes: Arc<[u8]>,
    /// Explicit CSV delimiter; overrides the one implied by the MIME type.
    pub delimiter: Option<u8>,
}

impl FileSubmission {
    /// Build a submission whose declared length is the byte count.
    pub fn new(name: impl Into<String>, declared_mime: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            name: name.into(),
            declared_mime: declared_mime.into(),
            byte_length: bytes.len() as u64,
            bytes: Arc::from(bytes),
            delimiter: None,
        }
    }

    /// Override the declared length (transports may report it separately from the payload).
    pub fn with_byte_length(mut self, byte_length: u64) -> Self {
        self.byte_length = byte_length;
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = Some(delimiter);
        self
    }
}

impl fmt::Debug for FileSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSubmission")
            .field("name", &self.name)
            .field("declared_mime", &self.declared_mime)
            .field("byte_length", &self.byte_length)
            .field("delimiter", &self.delimiter)
            .finish()
    }
}

/// Outcome of the gate for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub accepted: bool,
    pub reason: Option<RejectionReason>,
}

/// A file that passed through the gate, accepted or not. Immutable once created.
#[derive(Clone)]
pub struct UploadedFile {
    id: FileId,
    name: String,
    byte_length: u64,
    declared_mime: String,
    kind: Option<FileKind>,
    delimiter: u8,
    validation: Validation,
    bytes: Arc<[u8]>,
}

impl UploadedFile {
    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn declared_mime(&self) -> &str {
        &self.declared_mime
    }

    /// Declared tabular kind; `None` when the MIME type is unsupported.
    pub fn kind(&self) -> Option<FileKind> {
        self.kind
    }

    /// Field delimiter used when decoding CSV content.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn validation(&self) -> &Validation {
        &self.validation
    }

    pub fn is_accepted(&self) -> bool {
        self.validation.accepted
    }

    /// Raw payload. Only the decoder reads it.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for UploadedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("byte_length", &self.byte_length)
            .field("kind", &self.kind)
            .field("validation", &self.validation)
            .finish()
    }
}

/// Submission-ordered split of a batch into accepted and rejected files.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub accepted: Vec<UploadedFile>,
    pub rejected: Vec<UploadedFile>,
}

/// Options controlling the ingestion gate.
#[derive(Clone)]
pub struct IngestionOptions {
    /// Size ceiling in bytes (inclusive).
    pub max_file_bytes: u64,
    /// Delimiter for CSV files that do not imply or declare one.
    pub default_delimiter: u8,
    /// Optional observer for logging/alerts.
    pub observer: Option<Arc<dyn IngestionObserver>>,
    /// Severity threshold at which `on_alert` is invoked.
    pub alert_at_or_above: IngestionSeverity,
}

impl fmt::Debug for IngestionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionOptions")
            .field("max_file_bytes", &self.max_file_bytes)
            .field("default_delimiter", &(self.default_delimiter as char))
            .field("observer_set", &self.observer.is_some())
            .field("alert_at_or_above", &self.alert_at_or_above)
            .finish()
    }
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            default_delimiter: b',',
            observer: None,
            alert_at_or_above: IngestionSeverity::Critical,
        }
    }
}

/// Classify a batch of files.
///
/// A file is accepted iff its declared MIME type is a CSV or spreadsheet variant and its length
/// is within `options.max_file_bytes`. The type check runs first, so an oversized `.docx` is
/// reported as [`RejectionReason::UnsupportedType`]. Duplicate names are kept as-is; contents are
/// not parsed here.
///
/// ```
/// use tabular_console::ingestion::{submit, FileSubmission, IngestionOptions};
///
/// let batch = submit(
///     vec![
///         FileSubmission::new("students.csv", "text/csv", "id,name\nS001,Ada\n"),
///         FileSubmission::new("notes.docx", "application/msword", vec![0u8; 16]),
///     ],
///     &IngestionOptions::default(),
/// );
/// assert_eq!(batch.accepted.len(), 1);
/// assert_eq!(batch.rejected[0].name(), "notes.docx");
/// ```
pub fn submit(files: Vec<FileSubmission>, options: &IngestionOptions) -> BatchResult {
    let mut batch = BatchResult::default();
    for submission in files {
        let file = classify(submission, options);
        match (&file.validation.reason, options.observer.as_ref()) {
            (None, Some(obs)) => obs.on_accepted(&file),
            (Some(reason), Some(obs)) => {
                obs.on_rejected(&file, reason);
                if IngestionSeverity::Warning >= options.alert_at_or_above {
                    obs.on_alert(&file, IngestionSeverity::Warning, &reason.to_string());
                }
            }
            _ => {}
        }
        if file.validation.accepted {
            batch.accepted.push(file);
        } else {
            batch.rejected.push(file);
        }
    }
    batch
}

fn classify(submission: FileSubmission, options: &IngestionOptions) -> UploadedFile {
    let FileSubmission {
        name,
        declared_mime,
        byte_length,
        bytes,
        delimiter,
    } = submission;
    // Never trust a declared length that understates the payload.
    let byte_length = byte_length.max(bytes.len() as u64);
    let detected = FileKind::from_mime(&declared_mime);

    let reason = match detected {
        None => Some(RejectionReason::UnsupportedType {
            mime: declared_mime.clone(),
        }),
        Some(_) if byte_length > options.max_file_bytes => Some(RejectionReason::TooLarge {
            size: format_file_size(byte_length),
            limit_size: format_file_size(options.max_file_bytes),
            byte_length,
            limit: options.max_file_bytes,
        }),
        Some(_) => None,
    };

    let implied = detected.and_then(|(_, d)| d);
    UploadedFile {
        id: FileId::generate(),
        name,
        byte_length,
        declared_mime,
        kind: detected.map(|(kind, _)| kind),
        delimiter: delimiter.or(implied).unwrap_or(options.default_delimiter),
        validation: Validation {
            accepted: reason.is_none(),
            reason,
        },
        bytes,
    }
}

/// Human-readable size with two decimals (`Bytes`, `KB`, `MB`, `GB`; base 1024).
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} Bytes")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Files the user has uploaded so far, in submission order.
///
/// Accepted and rejected files are both listed (rejections carry their reason); files leave the
/// batch only through [`UploadBatch::remove`] or [`UploadBatch::clear`].
#[derive(Debug, Clone, Default)]
pub struct UploadBatch {
    files: Vec<UploadedFile>,
}

impl UploadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `files` through the gate and append every outcome.
    pub fn submit(&mut self, files: Vec<FileSubmission>, options: &IngestionOptions) -> BatchResult {
        let result = submit(files, options);
        self.absorb(&result);
        result
    }

    /// Append an already-classified batch, keeping submission order within each list.
    pub fn absorb(&mut self, result: &BatchResult) {
        self.files.extend(result.accepted.iter().cloned());
        self.files.extend(result.rejected.iter().cloned());
    }

    pub fn remove(&mut self, id: &FileId) -> Option<UploadedFile> {
        let idx = self.files.iter().position(|f| f.id() == id)?;
        Some(self.files.remove(idx))
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    pub fn accepted(&self) -> impl Iterator<Item = &UploadedFile> {
        self.files.iter().filter(|f| f.is_accepted())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

    #[test]
    fn mime_parameters_are_ignored() {
        assert_eq!(FileKind::from_mime("text/csv; charset=utf-8"), Some((FileKind::Csv, None)));
        assert_eq!(FileKind::from_mime("TEXT/CSV"), Some((FileKind::Csv, None)));
        assert_eq!(FileKind::from_mime(XLSX), Some((FileKind::Spreadsheet, None)));
        assert_eq!(
            FileKind::from_mime("text/tab-separated-values"),
            Some((FileKind::Csv, Some(b'\t')))
        );
        assert_eq!(FileKind::from_mime("application/pdf"), None);
    }

    #[test]
    fn limit_is_inclusive() {
        let opts = IngestionOptions {
            max_file_bytes: 4,
            ..Default::default()
        };
        let batch = submit(
            vec![
                FileSubmission::new("a.csv", "text/csv", "a,b\n"),
                FileSubmission::new("b.csv", "text/csv", "a,b\n1"),
            ],
            &opts,
        );
        assert_eq!(batch.accepted.len(), 1);
        assert_eq!(batch.accepted[0].name(), "a.csv");
        assert!(matches!(
            batch.rejected[0].validation().reason,
            Some(RejectionReason::TooLarge { byte_length: 5, limit: 4, .. })
        ));
    }

    #[test]
    fn declared_length_cannot_understate_payload() {
        let opts = IngestionOptions {
            max_file_bytes: 4,
            ..Default::default()
        };
        let file = FileSubmission::new("a.csv", "text/csv", "0123456789").with_byte_length(1);
        let batch = submit(vec![file], &opts);
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.rejected[0].byte_length(), 10);
    }

    #[test]
    fn delimiter_precedence() {
        let opts = IngestionOptions::default();
        let batch = submit(
            vec![
                FileSubmission::new("a.tsv", "text/tab-separated-values", "a\tb\n"),
                FileSubmission::new("b.csv", "text/csv", "a;b\n").with_delimiter(b';'),
                FileSubmission::new("c.csv", "text/csv", "a,b\n"),
            ],
            &opts,
        );
        let delims: Vec<u8> = batch.accepted.iter().map(|f| f.delimiter()).collect();
        assert_eq!(delims, vec![b'\t', b';', b',']);
    }

    #[test]
    fn ids_are_unique_even_for_duplicate_names() {
        let batch = submit(
            vec![
                FileSubmission::new("same.csv", "text/csv", "a\n1\n"),
                FileSubmission::new("same.csv", "text/csv", "a\n1\n"),
            ],
            &IngestionOptions::default(),
        );
        assert_eq!(batch.accepted.len(), 2);
        assert_ne!(batch.accepted[0].id(), batch.accepted[1].id());
    }

    #[test]
    fn format_file_size_matches_upload_widget() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(512), "512 Bytes");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(12 * 1024 * 1024), "12.00 MB");
    }

    #[test]
    fn upload_batch_remove_and_clear() {
        let mut uploads = UploadBatch::new();
        let result = uploads.submit(
            vec![
                FileSubmission::new("a.csv", "text/csv", "a\n1\n"),
                FileSubmission::new("b.txt", "text/plain", "x"),
            ],
            &IngestionOptions::default(),
        );
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads.accepted().count(), 1);

        let removed = uploads.remove(result.accepted[0].id()).unwrap();
        assert_eq!(removed.name(), "a.csv");
        assert!(uploads.remove(removed.id()).is_none());
        assert_eq!(uploads.len(), 1);

        uploads.clear();
        assert!(uploads.is_empty());
    }
}
