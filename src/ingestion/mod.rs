//! Ingestion gate: validates incoming files before anything reads their contents.
//!
//! Most callers use [`submit`] (or [`UploadBatch::submit`] to keep a running list), which:
//!
//! - classifies each file by declared MIME type and size
//! - records a [`crate::error::RejectionReason`] per rejected file instead of failing the batch
//! - optionally reports accept/reject events to an [`IngestionObserver`]
//!
//! Accepted files are handed to [`crate::decode`].

pub mod gate;
pub mod observability;

pub use gate::{
    format_file_size, submit, BatchResult, FileId, FileKind, FileSubmission, IngestionOptions, UploadBatch,
    UploadedFile, Validation, DEFAULT_MAX_FILE_BYTES,
};
pub use observability::{
    CompositeObserver, DecodeStats, IngestionObserver, IngestionSeverity, LogObserver, StdErrObserver,
};
