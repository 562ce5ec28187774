use std::fmt;
use std::sync::Arc;

use crate::error::{DecodeError, RejectionReason};

use super::gate::UploadedFile;

/// Severity classification used for observer callbacks and alerting thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IngestionSeverity {
    /// Informational event.
    Info,
    /// A file was turned away at the gate.
    Warning,
    /// A file could not be decoded.
    Error,
    /// The byte stream itself was unusable (unreadable, timed out).
    Critical,
}

/// Minimal stats reported on successful decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    pub rows: usize,
    pub columns: usize,
}

/// Observer interface for gate and decoder outcomes.
///
/// Implementors can record metrics, logs, or trigger alerts. Every method has a no-op default.
pub trait IngestionObserver: Send + Sync {
    fn on_accepted(&self, _file: &UploadedFile) {}

    fn on_rejected(&self, _file: &UploadedFile, _reason: &RejectionReason) {}

    fn on_decoded(&self, _file: &UploadedFile, _stats: DecodeStats) {}

    fn on_decode_failed(&self, _file: &UploadedFile, _severity: IngestionSeverity, _error: &DecodeError) {}

    /// Called when an event meets the configured alert threshold.
    fn on_alert(&self, _file: &UploadedFile, _severity: IngestionSeverity, _message: &str) {}
}

/// An observer that fans out callbacks to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn IngestionObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn IngestionObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl IngestionObserver for CompositeObserver {
    fn on_accepted(&self, file: &UploadedFile) {
        for o in &self.observers {
            o.on_accepted(file);
        }
    }

    fn on_rejected(&self, file: &UploadedFile, reason: &RejectionReason) {
        for o in &self.observers {
            o.on_rejected(file, reason);
        }
    }

    fn on_decoded(&self, file: &UploadedFile, stats: DecodeStats) {
        for o in &self.observers {
            o.on_decoded(file, stats);
        }
    }

    fn on_decode_failed(&self, file: &UploadedFile, severity: IngestionSeverity, error: &DecodeError) {
        for o in &self.observers {
            o.on_decode_failed(file, severity, error);
        }
    }

    fn on_alert(&self, file: &UploadedFile, severity: IngestionSeverity, message: &str) {
        for o in &self.observers {
            o.on_alert(file, severity, message);
        }
    }
}

/// Logs ingestion events to stderr.
#[derive(Debug, Default)]
pub struct StdErrObserver;

impl IngestionObserver for StdErrObserver {
    fn on_accepted(&self, file: &UploadedFile) {
        eprintln!(
            "[ingest][ok] file={} kind={:?} bytes={}",
            file.name(),
            file.kind(),
            file.byte_length()
        );
    }

    fn on_rejected(&self, file: &UploadedFile, reason: &RejectionReason) {
        eprintln!("[ingest][rejected] file={} reason={reason}", file.name());
    }

    fn on_decoded(&self, file: &UploadedFile, stats: DecodeStats) {
        eprintln!(
            "[decode][ok] file={} rows={} columns={}",
            file.name(),
            stats.rows,
            stats.columns
        );
    }

    fn on_decode_failed(&self, file: &UploadedFile, severity: IngestionSeverity, error: &DecodeError) {
        eprintln!("[decode][{severity:?}] file={} err={error}", file.name());
    }

    fn on_alert(&self, file: &UploadedFile, severity: IngestionSeverity, message: &str) {
        eprintln!("[ALERT][ingest][{severity:?}] file={} {message}", file.name());
    }
}

/// Forwards ingestion events to the `log` facade under the `tabular_console::ingestion` target.
#[derive(Debug, Default)]
pub struct LogObserver;

impl IngestionObserver for LogObserver {
    fn on_accepted(&self, file: &UploadedFile) {
        log::info!(
            target: "tabular_console::ingestion",
            "accepted {} ({:?}, {} bytes)",
            file.name(),
            file.kind(),
            file.byte_length()
        );
    }

    fn on_rejected(&self, file: &UploadedFile, reason: &RejectionReason) {
        log::warn!(target: "tabular_console::ingestion", "rejected {}: {reason}", file.name());
    }

    fn on_decoded(&self, file: &UploadedFile, stats: DecodeStats) {
        log::info!(
            target: "tabular_console::ingestion",
            "decoded {}: {} rows x {} columns",
            file.name(),
            stats.rows,
            stats.columns
        );
    }

    fn on_decode_failed(&self, file: &UploadedFile, severity: IngestionSeverity, error: &DecodeError) {
        log::warn!(
            target: "tabular_console::ingestion",
            "decode of {} failed ({severity:?}): {error}",
            file.name()
        );
    }

    fn on_alert(&self, file: &UploadedFile, severity: IngestionSeverity, message: &str) {
        log::error!(
            target: "tabular_console::ingestion",
            "ALERT {severity:?} {}: {message}",
            file.name()
        );
    }
}
