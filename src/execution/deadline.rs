use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Why [`run_with_budget`] returned without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetError {
    /// The budget elapsed first. The work keeps running detached and its result is discarded.
    Exceeded,
    /// The work panicked.
    Panicked,
}

/// Run `work` on a dedicated thread and wait at most `budget` for its result.
///
/// With `budget == None` the work runs inline on the caller's thread.
pub fn run_with_budget<T, F>(budget: Option<Duration>, work: F) -> Result<T, BudgetError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let Some(budget) = budget else {
        return Ok(work());
    };

    let (tx, rx) = mpsc::sync_channel(1);
    let spawned = std::thread::Builder::new()
        .name("tabular-budgeted".to_string())
        .spawn(move || {
            // The receiver is gone once the caller gave up; nothing to report then.
            let _ = tx.send(work());
        });
    if spawned.is_err() {
        return Err(BudgetError::Panicked);
    }

    match rx.recv_timeout(budget) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => Err(BudgetError::Exceeded),
        Err(RecvTimeoutError::Disconnected) => Err(BudgetError::Panicked),
    }
}

/// Cooperative cancellation flag shared between a run and whoever may cancel it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
