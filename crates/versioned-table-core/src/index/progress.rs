//! Progress reporting and cooperative cancellation for index builds.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::model::IdAndVersion;

/// One progress checkpoint, reported after every applied change group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProgress {
    /// Table being built.
    pub table: IdAndVersion,
    /// Last change number applied.
    pub current: u64,
    /// Change number the build is heading for.
    pub total: u64,
    /// Short description of the step.
    pub message: String,
}

/// Receives build progress; returning an error aborts the build before the
/// next change group.
pub trait ProgressReporter: Send + Sync {
    /// Called at each checkpoint.
    fn report(&self, progress: &BuildProgress) -> EngineResult<()>;
}

/// Ignores progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _progress: &BuildProgress) -> EngineResult<()> {
        Ok(())
    }
}

/// Records every checkpoint and can be cancelled from another task.
#[derive(Debug, Default)]
pub struct CancellableProgress {
    cancelled: AtomicBool,
    reports: Mutex<Vec<BuildProgress>>,
}

impl CancellableProgress {
    /// A fresh, uncancelled reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the build to stop at the next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Checkpoints seen so far.
    pub fn reports(&self) -> Vec<BuildProgress> {
        self.reports.lock().clone()
    }
}

impl ProgressReporter for CancellableProgress {
    fn report(&self, progress: &BuildProgress) -> EngineResult<()> {
        self.reports.lock().push(progress.clone());
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(EngineError::Interrupted {
                message: format!(
                    "Build of {} cancelled at change {} of {}",
                    progress.table, progress.current, progress.total
                ),
            });
        }
        Ok(())
    }
}
