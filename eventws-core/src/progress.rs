//! Progress reporting and cancellation hooks.
//!
//! Long-running bulk operations report at chunk or per-list granularity and
//! poll [`Progress::is_cancelled`] at the same granularity.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Externally supplied progress sink.
pub trait Progress: Send + Sync {
    /// Records one unit of work, optionally with a message.
    fn report(&self, message: Option<&str>);

    /// Records `count` units of work at once.
    fn report_many(&self, count: usize) {
        for _ in 0..count {
            self.report(None);
        }
    }

    /// Returns true when the caller asked the operation to stop.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Returns `Err(Cancelled)` if `progress` has been cancelled.
///
/// # Errors
/// Returns `Error::Cancelled` when cancellation was requested.
#[inline]
pub fn check_cancelled(progress: &dyn Progress) -> Result<()> {
    if progress.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Progress sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _message: Option<&str>) {}

    fn report_many(&self, _count: usize) {}
}

/// Thread-safe counter with a cancellation flag.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    ticks: AtomicUsize,
    cancelled: AtomicBool,
}

impl ProgressCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units reported so far.
    #[must_use]
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Requests cancellation of the operation polling this counter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Progress for ProgressCounter {
    fn report(&self, _message: Option<&str>) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn report_many(&self, count: usize) {
        self.ticks.fetch_add(count, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_ticks_and_cancel() {
        let counter = ProgressCounter::new();
        counter.report(Some("list"));
        counter.report_many(4);
        assert_eq!(counter.ticks(), 5);
        assert!(check_cancelled(&counter).is_ok());

        counter.cancel();
        assert!(check_cancelled(&counter).unwrap_err().is_cancelled());
    }
}
