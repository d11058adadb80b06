//! Request control shared between the worker that runs a transfer and the caller
//! that owns the request.
//!
//! Every field lives behind one lock. Readers never see the live state, they get a
//! [`ControlSnapshot`] copied out under the lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Transfer progress in bytes, as reported by the transport.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RequestProgress {
    /// Expected download size, `0` when unknown.
    pub download_total: u64,
    /// Bytes downloaded so far.
    pub download_now: u64,
    /// Expected upload size, `0` when unknown.
    pub upload_total: u64,
    /// Bytes uploaded so far.
    pub upload_now: u64,
}

/// What the transport should do after reporting progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFlow {
    /// Keep transferring.
    Continue,
    /// Stop the transfer as soon as possible.
    Abort,
}

/// Point-in-time copy of a [`RequestControl`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    /// The transfer has finished, successfully or not.
    pub completed: bool,
    /// Cancellation was requested before completion.
    pub cancelled: bool,
    /// The callback must not run.
    pub forgotten: bool,
    /// Last reported progress.
    pub progress: RequestProgress,
}

/// Cross-thread control block of a single request.
///
/// `completed` is set exactly once. `cancelled` and `forgotten` only ever go from
/// `false` to `true` and are ignored once the request has completed.
#[derive(Debug, Default)]
pub struct RequestControl {
    /// Guarded state.
    state: Mutex<ControlSnapshot>,
}

impl RequestControl {
    /// Creates a pending control block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the state, recovering it if another thread panicked while holding it.
    fn lock(&self) -> MutexGuard<'_, ControlSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks the transfer to stop. Observed at the next progress report.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if !state.completed {
            state.cancelled = true;
        }
    }

    /// Suppresses the completion callback. The transfer itself keeps running.
    pub fn forget(&self) {
        let mut state = self.lock();
        if !state.completed {
            state.forgotten = true;
        }
    }

    /// Whether the transfer has finished.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Whether the callback has been suppressed.
    #[must_use]
    pub fn is_forgotten(&self) -> bool {
        self.lock().forgotten
    }

    /// Last reported progress.
    #[must_use]
    pub fn progress(&self) -> RequestProgress {
        self.lock().progress
    }

    /// Copies the whole state out in one lock acquisition.
    #[must_use]
    pub fn snapshot(&self) -> ControlSnapshot {
        *self.lock()
    }

    /// Records transport progress and tells the transport whether to go on.
    pub(crate) fn report_progress(&self, progress: RequestProgress) -> TransferFlow {
        let mut state = self.lock();
        if state.completed {
            return TransferFlow::Continue;
        }
        state.progress = progress;
        if state.cancelled {
            TransferFlow::Abort
        } else {
            TransferFlow::Continue
        }
    }

    /// Marks the transfer as finished and returns the final state.
    pub(crate) fn complete(&self) -> ControlSnapshot {
        let mut state = self.lock();
        state.completed = true;
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(now: u64) -> RequestProgress {
        RequestProgress {
            download_total: 100,
            download_now: now,
            ..RequestProgress::default()
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let once = RequestControl::new();
        once.cancel();

        let twice = RequestControl::new();
        twice.cancel();
        twice.cancel();

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(twice.report_progress(progress(10)), TransferFlow::Abort);
    }

    #[test]
    fn flags_after_completion_are_ignored() {
        let control = RequestControl::new();
        assert_eq!(control.report_progress(progress(50)), TransferFlow::Continue);

        let finished = control.complete();
        assert!(finished.completed);
        assert!(!finished.cancelled);

        control.cancel();
        control.forget();
        assert!(!control.is_cancelled());
        assert!(!control.is_forgotten());

        // no progress updates once completed
        assert_eq!(control.report_progress(progress(99)), TransferFlow::Continue);
        assert_eq!(control.progress(), progress(50));
    }

    #[test]
    fn forget_does_not_abort_transfer() {
        let control = RequestControl::new();
        control.forget();

        assert!(control.is_forgotten());
        assert_eq!(control.report_progress(progress(1)), TransferFlow::Continue);
        assert!(control.complete().forgotten);
    }
}
