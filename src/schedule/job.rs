//! The unit of work driven by a [`BusyThread`](super::BusyThread).

use super::ThreadControl;
use std::sync::Arc;

/// Error type returned by scheduled jobs.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// A repeatable piece of work.
///
/// `job` returns `Ok(true)` when it did something (busy) and `Ok(false)`
/// when there was nothing to do (idle). The scheduler picks the next sleep
/// interval from that answer.
pub trait ScheduledJob: Send + 'static {
    /// Run one unit of work.
    fn job(&mut self) -> Result<bool, JobError>;

    /// Called on the scheduler thread before the first iteration.
    ///
    /// Jobs that block outside of the scheduler's sleep (e.g. on a socket)
    /// keep the control to register an interrupter or to report blocked time.
    fn open(&mut self, _control: &Arc<ThreadControl>) {}

    /// Called on the scheduler thread after the loop ended.
    fn close(&mut self) {}

    /// Release caches when the memory prerequisite is not met.
    fn free_memory(&mut self) {}
}

/// A job built from a closure.
pub struct FnJob<F> {
    f: F,
}

/// Wrap a closure as a [`ScheduledJob`].
pub fn from_fn<F>(f: F) -> FnJob<F>
where
    F: FnMut() -> Result<bool, JobError> + Send + 'static,
{
    FnJob { f }
}

impl<F> ScheduledJob for FnJob<F>
where
    F: FnMut() -> Result<bool, JobError> + Send + 'static,
{
    fn job(&mut self) -> Result<bool, JobError> {
        (self.f)()
    }
}
