//! Busy/idle thread scheduling.
//!
//! A [`ScheduledJob`] is driven by a [`BusyThread`] on its own OS thread:
//!
//! ```text
//!   startup delay
//!        |
//!        v
//!   +--> intermission? --yes--> sleep, maybe skip
//!   |        |
//!   |        v
//!   |   memory ok? --no--> free memory, sleep idle, count OOM cycle
//!   |        |
//!   |        v
//!   |      job() --> busy / idle (errors and panics count as busy)
//!   |        |
//!   +---- sleep busy or idle
//! ```
//!
//! Negative sleep values turn the job into a one-time job.

mod busy_thread;
mod job;
mod memory;
mod sleeper;

pub use busy_thread::{
    BusyThread, ErrorHandler, JobFailure, StatsSnapshot, ThreadControl, ThreadHandle,
    ThreadSettings, DEFAULT_GRACE, INDEFINITE,
};
pub(crate) use busy_thread::panic_message;
pub use job::{from_fn, FnJob, JobError, ScheduledJob};
pub use memory::{FixedMemory, MemorySource, SystemMemory};
pub use sleeper::Sleeper;
