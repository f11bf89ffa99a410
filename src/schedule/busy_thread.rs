//! Generic busy/idle scheduler.

use super::{MemorySource, ScheduledJob, Sleeper, SystemMemory};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// `intermission_until` value meaning "paused until resumed".
pub const INDEFINITE: u64 = u64::MAX;

/// How long `terminate(true)` waits for the loop to exit.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Poll interval while paused indefinitely with a zero idle sleep.
const PAUSE_POLL_MILLIS: i64 = 1000;

/// Why a job invocation failed.
#[derive(Debug)]
pub enum JobFailure {
    Error(super::JobError),
    Panic(String),
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Error(e) => write!(f, "{e}"),
            JobFailure::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Receives job failures; the scheduler keeps running afterwards.
pub type ErrorHandler = Arc<dyn Fn(&str, &JobFailure) + Send + Sync>;

fn log_failure(name: &str, failure: &JobFailure) {
    error!(thread = name, error = %failure, "Scheduled job failed");
}

/// Tunables applied to a thread before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSettings {
    pub startup_delay: i64,
    pub idle_sleep: i64,
    pub busy_sleep: i64,
    pub memory_prerequisite: u64,
    pub obey_intermission: bool,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            startup_delay: 0,
            idle_sleep: 100,
            busy_sleep: 1000,
            memory_prerequisite: 0,
            obey_intermission: true,
        }
    }
}

impl ThreadSettings {
    /// Settings for a job that runs exactly once.
    pub fn one_time() -> Self {
        Self {
            idle_sleep: -1,
            busy_sleep: -1,
            ..Self::default()
        }
    }
}

/// Counters maintained by the scheduling loop.
#[derive(Debug, Default)]
struct JobStats {
    idle_cycles: AtomicU64,
    busy_cycles: AtomicU64,
    out_of_memory_cycles: AtomicU64,
    slept_millis: AtomicU64,
    blocked_millis: AtomicU64,
    exec_millis: AtomicU64,
    last_memory_delta: AtomicI64,
}

/// Point-in-time copy of a thread's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub idle_cycles: u64,
    pub busy_cycles: u64,
    pub out_of_memory_cycles: u64,
    pub slept_millis: u64,
    pub blocked_millis: u64,
    pub exec_millis: u64,
    /// Available memory consumed by the last invocation (negative if freed).
    pub last_memory_delta: i64,
}

impl StatsSnapshot {
    pub fn total_cycles(&self) -> u64 {
        self.idle_cycles + self.busy_cycles
    }
}

type Interrupter = Box<dyn Fn() + Send + Sync>;

/// Shared state between a running scheduler loop and its controllers.
///
/// Settings can be changed while the thread runs and take effect on the
/// next iteration. Counters are written by the loop only.
pub struct ThreadControl {
    name: String,
    running: AtomicBool,
    startup_delay: AtomicI64,
    idle_sleep: AtomicI64,
    busy_sleep: AtomicI64,
    memory_prerequisite: AtomicU64,
    obey_intermission: AtomicBool,
    intermission_until: AtomicU64,
    stats: JobStats,
    cycle_blocked: AtomicU64,
    sleeper: Sleeper,
    interrupter: Mutex<Option<Interrupter>>,
    finished: Mutex<bool>,
    finished_cond: Condvar,
}

impl fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControl")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("settings", &self.settings())
            .finish()
    }
}

impl ThreadControl {
    fn new(name: String, settings: ThreadSettings) -> Self {
        let control = Self {
            name,
            running: AtomicBool::new(true),
            startup_delay: AtomicI64::new(0),
            idle_sleep: AtomicI64::new(0),
            busy_sleep: AtomicI64::new(0),
            memory_prerequisite: AtomicU64::new(0),
            obey_intermission: AtomicBool::new(true),
            intermission_until: AtomicU64::new(0),
            stats: JobStats::default(),
            cycle_blocked: AtomicU64::new(0),
            sleeper: Sleeper::new(),
            interrupter: Mutex::new(None),
            finished: Mutex::new(false),
            finished_cond: Condvar::new(),
        };
        control.apply(settings);
        control
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply all tunables at once.
    pub fn apply(&self, settings: ThreadSettings) {
        self.set_startup_delay(settings.startup_delay);
        self.set_idle_sleep(settings.idle_sleep);
        self.set_busy_sleep(settings.busy_sleep);
        self.set_memory_prerequisite(settings.memory_prerequisite);
        self.set_obey_intermission(settings.obey_intermission);
    }

    pub fn settings(&self) -> ThreadSettings {
        ThreadSettings {
            startup_delay: self.startup_delay.load(Ordering::Relaxed),
            idle_sleep: self.idle_sleep(),
            busy_sleep: self.busy_sleep(),
            memory_prerequisite: self.memory_prerequisite(),
            obey_intermission: self.obey_intermission.load(Ordering::Relaxed),
        }
    }

    pub fn set_startup_delay(&self, millis: i64) {
        self.startup_delay.store(millis, Ordering::Relaxed);
    }

    pub fn idle_sleep(&self) -> i64 {
        self.idle_sleep.load(Ordering::Relaxed)
    }

    /// Returns the value now in effect.
    pub fn set_idle_sleep(&self, millis: i64) -> i64 {
        self.idle_sleep.store(millis, Ordering::Relaxed);
        millis
    }

    pub fn busy_sleep(&self) -> i64 {
        self.busy_sleep.load(Ordering::Relaxed)
    }

    /// Returns the value now in effect.
    pub fn set_busy_sleep(&self, millis: i64) -> i64 {
        self.busy_sleep.store(millis, Ordering::Relaxed);
        millis
    }

    pub fn memory_prerequisite(&self) -> u64 {
        self.memory_prerequisite.load(Ordering::Relaxed)
    }

    pub fn set_memory_prerequisite(&self, bytes: u64) {
        self.memory_prerequisite.store(bytes, Ordering::Relaxed);
    }

    pub fn set_obey_intermission(&self, obey: bool) {
        self.obey_intermission.store(obey, Ordering::Relaxed);
    }

    /// Pause the thread for `pause_millis`; [`INDEFINITE`] pauses until
    /// [`resume`](Self::resume) is called.
    pub fn intermission(&self, pause_millis: u64) {
        let until = if pause_millis == INDEFINITE {
            INDEFINITE
        } else {
            now_millis().saturating_add(pause_millis).min(INDEFINITE - 1)
        };
        self.intermission_until.store(until, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.intermission(INDEFINITE);
    }

    pub fn resume(&self) {
        self.intermission_until.store(0, Ordering::SeqCst);
        self.sleeper.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.intermission_until.load(Ordering::SeqCst) == INDEFINITE
    }

    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            idle_cycles: s.idle_cycles.load(Ordering::Relaxed),
            busy_cycles: s.busy_cycles.load(Ordering::Relaxed),
            out_of_memory_cycles: s.out_of_memory_cycles.load(Ordering::Relaxed),
            slept_millis: s.slept_millis.load(Ordering::Relaxed),
            blocked_millis: s.blocked_millis.load(Ordering::Relaxed),
            exec_millis: s.exec_millis.load(Ordering::Relaxed),
            last_memory_delta: s.last_memory_delta.load(Ordering::Relaxed),
        }
    }

    /// Run `f` and account its duration as blocked rather than executing.
    pub fn blocking<T>(&self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        let millis = elapsed_millis(start);
        self.stats.blocked_millis.fetch_add(millis, Ordering::Relaxed);
        self.cycle_blocked.fetch_add(millis, Ordering::Relaxed);
        result
    }

    /// Interruptible sleep on the scheduler's sleeper, accounted as slept.
    ///
    /// Returns `false` when woken early.
    pub fn sleep(&self, millis: i64) -> bool {
        if millis <= 0 {
            return true;
        }
        let start = Instant::now();
        let full = self.sleeper.sleep_millis(millis);
        self.stats
            .slept_millis
            .fetch_add(elapsed_millis(start), Ordering::Relaxed);
        full
    }

    /// Install a callback that unblocks the job when the thread is stopped.
    pub fn set_interrupter(&self, interrupter: impl Fn() + Send + Sync + 'static) {
        *self.interrupter.lock() = Some(Box::new(interrupter));
    }

    /// Ask the loop to stop after the current unit of work.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sleeper.wake();
        if let Some(interrupt) = self.interrupter.lock().as_ref() {
            interrupt();
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    /// Wait until the loop exited and `close` ran.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock();
        while !*finished {
            if self
                .finished_cond
                .wait_until(&mut finished, deadline)
                .timed_out()
            {
                return *finished;
            }
        }
        true
    }

    fn mark_finished(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.finished.lock() = true;
        self.finished_cond.notify_all();
    }
}

/// A job paired with its scheduling state, ready to start.
pub struct BusyThread<J: ScheduledJob> {
    job: J,
    control: Arc<ThreadControl>,
    source: Arc<dyn MemorySource>,
    on_error: ErrorHandler,
}

impl<J: ScheduledJob> BusyThread<J> {
    pub fn new(name: impl Into<String>, job: J) -> Self {
        Self::with_settings(name, job, ThreadSettings::default())
    }

    pub fn with_settings(name: impl Into<String>, job: J, settings: ThreadSettings) -> Self {
        Self {
            job,
            control: Arc::new(ThreadControl::new(name.into(), settings)),
            source: Arc::new(SystemMemory),
            on_error: Arc::new(log_failure),
        }
    }

    pub fn with_memory_source(mut self, source: Arc<dyn MemorySource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = handler;
        self
    }

    /// Settings can be adjusted through the control before `start`.
    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }

    /// Spawn the scheduler thread.
    pub fn start(self) -> io::Result<ThreadHandle> {
        let control = Arc::clone(&self.control);
        let handle = thread::Builder::new()
            .name(control.name().to_string())
            .spawn(move || self.run())?;
        Ok(ThreadHandle {
            control,
            join: Mutex::new(Some(handle)),
        })
    }

    fn run(mut self) {
        let control = Arc::clone(&self.control);
        let name = control.name().to_string();

        self.job.open(&control);
        debug!(thread = %name, settings = ?control.settings(), "Thread started");

        let delay = control.startup_delay.load(Ordering::Relaxed);
        if delay > 0 {
            control.sleep(delay);
        }

        while control.is_running() {
            if control.obey_intermission.load(Ordering::Relaxed) {
                let until = control.intermission_until.load(Ordering::SeqCst);
                if until == INDEFINITE {
                    let idle = control.idle_sleep();
                    control.sleep(if idle > 0 { idle } else { PAUSE_POLL_MILLIS });
                    continue;
                }
                if until > 0 {
                    let now = now_millis();
                    if now < until {
                        let remaining = i64::try_from(until - now).unwrap_or(i64::MAX);
                        control.sleep(remaining.min(control.idle_sleep()));
                    }
                    let _ = control.intermission_until.compare_exchange(
                        until,
                        0,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    if !control.is_running() {
                        break;
                    }
                }
            }

            let prerequisite = control.memory_prerequisite();
            if prerequisite > 0 && self.source.available() < prerequisite {
                trace!(thread = %name, prerequisite, "Memory prerequisite not met, skipping cycle");
                self.job.free_memory();
                self.source.reclaim();
                control
                    .stats
                    .out_of_memory_cycles
                    .fetch_add(1, Ordering::Relaxed);
                control.sleep(control.idle_sleep());
                continue;
            }

            let busy = self.cycle(&control, &name);

            let idle_sleep = control.idle_sleep();
            let busy_sleep = control.busy_sleep();
            if idle_sleep < 0 || busy_sleep < 0 {
                debug!(thread = %name, "One-time job finished");
                break;
            }
            if !control.is_running() {
                break;
            }
            control.sleep(if busy { busy_sleep } else { idle_sleep });
        }

        self.job.close();
        control.mark_finished();
        debug!(thread = %name, stats = ?control.stats(), "Thread terminated");
    }

    /// One invocation of the job; returns whether it counts as busy.
    fn cycle(&mut self, control: &ThreadControl, name: &str) -> bool {
        let memory_before = self.source.available();
        control.cycle_blocked.store(0, Ordering::Relaxed);
        let start = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.job.job()));

        let elapsed = elapsed_millis(start);
        let blocked = control.cycle_blocked.swap(0, Ordering::Relaxed);
        let memory_after = self.source.available();
        let stats = &control.stats;
        stats
            .exec_millis
            .fetch_add(elapsed.saturating_sub(blocked), Ordering::Relaxed);
        stats.last_memory_delta.store(
            (i128::from(memory_before) - i128::from(memory_after))
                .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64,
            Ordering::Relaxed,
        );

        let busy = match outcome {
            Ok(Ok(busy)) => busy,
            Ok(Err(e)) => {
                (self.on_error)(name, &JobFailure::Error(e));
                true
            }
            Err(payload) => {
                (self.on_error)(name, &JobFailure::Panic(panic_message(payload.as_ref())));
                true
            }
        };

        if busy {
            stats.busy_cycles.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.idle_cycles.fetch_add(1, Ordering::Relaxed);
        }
        busy
    }
}

/// Handle to a started scheduler thread.
pub struct ThreadHandle {
    control: Arc<ThreadControl>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("control", &self.control)
            .finish()
    }
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        self.control.name()
    }

    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.control.stats()
    }

    pub fn is_alive(&self) -> bool {
        !self.control.is_finished()
    }

    /// Stop the thread.
    ///
    /// With `wait_for` the caller blocks up to [`DEFAULT_GRACE`] until the
    /// loop exited and the job's `close` ran. Returns whether the thread is
    /// known to have finished. Safe to call repeatedly.
    pub fn terminate(&self, wait_for: bool) -> bool {
        self.terminate_within(if wait_for { Some(DEFAULT_GRACE) } else { None })
    }

    pub fn terminate_within(&self, grace: Option<Duration>) -> bool {
        self.control.request_stop();
        let Some(grace) = grace else {
            return self.control.is_finished();
        };
        let finished = self.control.wait_finished(grace);
        if finished {
            if let Some(handle) = self.join.lock().take() {
                let _ = handle.join();
            }
        }
        finished
    }

    /// Block until the thread ends on its own.
    pub fn join(&self) {
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn elapsed_millis(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
