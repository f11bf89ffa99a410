//! Process-wide service registry.
//!
//! The switchboard owns the configuration store, the deployed scheduler
//! threads, the access tracker, the authorization table and a shared
//! handoff queue. Thread performance lives in the store under
//! `<name>_idlesleep`, `<name>_busysleep` and `<name>_memprereq`; writing
//! those keys retunes the running thread.

pub mod access;
pub mod auth;
pub mod queue;

pub use access::{AccessTracker, CleanupJob, Track, TrackerLimits};
pub use auth::AuthTable;
pub use queue::WorkQueue;

use crate::schedule::{
    ErrorHandler, MemorySource, ScheduledJob, SystemMemory, ThreadControl, ThreadHandle,
    ThreadSettings,
};
use crate::store::{ConfigAction, ConfigStore};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the access tracker maintenance thread.
pub const ACCESS_CLEANUP_THREAD: &str = "accesstracker_cleanup";

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("thread '{0}' is already deployed")]
    AlreadyDeployed(String),
    #[error("no thread named '{0}'")]
    UnknownThread(String),
    #[error("cannot start thread '{0}': {1}")]
    Spawn(String, #[source] io::Error),
}

/// Performance used for a thread whose keys are missing from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadDefaults {
    pub idle_sleep: i64,
    pub busy_sleep: i64,
    pub memory_prerequisite: u64,
}

impl Default for ThreadDefaults {
    fn default() -> Self {
        Self {
            idle_sleep: 100,
            busy_sleep: 1000,
            memory_prerequisite: 1_000_000,
        }
    }
}

fn idle_key(name: &str) -> String {
    format!("{name}_idlesleep")
}

fn busy_key(name: &str) -> String {
    format!("{name}_busysleep")
}

fn memprereq_key(name: &str) -> String {
    format!("{name}_memprereq")
}

fn action_name(name: &str) -> String {
    format!("thread:{name}")
}

/// Applies performance key writes to a live thread.
struct Retune {
    idle_key: String,
    busy_key: String,
    memprereq_key: String,
    control: Arc<ThreadControl>,
}

impl ConfigAction for Retune {
    fn after(&self, key: &str, value: &str) {
        let value = value.trim();
        if key == self.idle_key {
            if let Ok(millis) = value.parse() {
                self.control.set_idle_sleep(millis);
            }
        } else if key == self.busy_key {
            if let Ok(millis) = value.parse() {
                self.control.set_busy_sleep(millis);
            }
        } else if key == self.memprereq_key {
            if let Ok(bytes) = value.parse() {
                self.control.set_memory_prerequisite(bytes);
            }
        }
    }
}

/// The service registry. `E` is the handoff queue's item type.
pub struct Switchboard<E> {
    store: Arc<ConfigStore>,
    threads: RwLock<BTreeMap<String, Arc<ThreadHandle>>>,
    memory: Arc<dyn MemorySource>,
    error_handler: Option<ErrorHandler>,
    access: Arc<AccessTracker>,
    auth: AuthTable,
    queue: WorkQueue<E>,
    busy_jobs: AtomicUsize,
}

impl<E> Switchboard<E> {
    pub fn new(store: Arc<ConfigStore>, queue_capacity: usize) -> Self {
        let limits = TrackerLimits::from_store(&store);
        Self {
            store,
            threads: RwLock::new(BTreeMap::new()),
            memory: Arc::new(SystemMemory),
            error_handler: None,
            access: Arc::new(AccessTracker::new(limits)),
            auth: AuthTable::new(),
            queue: WorkQueue::new(queue_capacity),
            busy_jobs: AtomicUsize::new(0),
        }
    }

    /// Memory source handed to threads deployed from now on.
    pub fn with_memory_source(mut self, source: Arc<dyn MemorySource>) -> Self {
        self.memory = source;
        self
    }

    /// Error handler handed to threads deployed from now on.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    // ---- threads ----

    fn performance_value<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + ToString + Copy,
    {
        match self.store.get_opt(key).and_then(|v| v.trim().parse().ok()) {
            Some(value) => value,
            None => {
                self.store.set(key, default.to_string());
                default
            }
        }
    }

    /// Start `job` on its own thread under `name`.
    ///
    /// Sleep and memory settings come from the store, falling back to (and
    /// persisting) `defaults`. Later writes to those keys retune the thread.
    pub fn deploy_thread<J: ScheduledJob>(
        &self,
        name: &str,
        job: J,
        defaults: ThreadDefaults,
        startup_delay: i64,
    ) -> Result<Arc<ThreadHandle>, RegistryError> {
        let mut threads = self.threads.write();
        if let Some(existing) = threads.get(name) {
            if existing.is_alive() {
                return Err(RegistryError::AlreadyDeployed(name.to_string()));
            }
            debug!(thread = name, "Replacing finished thread");
            threads.remove(name);
        }

        let settings = ThreadSettings {
            startup_delay,
            idle_sleep: self.performance_value(&idle_key(name), defaults.idle_sleep),
            busy_sleep: self.performance_value(&busy_key(name), defaults.busy_sleep),
            memory_prerequisite: self
                .performance_value(&memprereq_key(name), defaults.memory_prerequisite),
            obey_intermission: true,
        };

        let mut thread = crate::schedule::BusyThread::with_settings(name, job, settings)
            .with_memory_source(Arc::clone(&self.memory));
        if let Some(handler) = &self.error_handler {
            thread = thread.with_error_handler(Arc::clone(handler));
        }
        let control = Arc::clone(thread.control());
        let handle = Arc::new(
            thread
                .start()
                .map_err(|e| RegistryError::Spawn(name.to_string(), e))?,
        );

        self.store.add_action(
            action_name(name),
            Arc::new(Retune {
                idle_key: idle_key(name),
                busy_key: busy_key(name),
                memprereq_key: memprereq_key(name),
                control,
            }),
        );
        threads.insert(name.to_string(), Arc::clone(&handle));
        info!(thread = name, ?settings, "Deployed thread");
        Ok(handle)
    }

    /// Persist new performance values for `name`; the running thread picks
    /// them up through its config action.
    pub fn set_thread_performance(
        &self,
        name: &str,
        idle_sleep: i64,
        busy_sleep: i64,
        memory_prerequisite: u64,
    ) -> Result<(), RegistryError> {
        if !self.threads.read().contains_key(name) {
            return Err(RegistryError::UnknownThread(name.to_string()));
        }
        self.store.set(&idle_key(name), idle_sleep.to_string());
        self.store.set(&busy_key(name), busy_sleep.to_string());
        self.store
            .set(&memprereq_key(name), memory_prerequisite.to_string());
        Ok(())
    }

    pub fn thread(&self, name: &str) -> Option<Arc<ThreadHandle>> {
        self.threads.read().get(name).cloned()
    }

    pub fn thread_names(&self) -> Vec<String> {
        self.threads.read().keys().cloned().collect()
    }

    /// Stop and forget `name`. Returns whether it finished in time.
    pub fn terminate_thread(&self, name: &str, wait_for: bool) -> Result<bool, RegistryError> {
        let handle = self
            .threads
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownThread(name.to_string()))?;
        self.store.remove_action(&action_name(name));
        let finished = handle.terminate(wait_for);
        debug!(thread = name, finished, "Terminated thread");
        Ok(finished)
    }

    /// Stop every deployed thread; all are signalled before any is awaited.
    pub fn terminate_all_threads(&self, wait_for: bool) {
        let handles: Vec<_> = std::mem::take(&mut *self.threads.write())
            .into_iter()
            .collect();
        for (name, handle) in &handles {
            self.store.remove_action(&action_name(name));
            handle.terminate(false);
        }
        if wait_for {
            for (name, handle) in &handles {
                if !handle.terminate(true) {
                    warn!(thread = %name, "Thread did not stop within grace period");
                }
            }
        }
    }

    /// Pause every thread that obeys intermissions for `pause_millis`.
    pub fn intermission_all_threads(&self, pause_millis: u64) {
        for handle in self.threads.read().values() {
            handle.control().intermission(pause_millis);
        }
    }

    // ---- busy state ----

    pub fn handle_busy_state(&self, jobs: usize) {
        self.busy_jobs.store(jobs, Ordering::Relaxed);
    }

    pub fn busy_jobs(&self) -> usize {
        self.busy_jobs.load(Ordering::Relaxed)
    }

    // ---- access tracking ----

    pub fn access_tracker(&self) -> &Arc<AccessTracker> {
        &self.access
    }

    pub fn track(&self, host: &str, path: &str) {
        self.access.track(host, path);
    }

    pub fn access_track(&self, host: &str) -> Vec<Track> {
        self.access.access_track(host)
    }

    pub fn latest_access_count(&self, host: &str, delta_millis: i64) -> usize {
        self.access.latest_access_count(host, delta_millis)
    }

    pub fn access_hosts(&self) -> Vec<String> {
        self.access.access_hosts()
    }

    // ---- authorization ----

    pub fn set_authentify(&self, host: IpAddr, user: &str, rights: &str) {
        self.auth.set_authentify(host, user, rights);
    }

    pub fn remove_authentify(&self, host: IpAddr) {
        self.auth.remove_authentify(host);
    }

    pub fn authentify_user(&self, host: IpAddr) -> Option<String> {
        self.auth.authentify_user(host)
    }

    pub fn authentify_rights(&self, host: IpAddr) -> Option<String> {
        self.auth.authentify_rights(host)
    }

    pub fn add_authentify_right(&self, host: IpAddr, right: &str) {
        self.auth.add_authentify_right(host, right);
    }

    pub fn has_authentify_right(&self, host: IpAddr, right: &str) -> bool {
        self.auth.has_authentify_right(host, right)
    }

    // ---- config ----

    pub fn add_action(&self, name: impl Into<String>, action: Arc<dyn ConfigAction>) {
        self.store.add_action(name, action);
    }

    pub fn remove_action(&self, name: &str) -> bool {
        self.store.remove_action(name)
    }

    // ---- handoff queue ----

    pub fn queue(&self) -> &WorkQueue<E> {
        &self.queue
    }

    pub fn enqueue(&self, item: E) {
        self.queue.enqueue(item);
    }

    pub fn dequeue(&self) -> E {
        self.queue.dequeue()
    }

    pub fn dequeue_timeout(&self, timeout: std::time::Duration) -> Option<E> {
        self.queue.dequeue_timeout(timeout)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }
}

impl<E: Clone> Switchboard<E> {
    pub fn peek(&self) -> Option<E> {
        self.queue.peek()
    }
}
