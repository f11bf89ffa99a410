//! Per-host access tracking.
//!
//! Each host keeps an ordered `timestamp -> path` map. Entries older than the
//! maximum age or beyond the per-host maximum are pruned lazily when the host
//! is read, and for all hosts by [`AccessTracker::clean_up`]. The number of
//! tracked hosts is capped; the host idle the longest is evicted first.

use crate::schedule::{JobError, ScheduledJob};
use crate::store::ConfigStore;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Config key: maximum age of a tracked access, in milliseconds.
pub const MAX_TRACKING_TIME_KEY: &str = "server.maxTrackingTime";
/// Config key: maximum accesses kept per host.
pub const MAX_TRACKING_COUNT_KEY: &str = "server.maxTrackingCount";
/// Config key: maximum number of tracked hosts.
pub const MAX_TRACKING_HOST_COUNT_KEY: &str = "server.maxTrackingHostCount";

/// Tracker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerLimits {
    pub max_age_millis: i64,
    pub max_count: usize,
    pub max_hosts: usize,
}

impl Default for TrackerLimits {
    fn default() -> Self {
        Self {
            max_age_millis: 60 * 60 * 1000,
            max_count: 1000,
            max_hosts: 100,
        }
    }
}

impl TrackerLimits {
    pub fn from_store(store: &ConfigStore) -> Self {
        let defaults = Self::default();
        Self {
            max_age_millis: store.get_long(MAX_TRACKING_TIME_KEY, defaults.max_age_millis),
            max_count: usize::try_from(
                store.get_long(MAX_TRACKING_COUNT_KEY, defaults.max_count as i64),
            )
            .unwrap_or(defaults.max_count),
            max_hosts: usize::try_from(
                store.get_long(MAX_TRACKING_HOST_COUNT_KEY, defaults.max_hosts as i64),
            )
            .unwrap_or(defaults.max_hosts),
        }
    }
}

/// One recorded access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub time_millis: i64,
    pub path: String,
}

type Accesses = BTreeMap<i64, String>;

#[derive(Debug, Default)]
pub struct AccessTracker {
    hosts: DashMap<String, Accesses>,
    limits: RwLock<TrackerLimits>,
}

impl AccessTracker {
    pub fn new(limits: TrackerLimits) -> Self {
        Self {
            hosts: DashMap::new(),
            limits: RwLock::new(limits),
        }
    }

    pub fn limits(&self) -> TrackerLimits {
        *self.limits.read()
    }

    pub fn set_limits(&self, limits: TrackerLimits) {
        *self.limits.write() = limits;
    }

    /// Record an access to `path` by `host` now.
    pub fn track(&self, host: &str, path: &str) {
        self.track_at(host, path, Utc::now().timestamp_millis());
    }

    fn track_at(&self, host: &str, path: &str, now: i64) {
        let limits = self.limits();
        {
            let mut accesses = self.hosts.entry(host.to_string()).or_default();
            let mut at = now;
            while accesses.contains_key(&at) {
                at += 1;
            }
            accesses.insert(at, path.to_string());
            prune(&mut accesses, &limits, now);
        }
        self.evict_hosts(limits.max_hosts);
    }

    fn evict_hosts(&self, max_hosts: usize) {
        while self.hosts.len() > max_hosts {
            let idle = self
                .hosts
                .iter()
                .map(|e| (e.key().clone(), e.value().keys().next_back().copied().unwrap_or(i64::MIN)))
                .min_by_key(|(_, latest)| *latest);
            match idle {
                Some((host, _)) => {
                    debug!(host = %host, "Evicting idle host from access tracker");
                    self.hosts.remove(&host);
                }
                None => break,
            }
        }
    }

    /// Accesses of `host`, oldest first.
    pub fn access_track(&self, host: &str) -> Vec<Track> {
        let limits = self.limits();
        let now = Utc::now().timestamp_millis();
        match self.hosts.get_mut(host) {
            Some(mut accesses) => {
                prune(&mut accesses, &limits, now);
                accesses
                    .iter()
                    .map(|(t, p)| Track {
                        time_millis: *t,
                        path: p.clone(),
                    })
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Accesses of `host` within the last `delta_millis`.
    pub fn latest_access_count(&self, host: &str, delta_millis: i64) -> usize {
        let since = Utc::now().timestamp_millis() - delta_millis;
        self.hosts
            .get(host)
            .map(|accesses| accesses.range(since..).count())
            .unwrap_or(0)
    }

    pub fn access_hosts(&self) -> Vec<String> {
        self.hosts.iter().map(|e| e.key().clone()).collect()
    }

    /// Prune every host; hosts left without accesses are dropped.
    pub fn clean_up(&self) -> usize {
        let limits = self.limits();
        let now = Utc::now().timestamp_millis();
        let before = self.hosts.len();
        self.hosts.retain(|_, accesses| {
            prune(accesses, &limits, now);
            !accesses.is_empty()
        });
        self.evict_hosts(limits.max_hosts);
        before.saturating_sub(self.hosts.len())
    }
}

fn prune(accesses: &mut Accesses, limits: &TrackerLimits, now: i64) {
    let cutoff = now.saturating_sub(limits.max_age_millis);
    *accesses = accesses.split_off(&cutoff);
    while accesses.len() > limits.max_count {
        accesses.pop_first();
    }
}

/// Periodic bulk clean-up of an [`AccessTracker`].
pub struct CleanupJob {
    tracker: Arc<AccessTracker>,
}

impl CleanupJob {
    pub fn new(tracker: Arc<AccessTracker>) -> Self {
        Self { tracker }
    }
}

impl ScheduledJob for CleanupJob {
    fn job(&mut self) -> Result<bool, JobError> {
        let dropped = self.tracker.clean_up();
        if dropped > 0 {
            debug!(dropped, "Access tracker cleaned up");
        }
        Ok(dropped > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_age_millis: i64, max_count: usize, max_hosts: usize) -> AccessTracker {
        AccessTracker::new(TrackerLimits {
            max_age_millis,
            max_count,
            max_hosts,
        })
    }

    #[test]
    fn test_track_and_read() {
        let t = tracker(60_000, 10, 10);
        t.track("1.2.3.4", "/a");
        t.track("1.2.3.4", "/b");
        let track = t.access_track("1.2.3.4");
        assert_eq!(track.len(), 2);
        assert_eq!(track[0].path, "/a");
        assert_eq!(track[1].path, "/b");
        assert!(track[0].time_millis < track[1].time_millis);
        assert_eq!(t.latest_access_count("1.2.3.4", 60_000), 2);
        assert_eq!(t.latest_access_count("5.6.7.8", 60_000), 0);
        assert!(t.access_track("5.6.7.8").is_empty());
    }

    #[test]
    fn test_max_count() {
        let t = tracker(60_000, 3, 10);
        for i in 0..5 {
            t.track("h", &format!("/{i}"));
        }
        let paths: Vec<_> = t.access_track("h").into_iter().map(|t| t.path).collect();
        assert_eq!(paths, vec!["/2", "/3", "/4"]);
    }

    #[test]
    fn test_max_age() {
        let t = tracker(1000, 100, 10);
        let now = Utc::now().timestamp_millis();
        t.track_at("h", "/old", now - 5000);
        t.track("h", "/new");
        let track = t.access_track("h");
        assert_eq!(track.len(), 1);
        assert_eq!(track[0].path, "/new");
    }

    #[test]
    fn test_host_cap_evicts_idle_host() {
        let t = tracker(3_600_000, 100, 2);
        let now = Utc::now().timestamp_millis();
        t.track_at("old", "/", now - 2000);
        t.track_at("mid", "/", now - 1000);
        t.track_at("new", "/", now);
        let mut hosts = t.access_hosts();
        hosts.sort();
        assert_eq!(hosts, vec!["mid", "new"]);
    }

    #[test]
    fn test_clean_up_drops_empty_hosts() {
        let t = tracker(1000, 100, 10);
        let now = Utc::now().timestamp_millis();
        t.track_at("stale", "/", now - 10_000);
        t.track("fresh", "/");
        assert_eq!(t.clean_up(), 1);
        assert_eq!(t.access_hosts(), vec!["fresh"]);

        let mut job = CleanupJob::new(Arc::new(tracker(1000, 100, 10)));
        assert!(!job.job().unwrap());
    }

    #[test]
    fn test_limits_from_store() {
        let store = ConfigStore::in_memory(BTreeMap::from([
            (MAX_TRACKING_COUNT_KEY.to_string(), "5".to_string()),
            (MAX_TRACKING_HOST_COUNT_KEY.to_string(), "garbage".to_string()),
        ]));
        let limits = TrackerLimits::from_store(&store);
        assert_eq!(limits.max_count, 5);
        assert_eq!(limits.max_hosts, 100);
        assert_eq!(limits.max_age_millis, 3_600_000);
    }
}
