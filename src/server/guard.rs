//! Brute-force backoff and the deny list.
//!
//! Every accepted connection registers its source address. Repeated
//! connections within the expiry window are slowed down linearly and, past
//! the threshold, the address is denied.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::warn;

/// Guard tuning.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    /// Attempts above this deny the address.
    pub threshold: u32,
    /// Delay per recorded attempt.
    pub backoff: Duration,
    /// Attempts older than this are forgotten.
    pub window: Duration,
    /// Lifetime of a deny entry; `None` denies until [`BruteForceGuard::allow`].
    pub deny_ttl: Option<Duration>,
    /// When false nothing is ever denied; backoff still applies.
    pub block_attack: bool,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            threshold: 10,
            backoff: Duration::from_millis(2000),
            window: Duration::from_secs(60),
            deny_ttl: None,
            block_attack: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct Denial {
    reason: String,
    since: Instant,
}

/// Outcome of registering a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub attempts: u32,
    /// How long the accept loop should stall before admitting.
    pub delay: Duration,
    pub denied: bool,
}

/// Attempt counters and deny list, shareable between servers.
#[derive(Debug, Default)]
pub struct BruteForceGuard {
    attempts: DashMap<IpAddr, Attempts>,
    denied: DashMap<IpAddr, Denial>,
    settings: RwLock<GuardSettings>,
}

impl BruteForceGuard {
    pub fn new(settings: GuardSettings) -> Self {
        Self {
            attempts: DashMap::new(),
            denied: DashMap::new(),
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> GuardSettings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: GuardSettings) {
        *self.settings.write() = settings;
    }

    /// Count a connection from `ip`.
    pub fn register(&self, ip: IpAddr) -> Admission {
        let settings = self.settings();
        let now = Instant::now();

        let attempts = {
            let mut entry = self.attempts.entry(ip).or_insert(Attempts {
                count: 0,
                last_seen: now,
            });
            if now.duration_since(entry.last_seen) > settings.window {
                entry.count = 0;
            }
            entry.count = entry.count.saturating_add(1);
            entry.last_seen = now;
            entry.count
        };

        let delay = if attempts > 1 {
            settings.backoff.saturating_mul(attempts)
        } else {
            Duration::ZERO
        };

        if attempts > settings.threshold && settings.block_attack && !self.is_denied(ip) {
            warn!(host = %ip, attempts, "Denying host after repeated connections");
            self.deny(ip, "brute force");
        }

        Admission {
            attempts,
            delay,
            denied: self.is_denied(ip),
        }
    }

    /// Whether `ip` is on the deny list. Expired entries are dropped.
    pub fn is_denied(&self, ip: IpAddr) -> bool {
        let ttl = self.settings.read().deny_ttl;
        let expired = match self.denied.get(&ip) {
            None => return false,
            Some(denial) => ttl.is_some_and(|ttl| denial.since.elapsed() > ttl),
        };
        if expired {
            self.denied.remove(&ip);
            return false;
        }
        true
    }

    /// Deny `ip`. No-op when attack blocking is disabled.
    pub fn deny(&self, ip: IpAddr, reason: impl Into<String>) {
        if !self.settings.read().block_attack {
            return;
        }
        self.denied.insert(
            ip,
            Denial {
                reason: reason.into(),
                since: Instant::now(),
            },
        );
    }

    /// Lift a denial and reset the attempt counter.
    pub fn allow(&self, ip: IpAddr) {
        self.denied.remove(&ip);
        self.attempts.remove(&ip);
    }

    pub fn attempts(&self, ip: IpAddr) -> u32 {
        self.attempts.get(&ip).map(|a| a.count).unwrap_or(0)
    }

    pub fn denial_reason(&self, ip: IpAddr) -> Option<String> {
        self.denied.get(&ip).map(|d| d.reason.clone())
    }

    pub fn denied_hosts(&self) -> Vec<IpAddr> {
        self.denied.iter().map(|e| *e.key()).collect()
    }

    /// Drop expired attempt counters and denials.
    pub fn purge(&self) {
        let settings = self.settings();
        let now = Instant::now();
        self.attempts
            .retain(|_, a| now.duration_since(a.last_seen) <= settings.window);
        if let Some(ttl) = settings.deny_ttl {
            self.denied
                .retain(|_, d| now.duration_since(d.since) <= ttl);
        }
    }
}
