//! Cancellable sleep used by scheduled threads.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A timed wait that can be cut short from another thread.
///
/// A wake-up issued while nobody is sleeping is remembered and ends the next
/// sleep immediately, so a `wake` racing with the start of a sleep is never
/// lost.
#[derive(Debug, Default)]
pub struct Sleeper {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Sleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for at most `duration`.
    ///
    /// Returns `true` if the full duration elapsed, `false` if woken early.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut woken = self.woken.lock();
        loop {
            if *woken {
                *woken = false;
                return false;
            }
            if self.cond.wait_until(&mut woken, deadline).timed_out() {
                let early = *woken;
                *woken = false;
                return !early;
            }
        }
    }

    /// Sleep for `millis` milliseconds; non-positive values return at once.
    pub fn sleep_millis(&self, millis: i64) -> bool {
        if millis <= 0 {
            return true;
        }
        self.sleep(Duration::from_millis(millis as u64))
    }

    /// Wake a sleeping thread, or the next one to sleep.
    pub fn wake(&self) {
        *self.woken.lock() = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sleep_runs_full_duration() {
        let sleeper = Sleeper::new();
        let start = Instant::now();
        assert!(sleeper.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wake_interrupts_sleep() {
        let sleeper = Arc::new(Sleeper::new());
        let other = Arc::clone(&sleeper);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let full = other.sleep(Duration::from_secs(30));
            (full, start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        sleeper.wake();
        let (full, elapsed) = handle.join().unwrap();
        assert!(!full);
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_early_wake_is_remembered() {
        let sleeper = Sleeper::new();
        sleeper.wake();
        let start = Instant::now();
        assert!(!sleeper.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(1));
        // consumed: the next sleep runs normally
        assert!(sleeper.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_non_positive_millis() {
        let sleeper = Sleeper::new();
        assert!(sleeper.sleep_millis(0));
        assert!(sleeper.sleep_millis(-1));
    }
}
