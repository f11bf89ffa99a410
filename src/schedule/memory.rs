//! Memory availability checks for scheduled jobs.

/// Source of free-memory figures for the scheduler.
///
/// Injected into [`BusyThread`](super::BusyThread) so tests can simulate
/// memory pressure.
pub trait MemorySource: Send + Sync {
    /// Bytes currently available to the process.
    fn available(&self) -> u64;

    /// Best-effort attempt to hand memory back to the system.
    fn reclaim(&self) {}
}

/// Source backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemorySource for SystemMemory {
    #[cfg(target_os = "linux")]
    fn available(&self) -> u64 {
        // SAFETY: sysinfo only writes into the zeroed struct we pass
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return u64::MAX;
        }
        let unit = u64::from(info.mem_unit.max(1));
        (info.freeram as u64)
            .saturating_add(info.bufferram as u64)
            .saturating_mul(unit)
    }

    #[cfg(not(target_os = "linux"))]
    fn available(&self) -> u64 {
        u64::MAX
    }

    fn reclaim(&self) {
        trim_heap();
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() {
    // SAFETY: malloc_trim has no preconditions
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() {}

/// Source reporting a fixed amount of memory.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub u64);

impl MemorySource for FixedMemory {
    fn available(&self) -> u64 {
        self.0
    }
}
