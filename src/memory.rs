//! Memory-utilization probes for the engine's self-termination watchdog

use parking_lot::Mutex;
use sysinfo::System;

/// Samples the memory utilization of the current environment.
///
/// The engine only needs a fraction in `0.0..=1.0`; how it is obtained
/// (host totals, cgroup limits, a test constant) is up to the probe.
pub trait MemoryProbe: Send + Sync {
    /// Current memory utilization as a fraction of the available budget.
    fn utilization(&self) -> f64;
}

/// System-wide memory utilization via `sysinfo`.
pub struct SysinfoProbe {
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn utilization(&self) -> f64 {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        sys.used_memory() as f64 / total as f64
    }
}

/// A probe returning a fixed value, for tests and for disabling the watchdog.
pub struct FixedProbe(pub f64);

impl MemoryProbe for FixedProbe {
    fn utilization(&self) -> f64 {
        self.0
    }
}
