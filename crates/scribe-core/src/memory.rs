//! Process memory sampling

use parking_lot::Mutex;
use sysinfo::{Pid, System};

/// Source of memory samples used for peak-memory measurements
pub trait MemoryProbe: Send + Sync {
    /// Current resident memory of the process in megabytes
    fn current_mb(&self) -> f64;
}

/// Samples the resident set size of the current process
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("Current process id unavailable, memory samples will read 0");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return 0.0;
        }
        system
            .process(pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_probe_reports_memory() {
        let probe = ProcessMemoryProbe::new();
        let mb = probe.current_mb();
        assert!(mb >= 0.0);
        assert!(mb.is_finite());
    }
}
