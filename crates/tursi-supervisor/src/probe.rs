//! Resource sampling for worker processes.

use sysinfo::{Pid, System};

/// CPU and memory usage of one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Samples resource usage by OS process id.
pub trait ResourceProbe: Send {
    /// `None` when the process cannot be inspected.
    fn sample(&mut self, pid: u32) -> Option<ResourceUsage>;
}

/// Probe backed by `sysinfo`. CPU usage is measured between consecutive
/// refreshes, so the first sample of a process reads 0%.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self, pid: u32) -> Option<ResourceUsage> {
        let pid = Pid::from_u32(pid);
        if !self.system.refresh_process(pid) {
            return None;
        }
        let process = self.system.process(pid)?;
        Some(ResourceUsage {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_own_process() {
        let mut probe = SysinfoProbe::new();
        let usage = probe.sample(std::process::id()).expect("own process visible");
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[test]
    fn unknown_pid_yields_none() {
        let mut probe = SysinfoProbe::new();
        assert!(probe.sample(u32::MAX - 1).is_none());
    }
}
