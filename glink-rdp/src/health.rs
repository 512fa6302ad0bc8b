//! Health samples a client reports to its cluster.

use glink_core::MetricsCmd;
use sysinfo::System;

const MIB: u64 = 1024 * 1024;

/// Produces one metrics sample per health tick.
pub trait MetricsSource: Send {
    fn sample(&mut self) -> MetricsCmd;
}

/// Host CPU and memory via `sysinfo`.
pub struct SystemMetrics {
    system: System,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so the first tick has a baseline.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetrics {
    fn sample(&mut self) -> MetricsCmd {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        MetricsCmd {
            cpu_usage: cpu_hundredths(self.system.global_cpu_usage()),
            mem_total: to_mib(self.system.total_memory()),
            mem_used: to_mib(self.system.used_memory()),
            mem_free: to_mib(self.system.free_memory()),
        }
    }
}

/// Fixed sample, for tests and hosts without `sysinfo` support.
#[derive(Debug, Clone, Default)]
pub struct StaticMetrics(pub MetricsCmd);

impl MetricsSource for StaticMetrics {
    fn sample(&mut self) -> MetricsCmd {
        self.0.clone()
    }
}

/// Percent to hundredths of a percent, rounded.
fn cpu_hundredths(percent: f32) -> u32 {
    if !percent.is_finite() || percent <= 0.0 {
        return 0;
    }
    (f64::from(percent) * 100.0).round() as u32
}

fn to_mib(bytes: u64) -> u32 {
    u32::try_from(bytes / MIB).unwrap_or(u32::MAX)
}
