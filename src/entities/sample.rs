//! Performance measurements and tiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Immutable point-in-time measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub fps: f64,
    pub frame_time_ms: f64,
    pub memory_bytes: u64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PerformanceTier {
    Low,
    Medium,
    High,
}

impl PerformanceTier {
    /// Global frame-rate target applied while in this tier.
    pub fn target_frame_rate(self) -> u32 {
        match self {
            PerformanceTier::High => 60,
            PerformanceTier::Medium => 45,
            PerformanceTier::Low => 30,
        }
    }

    /// Suggested engine concurrency ceiling for this tier.
    pub fn suggested_concurrency(self) -> usize {
        match self {
            PerformanceTier::High => 10,
            PerformanceTier::Medium => 6,
            PerformanceTier::Low => 3,
        }
    }
}

impl fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PerformanceTier::Low => "low",
            PerformanceTier::Medium => "medium",
            PerformanceTier::High => "high",
        };
        f.write_str(s)
    }
}

/// Memory reading: used bytes against the reported limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub used: u64,
    pub limit: u64,
}

impl MemoryInfo {
    /// Usage fraction (0.0-1.0). Zero limit reads as no usage.
    pub fn usage_fraction(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64
        }
    }
}

/// Static device capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub cores: usize,
    pub memory_bytes: u64,
}

impl DeviceInfo {
    pub fn detect() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        Self {
            cores: num_cpus::get(),
            memory_bytes: sys.total_memory(),
        }
    }

    pub fn memory_gb(&self) -> f64 {
        self.memory_bytes as f64 / 1024.0 / 1024.0 / 1024.0
    }
}
