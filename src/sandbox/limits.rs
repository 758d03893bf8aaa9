//! Resource limits for sandbox containers.
//!
//! Limits are deliberately conservative: the sandbox runs generated,
//! untrusted code whose only job is to compile, lint, and pass tests.

use serde::{Deserialize, Serialize};

/// Resource caps applied to a sandbox container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// Combined memory+swap limit in megabytes. Keeping this equal to
    /// `memory_mb` disables swap entirely.
    pub memory_swap_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes (fork-bomb protection).
    pub max_processes: u64,
    /// Overall wall-clock budget for the whole run, in seconds.
    pub overall_timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            memory_swap_mb: 2048,
            cpu_cores: 2.0,
            max_processes: 256,
            overall_timeout_secs: 900, // 15 minutes
        }
    }
}

impl ResourceLimits {
    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns memory+swap limit in bytes.
    pub fn memory_swap_bytes(&self) -> i64 {
        (self.memory_swap_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota derived from the allocated cores.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    /// Budget for a quick check phase (lint, typecheck): an eighth of the
    /// overall budget, at least 30 seconds.
    pub fn quick_phase_timeout_secs(&self) -> u64 {
        (self.overall_timeout_secs / 8).max(30)
    }

    /// Budget for a heavy phase (install, test): half the overall budget.
    pub fn heavy_phase_timeout_secs(&self) -> u64 {
        (self.overall_timeout_secs / 2).max(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_mb, 2048);
        assert_eq!(limits.memory_swap_mb, limits.memory_mb);
        assert_eq!(limits.max_processes, 256);
    }

    #[test]
    fn test_byte_conversions() {
        let limits = ResourceLimits {
            memory_mb: 512,
            memory_swap_mb: 512,
            ..Default::default()
        };
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
        assert_eq!(limits.memory_swap_bytes(), limits.memory_bytes());
    }

    #[test]
    fn test_cpu_quota() {
        let limits = ResourceLimits {
            cpu_cores: 2.0,
            ..Default::default()
        };
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 200_000);
    }

    #[test]
    fn test_phase_budgets() {
        let limits = ResourceLimits {
            overall_timeout_secs: 800,
            ..Default::default()
        };
        assert_eq!(limits.quick_phase_timeout_secs(), 100);
        assert_eq!(limits.heavy_phase_timeout_secs(), 400);
    }

    #[test]
    fn test_phase_budget_floors() {
        let limits = ResourceLimits {
            overall_timeout_secs: 60,
            ..Default::default()
        };
        assert_eq!(limits.quick_phase_timeout_secs(), 30);
        assert_eq!(limits.heavy_phase_timeout_secs(), 60);
    }
}
