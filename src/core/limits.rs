//! Resource limit policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Ceilings enforced on one phase of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Accumulated CPU time of the whole process tree, in milliseconds
    pub cpu_time_ms: u64,
    /// Elapsed wall-clock time, in milliseconds
    pub wall_time_ms: u64,
    /// Resident memory of the whole process tree, in bytes
    pub memory_bytes: u64,
    /// Captured stdout + stderr, in bytes
    pub output_bytes: u64,
    /// Live processes in the tree
    pub processes: u32,
}

impl ResourceLimits {
    /// Run-phase defaults used when a language does not set its own.
    pub const RUN_DEFAULT: ResourceLimits = ResourceLimits {
        cpu_time_ms: 5_000,
        wall_time_ms: 10_000,
        memory_bytes: 128 * 1024 * 1024,
        output_bytes: 1024 * 1024,
        processes: 64,
    };

    /// Build-phase defaults (compilers are hungrier than user programs).
    pub const BUILD_DEFAULT: ResourceLimits = ResourceLimits {
        cpu_time_ms: 30_000,
        wall_time_ms: 30_000,
        memory_bytes: 2048 * 1024 * 1024,
        output_bytes: 1024 * 1024,
        processes: 64,
    };

    /// Largest CPU or wall time ceiling a descriptor may carry (one day)
    pub const MAX_TIME_MS: u64 = 24 * 60 * 60 * 1000;

    /// Reject ceilings the monitor cannot represent as deadlines
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("cpu_time_ms", self.cpu_time_ms),
            ("wall_time_ms", self.wall_time_ms),
        ] {
            if value > Self::MAX_TIME_MS {
                return Err(EngineError::Config(format!(
                    "{} = {} exceeds the maximum of {}",
                    name,
                    value,
                    Self::MAX_TIME_MS
                )));
            }
        }
        Ok(())
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    /// Apply a submission override. Each field becomes `min(self, override)`,
    /// so an override can only tighten a limit.
    pub fn restrict(&self, limits: &LimitOverride) -> ResourceLimits {
        fn tighter<T: Ord + Copy>(base: T, over: Option<T>) -> T {
            over.map_or(base, |v| v.min(base))
        }

        ResourceLimits {
            cpu_time_ms: tighter(self.cpu_time_ms, limits.cpu_time_ms),
            wall_time_ms: tighter(self.wall_time_ms, limits.wall_time_ms),
            memory_bytes: tighter(self.memory_bytes, limits.memory_bytes),
            output_bytes: tighter(self.output_bytes, limits.output_bytes),
            processes: tighter(self.processes, limits.processes),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::RUN_DEFAULT
    }
}

/// Per-submission limit request. Unset fields keep the language default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitOverride {
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
    pub processes: Option<u32>,
}

impl LimitOverride {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The ceiling that terminated an execution.
///
/// Declaration order is the tie-break priority: when several ceilings are
/// found breached in the same observation the first one listed wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Memory,
    Output,
    Processes,
    CpuTime,
    WallTime,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Limit::Memory => "memory",
            Limit::Output => "output",
            Limit::Processes => "processes",
            Limit::CpuTime => "cpu_time",
            Limit::WallTime => "wall_time",
        };
        write!(f, "{}", s)
    }
}
