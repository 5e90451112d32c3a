//! Result collector
//!
//! Pure mapping from a phase's raw outcome to the caller-facing
//! [`ExecutionResult`].

use std::time::Duration;

use crate::core::{Classification, ExecutionResult, Limit, Phase};
use crate::monitor::{RawOutcome, Termination};

/// Delivered by the kernel when RLIMIT_CPU runs out
const SIGXCPU: i32 = 24;

/// Round to the nearest millisecond
fn millis(d: Duration) -> u64 {
    ((d.as_micros() + 500) / 1000) as u64
}

fn kilobytes(bytes: u64) -> u64 {
    bytes.div_ceil(1024)
}

fn compile_message(raw: &RawOutcome) -> String {
    if let Termination::LimitExceeded(limit) = raw.termination {
        let message = match limit {
            Limit::CpuTime | Limit::WallTime => "Compilation timed out",
            Limit::Memory => "Compiler exceeded memory limit",
            Limit::Output => "Compiler output exceeded limit",
            Limit::Processes => "Compiler exceeded process limit",
        };
        return message.to_string();
    }

    if !raw.stderr.is_empty() {
        String::from_utf8_lossy(&raw.stderr).into_owned()
    } else if !raw.stdout.is_empty() {
        String::from_utf8_lossy(&raw.stdout).into_owned()
    } else {
        match raw.termination {
            Termination::Signaled(_) => "Compiler crashed".to_string(),
            Termination::Exited(code) => format!("Compilation failed with exit code {}", code),
            _ => "Compilation failed".to_string(),
        }
    }
}

/// Classify the outcome of the last phase that ran
pub fn collect(language: &str, raw: &RawOutcome, phase: Phase) -> ExecutionResult {
    let (classification, limit) = match (phase, raw.termination) {
        (_, Termination::Cancelled) => (Classification::Cancelled, None),
        (_, Termination::Exited(0)) => (Classification::Success, None),
        (Phase::Build, Termination::LimitExceeded(l)) => (Classification::CompileError, Some(l)),
        (Phase::Build, _) => (Classification::CompileError, None),
        (Phase::Run, Termination::LimitExceeded(l)) => (Classification::from_limit(l), Some(l)),
        (Phase::Run, Termination::Signaled(SIGXCPU)) => {
            (Classification::TimeExceeded, Some(Limit::CpuTime))
        }
        (Phase::Run, Termination::Signaled(_) | Termination::Exited(_)) => {
            (Classification::RuntimeError, None)
        }
    };

    let message = match classification {
        Classification::CompileError => Some(compile_message(raw)),
        _ => None,
    };
    let forced = raw.termination.is_forced();

    ExecutionResult {
        language: language.to_string(),
        classification,
        phase: Some(phase),
        exit_code: match raw.termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        },
        signal: match raw.termination {
            Termination::Signaled(sig) => Some(sig),
            _ => None,
        },
        stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        stdout_truncated: raw.stdout_truncated || forced,
        stderr_truncated: raw.stderr_truncated || forced,
        wall_time_ms: millis(raw.wall_time),
        cpu_time_ms: millis(raw.cpu_time),
        memory_kb: kilobytes(raw.peak_memory_bytes),
        limit,
        message,
    }
}
