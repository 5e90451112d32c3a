use serde::{Deserialize, Serialize};
use std::fmt;

use super::limits::Limit;

/// Phase of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Build,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Build => write!(f, "build"),
            Phase::Run => write!(f, "run"),
        }
    }
}

/// Terminal classification of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    CompileError,
    RuntimeError,
    TimeExceeded,
    MemoryExceeded,
    OutputExceeded,
    ProcessLimitExceeded,
    ProvisionError,
    QueueTimeout,
    Cancelled,
}

impl Classification {
    pub fn from_limit(limit: Limit) -> Self {
        match limit {
            Limit::Memory => Classification::MemoryExceeded,
            Limit::Output => Classification::OutputExceeded,
            Limit::Processes => Classification::ProcessLimitExceeded,
            Limit::CpuTime | Limit::WallTime => Classification::TimeExceeded,
        }
    }

    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            Classification::TimeExceeded
                | Classification::MemoryExceeded
                | Classification::OutputExceeded
                | Classification::ProcessLimitExceeded
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Success => "success",
            Classification::CompileError => "compile_error",
            Classification::RuntimeError => "runtime_error",
            Classification::TimeExceeded => "time_exceeded",
            Classification::MemoryExceeded => "memory_exceeded",
            Classification::OutputExceeded => "output_exceeded",
            Classification::ProcessLimitExceeded => "process_limit_exceeded",
            Classification::ProvisionError => "provision_error",
            Classification::QueueTimeout => "queue_timeout",
            Classification::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Structured outcome of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub language: String,
    pub classification: Classification,
    /// Last phase that was started; `None` if the job never reached a sandbox
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_kb: u64,
    /// Ceiling that terminated the process tree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    /// Diagnostic for failures that have no process output of their own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionResult {
    /// Result for a job that ended without producing process output.
    pub fn without_output(
        language: impl Into<String>,
        classification: Classification,
        phase: Option<Phase>,
        message: Option<String>,
    ) -> Self {
        Self {
            language: language.into(),
            classification,
            phase,
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            wall_time_ms: 0,
            cpu_time_ms: 0,
            memory_kb: 0,
            limit: None,
            message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.classification == Classification::Success
    }

    pub fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_serde_matches_display() {
        for c in [
            Classification::Success,
            Classification::CompileError,
            Classification::ProcessLimitExceeded,
            Classification::QueueTimeout,
        ] {
            let json = serde_json::to_string(&c).unwrap();
            assert_eq!(json, format!("\"{}\"", c));
        }
    }

    #[test]
    fn test_limit_mapping() {
        assert_eq!(
            Classification::from_limit(Limit::WallTime),
            Classification::TimeExceeded
        );
        assert_eq!(
            Classification::from_limit(Limit::CpuTime),
            Classification::TimeExceeded
        );
        assert_eq!(
            Classification::from_limit(Limit::Processes),
            Classification::ProcessLimitExceeded
        );
        assert!(Classification::MemoryExceeded.is_limit_exceeded());
        assert!(!Classification::RuntimeError.is_limit_exceeded());
    }
}
