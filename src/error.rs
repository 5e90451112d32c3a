//! Caller-facing error taxonomy
//!
//! Errors that reject a request outright. Everything that happens after a job
//! has been admitted is reported through `Classification` on the result instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("language already registered: {0}")]
    DuplicateLanguage(String),

    #[error("scheduler overloaded: {queued} jobs already waiting")]
    Overloaded { queued: usize },

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("failed to provision sandbox: {0:#}")]
    Provision(anyhow::Error),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
