//! Sandboxed code execution engine
//!
//! Accepts untrusted source code, builds and runs it in an isolated sandbox
//! under strict resource ceilings, and reports a classified result.

pub mod cancel;
pub mod collector;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod sandbox;
pub mod scheduler;

pub use crate::config::EngineConfig;
pub use crate::core::{
    Classification, ExecutionResult, LanguageInfo, Limit, LimitOverride, Phase, Registry,
    ResourceLimits, RunnerDescriptor, SourceFile, Submission,
};
pub use crate::engine::Engine;
pub use crate::error::{EngineError, Result};
pub use crate::scheduler::{JobHandle, JobId};
