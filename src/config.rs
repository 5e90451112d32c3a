//! Engine configuration
//!
//! Loaded from environment variables (after `.env` is applied by the binary).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Which isolation primitive backs a sandbox context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process group + rlimits + procfs monitoring, no extra tooling required
    Native,
    /// The `isolate` sandbox (cgroups, namespaces)
    Isolate,
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "isolate" => Ok(BackendKind::Isolate),
            other => Err(EngineError::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Outbound network policy for sandboxed processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// Network must be isolated; startup fails if the host cannot do it
    Deny,
    /// Isolate the network when the host supports it, otherwise warn
    BestEffort,
    /// Leave the host network reachable
    Allow,
}

impl FromStr for NetworkPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deny" => Ok(NetworkPolicy::Deny),
            "best_effort" | "best-effort" => Ok(NetworkPolicy::BestEffort),
            "allow" => Ok(NetworkPolicy::Allow),
            other => Err(EngineError::Config(format!(
                "unknown network policy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global ceiling on live sandbox contexts (C)
    pub concurrency: usize,
    /// Jobs allowed to wait for a slot; 0 means never queue
    pub queue_depth: usize,
    /// Longest a job may wait in queue before it fails with QueueTimeout
    pub admission_timeout: Duration,
    /// Optional ceiling on live sandbox contexts per tenant
    pub tenant_concurrency: Option<usize>,
    /// Directory under which sandbox workspaces are created
    pub workspace_root: PathBuf,
    pub backend: BackendKind,
    pub network: NetworkPolicy,
    /// Language catalog path (None = built-in catalog)
    pub languages_path: Option<PathBuf>,
    /// Execution monitor sampling period
    pub sample_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_depth: 64,
            admission_timeout: Duration::from_secs(30),
            tenant_concurrency: None,
            workspace_root: std::env::temp_dir(),
            backend: BackendKind::Native,
            network: NetworkPolicy::BestEffort,
            languages_path: None,
            sample_interval: Duration::from_millis(10),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("CODERUN_CONCURRENCY") {
            config.concurrency = parse("CODERUN_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("CODERUN_QUEUE_DEPTH") {
            config.queue_depth = parse("CODERUN_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = lookup("CODERUN_ADMISSION_TIMEOUT_MS") {
            config.admission_timeout =
                Duration::from_millis(parse("CODERUN_ADMISSION_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("CODERUN_TENANT_CONCURRENCY") {
            config.tenant_concurrency = Some(parse("CODERUN_TENANT_CONCURRENCY", &v)?);
        }
        if let Some(v) = lookup("CODERUN_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODERUN_BACKEND") {
            config.backend = v.parse()?;
        }
        if let Some(v) = lookup("CODERUN_NETWORK") {
            config.network = v.parse()?;
        }
        if let Some(v) = lookup("CODERUN_LANGUAGES") {
            config.languages_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CODERUN_SAMPLE_INTERVAL_MS") {
            config.sample_interval =
                Duration::from_millis(parse("CODERUN_SAMPLE_INTERVAL_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(EngineError::Config(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.tenant_concurrency == Some(0) {
            return Err(EngineError::Config(
                "tenant concurrency must be at least 1".into(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(EngineError::Config(
                "sample interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid value for {}: {:?}", key, value)))
}
