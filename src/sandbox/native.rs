//! Native backend
//!
//! Runs phases directly on the host: each phase leads its own process group
//! under a [keeper](super::keeper) that holds on to every descendant, gets a
//! scrubbed environment and hard rlimits, and optionally a fresh user and
//! network namespace. CPU, memory and process count are enforced by the
//! execution monitor sampling the keeper's tree in /proc.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use tokio::process::Command;
use tracing::{info, warn};

use super::context::ContextInfo;
use super::Backend;
use crate::config::NetworkPolicy;
use crate::core::{Phase, ResourceLimits};
use crate::error::EngineError;
use crate::monitor::RawOutcome;

const SYSTEM_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Largest file a sandboxed process may write
const FSIZE_LIMIT: u64 = 256 * 1024 * 1024;
const OPEN_FILES_LIMIT: u64 = 256;

static NETWORK_ISOLATION: OnceLock<bool> = OnceLock::new();

/// Whether this host lets an unprivileged child enter fresh user and network
/// namespaces. Probed once per process.
pub fn network_isolation_available() -> bool {
    *NETWORK_ISOLATION.get_or_init(|| {
        let mut probe = std::process::Command::new("/bin/sh");
        probe
            .args(["-c", "exit 0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: unshare is async-signal-safe and touches no parent state
        unsafe {
            std::os::unix::process::CommandExt::pre_exec(&mut probe, || {
                unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
                Ok(())
            });
        }
        matches!(probe.status(), Ok(status) if status.success())
    })
}

#[derive(Debug, Clone)]
pub struct NativeBackend {
    isolate_network: bool,
}

impl NativeBackend {
    /// Backend honouring `policy`; `Deny` fails when the host cannot isolate
    pub fn with_policy(policy: NetworkPolicy) -> crate::error::Result<Self> {
        let isolate_network = match policy {
            NetworkPolicy::Allow => false,
            NetworkPolicy::Deny => {
                if !network_isolation_available() {
                    return Err(EngineError::Config(
                        "network isolation requested but user/network namespaces are unavailable"
                            .into(),
                    ));
                }
                true
            }
            NetworkPolicy::BestEffort => {
                let available = network_isolation_available();
                if !available {
                    warn!("Network namespaces unavailable; sandboxed programs keep host network access");
                }
                available
            }
        };
        info!("Native backend (network isolation: {})", isolate_network);

        Ok(Self { isolate_network })
    }

    pub fn isolates_network(&self) -> bool {
        self.isolate_network
    }
}

/// Resolve `./prog` style commands against the sandbox root
fn resolve_program(workspace: &Path, program: &str) -> String {
    match program.strip_prefix("./") {
        Some(rel) => workspace.join(rel).to_string_lossy().into_owned(),
        None => program.to_string(),
    }
}

fn search_path(environment: Option<&str>) -> String {
    match environment {
        Some(env) => format!("{}/bin:{}", env.trim_end_matches('/'), SYSTEM_PATH),
        None => SYSTEM_PATH.to_string(),
    }
}

#[async_trait]
impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn init(&self, _ctx: &ContextInfo) -> Result<()> {
        Ok(())
    }

    fn command(
        &self,
        ctx: &ContextInfo,
        _phase: Phase,
        argv: &[String],
        limits: &ResourceLimits,
        stdin: Option<&str>,
    ) -> Result<Command> {
        let (program, args) = argv.split_first().context("Empty command")?;
        let workspace = &ctx.workspace;

        let mut command = Command::new(resolve_program(workspace, program));
        command
            .args(args)
            .current_dir(workspace)
            .env_clear()
            .env("PATH", search_path(ctx.environment.as_deref()))
            .env("HOME", workspace)
            .env("TMPDIR", workspace)
            .env("LANG", "C.UTF-8");

        match stdin {
            Some(name) => {
                let file = File::open(workspace.join(name))
                    .with_context(|| format!("Failed to open {}", name))?;
                command.stdin(Stdio::from(file));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        // Kernel-side backstop for CPU; the monitor normally stops it first
        let cpu_soft = limits.cpu_time_ms.div_ceil(1000) + 1;
        let isolate_network = self.isolate_network;

        // SAFETY: only async-signal-safe syscalls run between fork and exec
        unsafe {
            command.pre_exec(move || {
                setrlimit(Resource::RLIMIT_CPU, cpu_soft, cpu_soft + 1)?;
                setrlimit(Resource::RLIMIT_FSIZE, FSIZE_LIMIT, FSIZE_LIMIT)?;
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                setrlimit(Resource::RLIMIT_NOFILE, OPEN_FILES_LIMIT, OPEN_FILES_LIMIT)?;
                super::keeper::split()?;
                // Only the program side enters the namespaces
                if isolate_network {
                    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)
                        .map_err(io::Error::from)?;
                }
                Ok(())
            });
        }

        Ok(command)
    }

    fn samples_usage(&self) -> bool {
        true
    }

    async fn finish(
        &self,
        _ctx: &ContextInfo,
        _phase: Phase,
        _limits: &ResourceLimits,
        _raw: &mut RawOutcome,
    ) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _ctx: &ContextInfo) -> Result<()> {
        Ok(())
    }

    fn cleanup_blocking(&self, _ctx: &ContextInfo) {}
}
