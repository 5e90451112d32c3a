//! Isolate backend
//!
//! Wraps the `isolate` sandbox: one box per context, initialised from the
//! materialised workspace. CPU time, memory and process count are enforced
//! by isolate's cgroup; the monitor still enforces wall time, output size and
//! cancellation and reads the rest back from the meta file.
//!
//! `--processes` is an rlimit inside the box: a program that hits it sees
//! `fork` fail and reports whatever it makes of that, so the process ceiling
//! surfaces as the program's own exit status rather than as a limit breach.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::context::ContextInfo;
use super::meta::{parse_meta, IsolateMeta, IsolateStatus};
use super::Backend;
use crate::config::NetworkPolicy;
use crate::core::{Limit, Phase, ResourceLimits};
use crate::error::EngineError;
use crate::monitor::{RawOutcome, Termination};

/// Box ids run from 0 to `BOX_COUNT - 1`
const BOX_COUNT: u64 = 1000;
const PROBE_BOX: u64 = 0;
/// Mount point of the runner's toolchain environment inside the box
const ENV_MOUNT: &str = "/env";

static USE_CGROUPS: OnceLock<bool> = OnceLock::new();

/// Check if isolate cgroups are available
pub async fn is_cgroups_available() -> bool {
    if let Some(value) = USE_CGROUPS.get() {
        return *value;
    }

    let box_id = PROBE_BOX.to_string();
    let probe = Command::new("isolate")
        .args(["--box-id", &box_id, "--cg", "--init"])
        .output()
        .await;
    let _ = Command::new("isolate")
        .args(["--box-id", &box_id, "--cg", "--cleanup"])
        .output()
        .await;

    let available = matches!(probe, Ok(r) if r.status.success());
    let _ = USE_CGROUPS.set(available);
    available
}

/// Box ids held by live contexts. An id returns to the pool only after its
/// box has been cleaned up.
#[derive(Debug, Default)]
struct BoxPool {
    used: HashSet<u64>,
    by_context: HashMap<u64, u64>,
}

impl BoxPool {
    /// Lowest free id for `context`, or the one it already holds
    fn acquire(&mut self, context: u64) -> Option<u64> {
        if let Some(&id) = self.by_context.get(&context) {
            return Some(id);
        }
        let id = (0..BOX_COUNT).find(|id| *id != PROBE_BOX && !self.used.contains(id))?;
        self.used.insert(id);
        self.by_context.insert(context, id);
        Some(id)
    }

    fn get(&self, context: u64) -> Option<u64> {
        self.by_context.get(&context).copied()
    }

    fn release(&mut self, context: u64) -> Option<u64> {
        let id = self.by_context.remove(&context)?;
        self.used.remove(&id);
        Some(id)
    }
}

pub struct IsolateBackend {
    share_net: bool,
    boxes: Mutex<BoxPool>,
}

impl IsolateBackend {
    /// Requires isolate with cgroup support. Isolate always runs programs in a
    /// private network namespace, so only `Allow` changes anything.
    pub async fn with_policy(policy: NetworkPolicy) -> crate::error::Result<Self> {
        if !is_cgroups_available().await {
            return Err(EngineError::Config(
                "isolate with cgroup support is required but not available".into(),
            ));
        }
        let share_net = policy == NetworkPolicy::Allow;
        info!("Isolate backend (network shared: {})", share_net);

        Ok(Self {
            share_net,
            boxes: Mutex::new(BoxPool::default()),
        })
    }

    fn acquire_box(&self, ctx: &ContextInfo) -> Result<u64> {
        let mut boxes = self.boxes.lock().map_err(|_| anyhow!("Box pool poisoned"))?;
        boxes
            .acquire(ctx.id)
            .with_context(|| format!("All {} isolate boxes are in use", BOX_COUNT - 1))
    }

    fn box_id(&self, ctx: &ContextInfo) -> Result<u64> {
        self.boxes
            .lock()
            .ok()
            .and_then(|boxes| boxes.get(ctx.id))
            .with_context(|| format!("Sandbox {} has no isolate box", ctx.id))
    }

    fn meta_path(box_id: u64) -> PathBuf {
        PathBuf::from(format!("/tmp/coderun_isolate_meta_{}.txt", box_id))
    }

    fn release_box(&self, ctx: &ContextInfo) -> Option<u64> {
        self.boxes
            .lock()
            .map(|mut boxes| boxes.release(ctx.id))
            .unwrap_or(None)
    }
}

/// Arguments for `isolate --run` executing `argv`
pub fn run_args(
    box_id: u64,
    argv: &[String],
    limits: &ResourceLimits,
    stdin: Option<&str>,
    environment: Option<&str>,
    share_net: bool,
) -> Vec<String> {
    let cpu_secs = limits.cpu_time_ms as f64 / 1000.0;
    // The monitor owns wall time; isolate's own wall limit is only a backstop
    let wall_secs = limits.wall_time_ms as f64 / 1000.0 + 1.0;

    let mut args = vec![
        "--box-id".to_string(),
        box_id.to_string(),
        "--silent".to_string(),
        "--cg".to_string(),
        format!("--cg-mem={}", limits.memory_bytes.div_ceil(1024)),
        format!("--time={}", cpu_secs),
        format!("--wall-time={}", wall_secs),
        format!("--meta={}", IsolateBackend::meta_path(box_id).display()),
        format!("--processes={}", limits.processes),
        "--open-files=256".to_string(),
        "--fsize=262144".to_string(),
        "--dir=/usr".to_string(),
        "--dir=/lib".to_string(),
        "--dir=/lib64:maybe".to_string(),
        "--dir=/etc:noexec".to_string(),
        "--env=HOME=/box".to_string(),
        "--env=LANG=C.UTF-8".to_string(),
    ];

    match environment {
        Some(env) => {
            args.push(format!("--dir={}={}", ENV_MOUNT, env));
            args.push(format!(
                "--env=PATH={}/bin:/usr/local/bin:/usr/bin:/bin",
                ENV_MOUNT
            ));
        }
        None => args.push("--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string()),
    }
    if let Some(name) = stdin {
        args.push(format!("--stdin={}", name));
    }
    if share_net {
        args.push("--share-net".to_string());
    }

    args.push("--run".to_string());
    args.push("--".to_string());

    // Prepend /usr/bin/ to the command if it's not an absolute path
    let mut cmd_iter = argv.iter();
    if let Some(cmd) = cmd_iter.next() {
        if cmd.starts_with('/') || cmd.starts_with("./") {
            args.push(cmd.clone());
        } else {
            args.push(format!("/usr/bin/{}", cmd));
        }
        args.extend(cmd_iter.cloned());
    }

    args
}

/// Fold isolate's accounting into the monitor's outcome
pub fn apply_meta(meta: &IsolateMeta, limits: &ResourceLimits, raw: &mut RawOutcome) -> Result<()> {
    raw.cpu_time = meta.time;
    raw.peak_memory_bytes = meta.memory_kb.saturating_mul(1024);

    let memory_hit = meta.oom_killed
        || (meta.status != IsolateStatus::Ok && raw.peak_memory_bytes >= limits.memory_bytes);

    raw.termination = match meta.status {
        _ if memory_hit => Termination::LimitExceeded(Limit::Memory),
        IsolateStatus::TimeOut if meta.time >= limits.cpu_time() => {
            Termination::LimitExceeded(Limit::CpuTime)
        }
        IsolateStatus::TimeOut => Termination::LimitExceeded(Limit::WallTime),
        IsolateStatus::Signal(sig) => Termination::Signaled(sig),
        IsolateStatus::Ok | IsolateStatus::RuntimeError => Termination::Exited(meta.exit_code),
        IsolateStatus::InternalError => anyhow::bail!(
            "isolate internal error: {}",
            meta.message.as_deref().unwrap_or("unknown")
        ),
    };

    Ok(())
}

/// Copy a directory tree into `dest`
async fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target)
                    .await
                    .with_context(|| format!("Failed to copy {:?} to {:?}", entry.path(), target))?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Backend for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn init(&self, ctx: &ContextInfo) -> Result<()> {
        let box_id = self.acquire_box(ctx)?.to_string();

        // Clean up any existing box
        let _ = Command::new("isolate")
            .args(["--box-id", &box_id, "--cg", "--cleanup"])
            .output()
            .await;

        let output = Command::new("isolate")
            .args(["--box-id", &box_id, "--cg", "--init"])
            .output()
            .await
            .context("Failed to run isolate --init")?;
        if !output.status.success() {
            anyhow::bail!(
                "Failed to initialize isolate box: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        copy_tree(&ctx.workspace, &box_path.join("box")).await?;

        debug!("Initialized isolate box {} at {}", box_id, box_path.display());
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
        let args = run_args(
            self.box_id(ctx)?,
            argv,
            limits,
            stdin,
            ctx.environment.as_deref(),
            self.share_net,
        );
        debug!("Running isolate with args: {:?}", args);

        let mut command = Command::new("isolate");
        command.args(&args).stdin(Stdio::null());
        Ok(command)
    }

    fn samples_usage(&self) -> bool {
        false
    }

    async fn finish(
        &self,
        ctx: &ContextInfo,
        _phase: Phase,
        limits: &ResourceLimits,
        raw: &mut RawOutcome,
    ) -> Result<()> {
        let meta_path = Self::meta_path(self.box_id(ctx)?);

        if raw.termination.is_forced() {
            // The keeper was killed mid-run; tear the box down so nothing lingers
            let _ = fs::remove_file(&meta_path).await;
            return self.cleanup(ctx).await;
        }

        let content = fs::read_to_string(&meta_path)
            .await
            .with_context(|| format!("Failed to read {}", meta_path.display()))?;
        let _ = fs::remove_file(&meta_path).await;

        apply_meta(&parse_meta(&content), limits, raw)
    }

    async fn cleanup(&self, ctx: &ContextInfo) -> Result<()> {
        // Released up front; a failed cleanup is redone by the next --init
        let Some(box_id) = self.release_box(ctx) else {
            return Ok(());
        };

        let output = Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--cg", "--cleanup"])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "isolate --cleanup failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!("Cleaned up isolate box {}", box_id);
        Ok(())
    }

    fn cleanup_blocking(&self, ctx: &ContextInfo) {
        let Some(box_id) = self.release_box(ctx) else {
            return;
        };
        let box_id = box_id.to_string();
        if let Err(e) = std::process::Command::new("isolate")
            .args(["--box-id", &box_id, "--cg", "--cleanup"])
            .output()
        {
            warn!("Failed to clean up isolate box {}: {}", box_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw() -> RawOutcome {
        RawOutcome {
            termination: Termination::Exited(1),
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            wall_time: Duration::from_millis(50),
            cpu_time: Duration::ZERO,
            peak_memory_bytes: 0,
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_run_args() {
        let args = run_args(
            7,
            &argv(&["python3", "main.py"]),
            &ResourceLimits::RUN_DEFAULT,
            Some("stdin.txt"),
            Some("/opt/envs/py311"),
            false,
        );

        assert_eq!(&args[..2], ["--box-id", "7"]);
        assert!(args.contains(&"--cg-mem=131072".to_string()));
        assert!(args.contains(&"--time=5".to_string()));
        assert!(args.contains(&"--wall-time=11".to_string()));
        assert!(args.contains(&"--processes=64".to_string()));
        assert!(args.contains(&"--stdin=stdin.txt".to_string()));
        assert!(args.contains(&"--dir=/env=/opt/envs/py311".to_string()));
        assert!(!args.contains(&"--share-net".to_string()));
        assert_eq!(&args[args.len() - 3..], ["--", "/usr/bin/python3", "main.py"]);
    }

    #[test]
    fn test_run_args_keeps_box_relative_program() {
        let args = run_args(1, &argv(&["./main"]), &ResourceLimits::RUN_DEFAULT, None, None, true);

        assert!(args.contains(&"--share-net".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--stdin")));
        assert_eq!(args.last().map(String::as_str), Some("./main"));
    }

    #[test]
    fn test_apply_meta_exit() {
        let mut outcome = raw();
        let meta = parse_meta("time:0.120\ncg-mem:2048\nexitcode:3\nstatus:RE\n");
        apply_meta(&meta, &ResourceLimits::RUN_DEFAULT, &mut outcome).unwrap();

        assert_eq!(outcome.termination, Termination::Exited(3));
        assert_eq!(outcome.cpu_time, Duration::from_millis(120));
        assert_eq!(outcome.peak_memory_bytes, 2048 * 1024);
    }

    #[test]
    fn test_apply_meta_timeouts() {
        let limits = ResourceLimits::RUN_DEFAULT;

        let mut outcome = raw();
        apply_meta(&parse_meta("time:5.010\nstatus:TO\n"), &limits, &mut outcome).unwrap();
        assert_eq!(outcome.termination, Termination::LimitExceeded(Limit::CpuTime));

        let mut outcome = raw();
        apply_meta(&parse_meta("time:0.010\nstatus:TO\n"), &limits, &mut outcome).unwrap();
        assert_eq!(outcome.termination, Termination::LimitExceeded(Limit::WallTime));
    }

    #[test]
    fn test_apply_meta_memory_wins() {
        let mut outcome = raw();
        let meta = parse_meta("time:6.0\nstatus:SG\nexitsig:9\ncg-oom-killed:1\ncg-mem:131072\n");
        apply_meta(&meta, &ResourceLimits::RUN_DEFAULT, &mut outcome).unwrap();

        assert_eq!(outcome.termination, Termination::LimitExceeded(Limit::Memory));
    }

    #[test]
    fn test_apply_meta_fork_failure_is_program_status() {
        // A process-limited program sees fork fail and exits on its own
        let mut outcome = raw();
        let meta = parse_meta("time:0.004\ncg-mem:512\nexitcode:2\nstatus:RE\n");
        apply_meta(&meta, &ResourceLimits::RUN_DEFAULT, &mut outcome).unwrap();

        assert_eq!(outcome.termination, Termination::Exited(2));
    }

    #[test]
    fn test_box_pool_never_shares_live_ids() {
        let mut pool = BoxPool::default();

        let first = pool.acquire(0).unwrap();
        let second = pool.acquire(BOX_COUNT).unwrap();
        assert_ne!(first, PROBE_BOX);
        assert_ne!(first, second);
        assert_eq!(pool.acquire(0), Some(first));
        assert_eq!(pool.get(BOX_COUNT), Some(second));

        assert_eq!(pool.release(0), Some(first));
        assert_eq!(pool.release(0), None);
        assert_eq!(pool.get(0), None);
        assert_eq!(pool.acquire(7), Some(first));
    }

    #[test]
    fn test_box_pool_exhaustion() {
        let mut pool = BoxPool::default();
        for context in 0..BOX_COUNT - 1 {
            assert!(pool.acquire(context).is_some());
        }
        assert_eq!(pool.acquire(BOX_COUNT), None);

        pool.release(3);
        assert!(pool.acquire(BOX_COUNT).is_some());
    }

    #[test]
    fn test_apply_meta_internal_error() {
        let mut outcome = raw();
        let meta = parse_meta("status:XX\nmessage:cannot mount\n");
        assert!(apply_meta(&meta, &ResourceLimits::RUN_DEFAULT, &mut outcome).is_err());
    }

    #[tokio::test]
    async fn test_copy_tree() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("pkg/sub")).unwrap();
        std::fs::write(source.path().join("main.py"), "print(1)").unwrap();
        std::fs::write(source.path().join("pkg/sub/mod.py"), "x = 1").unwrap();

        copy_tree(source.path(), &dest.path().join("box")).await.unwrap();

        let copied = dest.path().join("box");
        assert_eq!(std::fs::read_to_string(copied.join("main.py")).unwrap(), "print(1)");
        assert_eq!(
            std::fs::read_to_string(copied.join("pkg/sub/mod.py")).unwrap(),
            "x = 1"
        );
    }
}
