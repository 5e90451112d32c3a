//! Sandbox controller
//!
//! Provisions an isolated context per submission, runs one phase at a time
//! inside it under the execution monitor, and tears it down.
//!
//! The isolation primitive itself lives behind [`Backend`]:
//! - `NativeBackend`: keeper-held process trees, rlimits, user+network namespaces
//! - `IsolateBackend`: the `isolate` sandbox (cgroups, namespaces)
//!
//! The sandbox module does NOT:
//! - Classify outcomes (that's the collector's job)
//! - Know about queues or concurrency ceilings

pub mod context;
pub mod isolate;
pub mod keeper;
pub mod meta;
pub mod native;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::unistd::Pid;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{BackendKind, EngineConfig};
use crate::core::{Phase, ResourceLimits, RunnerDescriptor, Submission, STDIN_FILE};
use crate::monitor::{Monitor, RawOutcome};

pub use context::{ContextInfo, SandboxContext};
pub use isolate::IsolateBackend;
pub use native::NativeBackend;

/// Isolation primitive used by the controller
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare backend resources once the workspace is populated
    async fn init(&self, ctx: &ContextInfo) -> Result<()>;

    /// Command running `argv` for one phase. `stdin` names a file in the
    /// sandbox root; `None` means no input. Output piping and process-group
    /// placement are applied by the controller.
    fn command(
        &self,
        ctx: &ContextInfo,
        phase: Phase,
        argv: &[String],
        limits: &ResourceLimits,
        stdin: Option<&str>,
    ) -> Result<Command>;

    /// Whether the monitor should sample CPU/memory/processes itself
    fn samples_usage(&self) -> bool;

    /// Merge backend-side accounting into the monitor's outcome
    async fn finish(
        &self,
        ctx: &ContextInfo,
        phase: Phase,
        limits: &ResourceLimits,
        raw: &mut RawOutcome,
    ) -> Result<()>;

    /// Release backend resources; must tolerate repeated calls
    async fn cleanup(&self, ctx: &ContextInfo) -> Result<()>;

    /// Synchronous variant of `cleanup`, for drop paths
    fn cleanup_blocking(&self, ctx: &ContextInfo);
}

pub struct SandboxController {
    backend: Arc<dyn Backend>,
    workspace_root: PathBuf,
    monitor: Monitor,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl SandboxController {
    pub fn new(backend: Arc<dyn Backend>, workspace_root: impl Into<PathBuf>, monitor: Monitor) -> Self {
        Self {
            backend,
            workspace_root: workspace_root.into(),
            monitor,
            next_id: AtomicU64::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Controller with the backend selected by configuration
    pub async fn from_config(config: &EngineConfig) -> crate::error::Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Native => Arc::new(NativeBackend::with_policy(config.network)?),
            BackendKind::Isolate => Arc::new(IsolateBackend::with_policy(config.network).await?),
        };
        info!("Using {} sandbox backend", backend.name());

        Ok(Self::new(
            backend,
            &config.workspace_root,
            Monitor::new(config.sample_interval),
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of sandbox contexts currently alive
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Create an isolated root holding only the submission's files and stdin
    pub async fn provision(
        &self,
        descriptor: &RunnerDescriptor,
        submission: &Submission,
    ) -> Result<SandboxContext> {
        fs::create_dir_all(&self.workspace_root)
            .await
            .with_context(|| {
                format!(
                    "Failed to create workspace root {}",
                    self.workspace_root.display()
                )
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let workspace = tempfile::Builder::new()
            .prefix(&format!("coderun-{}-", id))
            .tempdir_in(&self.workspace_root)
            .context("Failed to create sandbox workspace")?;

        let mut ctx = SandboxContext::new(
            id,
            workspace,
            descriptor.environment.clone(),
            self.backend.clone(),
            self.active.clone(),
        );

        let prepared = async {
            materialize(ctx.workspace(), descriptor, submission).await?;
            self.backend.init(ctx.info()).await
        }
        .await;

        if let Err(e) = prepared {
            ctx.teardown().await;
            return Err(e);
        }

        debug!(
            "Provisioned sandbox {} at {}",
            ctx.id(),
            ctx.workspace().display()
        );
        Ok(ctx)
    }

    /// Run one phase inside `ctx`, blocking until it exits, breaches a
    /// ceiling, or `cancel` fires
    pub async fn execute(
        &self,
        ctx: &mut SandboxContext,
        phase: Phase,
        argv: &[String],
        limits: &ResourceLimits,
        cancel: &mut CancelToken,
    ) -> Result<RawOutcome> {
        anyhow::ensure!(!ctx.is_torn_down(), "Sandbox {} already torn down", ctx.id());
        anyhow::ensure!(!argv.is_empty(), "Empty {} command", phase);

        // Input is only for the program itself, never for the compiler
        let stdin = match phase {
            Phase::Build => None,
            Phase::Run => Some(STDIN_FILE),
        };

        let mut command = self
            .backend
            .command(ctx.info(), phase, argv, limits, stdin)?;
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        debug!("Sandbox {} {} phase: {:?}", ctx.id(), phase, argv);

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {} command {:?}", phase, argv[0]))?;
        let root = child.id().map(|pid| Pid::from_raw(pid as i32));
        ctx.set_live_root(root);

        let mut raw = self
            .monitor
            .supervise(child, limits, self.backend.samples_usage(), cancel)
            .await?;
        ctx.set_live_root(None);

        self.backend
            .finish(ctx.info(), phase, limits, &mut raw)
            .await?;

        Ok(raw)
    }

    /// Idempotent; also runs automatically when a context is dropped
    pub async fn teardown(&self, ctx: &mut SandboxContext) {
        ctx.teardown().await;
    }
}

/// Write source files and stdin into the sandbox root
async fn materialize(root: &Path, descriptor: &RunnerDescriptor, submission: &Submission) -> Result<()> {
    let named: Vec<&str> = submission
        .files
        .iter()
        .filter_map(|f| f.path.as_deref())
        .collect();

    for file in &submission.files {
        let rel = match &file.path {
            Some(path) => path.as_str(),
            None => {
                anyhow::ensure!(
                    !named.contains(&descriptor.source_file.as_str()),
                    "Unnamed source collides with {}",
                    descriptor.source_file
                );
                descriptor.source_file.as_str()
            }
        };

        let dest = root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest, &file.content)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
    }

    fs::write(root.join(STDIN_FILE), &submission.stdin)
        .await
        .context("Failed to write stdin")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel;
    use crate::config::NetworkPolicy;
    use crate::monitor::Termination;
    use std::time::Duration;

    fn controller(root: &Path) -> SandboxController {
        let backend = NativeBackend::with_policy(NetworkPolicy::Allow).unwrap();
        SandboxController::new(Arc::new(backend), root, Monitor::new(Duration::from_millis(10)))
    }

    fn running_with_arg(arg: &str) -> bool {
        crate::monitor::procfs::snapshot()
            .into_iter()
            .any(|(pid, stat)| {
                stat.is_live()
                    && std::fs::read(format!("/proc/{}/cmdline", pid))
                        .map(|cmdline| cmdline.split(|b| *b == 0).any(|part| part == arg.as_bytes()))
                        .unwrap_or(false)
            })
    }

    async fn wait_until_gone(arg: &str) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while running_with_arg(arg) {
            if std::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn shell() -> RunnerDescriptor {
        RunnerDescriptor::new("shell", "main.sh", &["/bin/sh", "main.sh"])
    }

    #[tokio::test]
    async fn test_provision_materializes_files() {
        let root = tempfile::tempdir().unwrap();
        let controller = controller(root.path());
        let submission = Submission::new("shell", "echo hi")
            .with_file("lib/util.sh", "x=1")
            .with_stdin("42\n");

        let mut ctx = controller.provision(&shell(), &submission).await.unwrap();
        let ws = ctx.workspace().to_path_buf();

        assert_eq!(std::fs::read_to_string(ws.join("main.sh")).unwrap(), "echo hi");
        assert_eq!(std::fs::read_to_string(ws.join("lib/util.sh")).unwrap(), "x=1");
        assert_eq!(std::fs::read_to_string(ws.join(STDIN_FILE)).unwrap(), "42\n");
        assert_eq!(controller.active(), 1);

        controller.teardown(&mut ctx).await;
        assert!(!ws.exists());
        assert_eq!(controller.active(), 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let controller = controller(root.path());
        let mut ctx = controller
            .provision(&shell(), &Submission::new("shell", "true"))
            .await
            .unwrap();

        controller.teardown(&mut ctx).await;
        controller.teardown(&mut ctx).await;
        drop(ctx);

        assert_eq!(controller.active(), 0);
    }

    #[tokio::test]
    async fn test_drop_reclaims_workspace() {
        let root = tempfile::tempdir().unwrap();
        let controller = controller(root.path());
        let ctx = controller
            .provision(&shell(), &Submission::new("shell", "true"))
            .await
            .unwrap();
        let ws = ctx.workspace().to_path_buf();

        drop(ctx);

        assert!(!ws.exists());
        assert_eq!(controller.active(), 0);
    }

    #[tokio::test]
    async fn test_unnamed_source_collision_fails_provision() {
        let root = tempfile::tempdir().unwrap();
        let controller = controller(root.path());
        let submission = Submission::new("shell", "a").with_file("main.sh", "b");

        assert!(controller.provision(&shell(), &submission).await.is_err());
        assert_eq!(controller.active(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_execute_reads_stdin_in_run_phase_only() {
        let root = tempfile::tempdir().unwrap();
        let controller = controller(root.path());
        let submission = Submission::new("shell", "cat").with_stdin("ping");
        let mut ctx = controller.provision(&shell(), &submission).await.unwrap();
        let argv = shell().run_argv();
        let limits = ResourceLimits::RUN_DEFAULT;

        let build = controller
            .execute(&mut ctx, Phase::Build, &argv, &limits, &mut CancelToken::never())
            .await
            .unwrap();
        assert_eq!(build.termination, Termination::Exited(0));
        assert!(build.stdout.is_empty());

        let run = controller
            .execute(&mut ctx, Phase::Run, &argv, &limits, &mut CancelToken::never())
            .await
            .unwrap();
        assert_eq!(run.stdout, b"ping");

        controller.teardown(&mut ctx).await;
        assert!(controller
            .execute(&mut ctx, Phase::Run, &argv, &limits, &mut CancelToken::never())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancelled_execution_leaves_no_processes() {
        let root = tempfile::tempdir().unwrap();
        let controller = controller(root.path());
        let submission = Submission::new("shell", "sleep 60.0523 & sleep 60.0523; wait");
        let mut ctx = controller.provision(&shell(), &submission).await.unwrap();
        let (handle, mut token) = cancel::pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let raw = controller
            .execute(
                &mut ctx,
                Phase::Run,
                &shell().run_argv(),
                &ResourceLimits {
                    wall_time_ms: 60_000,
                    ..ResourceLimits::RUN_DEFAULT
                },
                &mut token,
            )
            .await
            .unwrap();
        controller.teardown(&mut ctx).await;

        assert_eq!(raw.termination, Termination::Cancelled);
        assert!(raw.wall_time < Duration::from_secs(5));
        assert!(wait_until_gone("60.0523").await);
    }

    #[tokio::test]
    async fn test_detached_process_does_not_outlive_execution() {
        let root = tempfile::tempdir().unwrap();
        let controller = controller(root.path());
        let submission = Submission::new(
            "shell",
            "command -v setsid >/dev/null || exit 0; setsid sleep 42.4242 </dev/null >/dev/null 2>&1 & echo spawned",
        );
        let mut ctx = controller.provision(&shell(), &submission).await.unwrap();

        let raw = controller
            .execute(
                &mut ctx,
                Phase::Run,
                &shell().run_argv(),
                &ResourceLimits::RUN_DEFAULT,
                &mut CancelToken::never(),
            )
            .await
            .unwrap();
        controller.teardown(&mut ctx).await;

        assert_eq!(raw.termination, Termination::Exited(0));
        assert!(wait_until_gone("42.4242").await);
    }
}
