//! Sandbox context - one live, exclusively owned isolated environment
//!
//! Teardown runs exactly once: explicitly through [`SandboxContext::teardown`],
//! or from `Drop` when the owning job is dropped mid-flight.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::unistd::Pid;
use tempfile::TempDir;
use tracing::{info, warn};

use super::Backend;
use crate::monitor::kill_tree;

/// Backend-visible facts about a context
#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub id: u64,
    /// Host directory holding the materialised submission
    pub workspace: PathBuf,
    /// Toolchain environment reference from the runner descriptor
    pub environment: Option<String>,
}

pub struct SandboxContext {
    info: ContextInfo,
    backend: Arc<dyn Backend>,
    workspace: Option<TempDir>,
    /// Root of the phase currently executing, if any
    live_root: Option<Pid>,
    active: Arc<AtomicUsize>,
    torn_down: bool,
}

impl SandboxContext {
    pub(super) fn new(
        id: u64,
        workspace: TempDir,
        environment: Option<String>,
        backend: Arc<dyn Backend>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            info: ContextInfo {
                id,
                workspace: workspace.path().to_path_buf(),
                environment,
            },
            backend,
            workspace: Some(workspace),
            live_root: None,
            active,
            torn_down: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    /// Host path of the sandbox root
    pub fn workspace(&self) -> &Path {
        &self.info.workspace
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub(super) fn set_live_root(&mut self, root: Option<Pid>) {
        self.live_root = root;
    }

    /// Kill everything still running, release backend resources and remove
    /// the workspace. Calling it again is a no-op.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(root) = self.live_root.take() {
            kill_tree(root);
        }
        if let Err(e) = self.backend.cleanup(&self.info).await {
            warn!("Failed to clean up sandbox {}: {:#}", self.info.id, e);
        }
        if let Some(workspace) = self.workspace.take() {
            if let Err(e) = workspace.close() {
                warn!(
                    "Failed to remove workspace {}: {}",
                    self.info.workspace.display(),
                    e
                );
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        info!("Tore down sandbox {} ({})", self.info.id, self.backend.name());
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        warn!(
            "Sandbox {} dropped without teardown; cleaning up synchronously",
            self.info.id
        );
        if let Some(root) = self.live_root.take() {
            kill_tree(root);
        }
        self.backend.cleanup_blocking(&self.info);
        // TempDir removes the directory on drop
        self.workspace.take();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("info", &self.info)
            .field("backend", &self.backend.name())
            .field("live_root", &self.live_root)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}
