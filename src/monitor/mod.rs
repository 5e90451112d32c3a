//! Execution monitor
//!
//! Supervises one running process tree: captures its output, samples its
//! resource usage and terminates every process below the root when a ceiling
//! is breached or the job is cancelled.

pub mod procfs;

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::core::{Limit, ResourceLimits};
pub use procfs::Usage;

/// Upper bound on reading leftover pipe data once the tree is gone
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);
/// Passes over the tree when killing it; each pass catches late forks
const KILL_PASSES: usize = 8;

/// How a supervised process tree ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this code
    Exited(i32),
    /// Died from a signal it was not sent by the monitor
    Signaled(i32),
    /// Killed by the monitor because a ceiling was breached
    LimitExceeded(Limit),
    /// Killed by the monitor because the job was cancelled
    Cancelled,
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Termination::Exited(code),
            (None, Some(sig)) => Termination::Signaled(sig),
            (None, None) => Termination::Exited(-1),
        }
    }

    /// Whether the monitor killed the tree
    pub fn is_forced(&self) -> bool {
        matches!(self, Termination::LimitExceeded(_) | Termination::Cancelled)
    }
}

/// Raw outcome of one phase, before classification
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub peak_memory_bytes: u64,
}

impl RawOutcome {
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }
}

/// First breached ceiling, in priority order (memory > output > processes
/// > cpu time > wall time).
pub fn first_breach(
    usage: &Usage,
    output_overflowed: bool,
    elapsed: Duration,
    limits: &ResourceLimits,
) -> Option<Limit> {
    let checks = [
        (Limit::Memory, usage.memory_bytes >= limits.memory_bytes),
        (Limit::Output, output_overflowed),
        (Limit::Processes, usage.processes > limits.processes),
        (Limit::CpuTime, usage.cpu_time >= limits.cpu_time()),
        (Limit::WallTime, elapsed >= limits.wall_time()),
    ];
    checks
        .into_iter()
        .find(|(_, breached)| *breached)
        .map(|(limit, _)| limit)
}

/// Captured stdout/stderr sharing one byte budget
#[derive(Debug)]
struct Capture {
    budget: u64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: bool,
    stderr_truncated: bool,
    /// Output has reached the budget
    full: bool,
}

impl Capture {
    fn new(budget: u64) -> Self {
        Self {
            budget,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            full: false,
        }
    }

    fn kept(&self) -> u64 {
        (self.stdout.len() + self.stderr.len()) as u64
    }

    /// Captured output is at or past the budget
    fn overflowed(&self) -> bool {
        self.full
    }

    fn push(&mut self, stream: Stream, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let room = self.budget.saturating_sub(self.kept()) as usize;
        let take = data.len().min(room);
        let (buf, truncated) = match stream {
            Stream::Stdout => (&mut self.stdout, &mut self.stdout_truncated),
            Stream::Stderr => (&mut self.stderr, &mut self.stderr_truncated),
        };
        buf.extend_from_slice(&data[..take]);
        if take < data.len() {
            *truncated = true;
        }
        if self.kept() >= self.budget {
            self.full = true;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Running maxima over the samples of one execution
#[derive(Debug, Default)]
struct Peak {
    current: Usage,
    cpu_time: Duration,
    memory_bytes: u64,
}

impl Peak {
    fn record(&mut self, usage: Usage) {
        self.current = usage;
        self.cpu_time = self.cpu_time.max(usage.cpu_time);
        self.memory_bytes = self.memory_bytes.max(usage.memory_bytes);
    }

    /// Usage as seen by limit checks: monotonic CPU, current memory and processes
    fn observed(&self) -> Usage {
        Usage {
            cpu_time: self.cpu_time,
            memory_bytes: self.current.memory_bytes,
            processes: self.current.processes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Monitor {
    sample_interval: Duration,
}

impl Monitor {
    pub fn new(sample_interval: Duration) -> Self {
        Self { sample_interval }
    }

    /// Supervise the tree rooted at `child` until the root exits, a ceiling is
    /// breached or the job is cancelled. The root is a process-group leader
    /// that does not count toward usage: the native keeper or the isolate
    /// launcher. With `sampling` off only wall time, output size and
    /// cancellation are enforced here; the backend accounts for the rest.
    pub async fn supervise(
        &self,
        mut child: Child,
        limits: &ResourceLimits,
        sampling: bool,
        cancel: &mut CancelToken,
    ) -> Result<RawOutcome> {
        let start = Instant::now();
        let pid = child.id().context("Supervised process has no pid")?;
        let root = Pid::from_raw(pid as i32);
        let mut tree = TreeGuard::new(root);

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut capture = Capture::new(limits.output_bytes);
        let mut peak = Peak::default();
        let mut exit: Option<ExitStatus> = None;
        let mut stop: Option<Termination> = None;

        let budget = limits
            .wall_time()
            .min(Duration::from_millis(ResourceLimits::MAX_TIME_MS));
        let wall = sleep_until(tokio::time::Instant::from_std(start) + budget);
        tokio::pin!(wall);

        let mut ticker = interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];

        while exit.is_none() || stdout.is_some() || stderr.is_some() {
            let mut resample = false;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    stop = Some(Termination::Cancelled);
                    break;
                }
                status = child.wait(), if exit.is_none() => {
                    exit = Some(status.context("Failed to wait for supervised process")?);
                    tree.reaped();
                }
                read = read_from(&mut stdout, &mut out_buf) => match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => {
                        capture.push(Stream::Stdout, &out_buf[..n]);
                        resample = capture.overflowed();
                    }
                },
                read = read_from(&mut stderr, &mut err_buf) => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => {
                        capture.push(Stream::Stderr, &err_buf[..n]);
                        resample = capture.overflowed();
                    }
                },
                _ = ticker.tick(), if sampling && exit.is_none() => {
                    peak.record(procfs::sample_tree(root.as_raw()));
                }
                _ = &mut wall => {
                    resample = true;
                }
            }

            if resample && sampling && exit.is_none() {
                peak.record(procfs::sample_tree(root.as_raw()));
            }

            if let Some(limit) =
                first_breach(&peak.observed(), capture.overflowed(), start.elapsed(), limits)
            {
                debug!(
                    "Process tree {} breached {} limit after {:?}",
                    root,
                    limit,
                    start.elapsed()
                );
                stop = Some(Termination::LimitExceeded(limit));
                break;
            }
        }

        let wall_time = start.elapsed().min(match stop {
            Some(Termination::LimitExceeded(Limit::WallTime)) => limits.wall_time(),
            _ => Duration::MAX,
        });

        tree.kill();
        if exit.is_none() {
            exit = Some(
                child
                    .wait()
                    .await
                    .context("Failed to reap supervised process")?,
            );
            tree.reaped();
        }

        if !matches!(stop, Some(Termination::LimitExceeded(Limit::Output))) {
            drain(&mut stdout, Stream::Stdout, &mut capture).await;
            drain(&mut stderr, Stream::Stderr, &mut capture).await;
        }

        let termination = match (stop, exit) {
            (Some(forced), _) => forced,
            (None, Some(status)) => Termination::from_status(status),
            (None, None) => anyhow::bail!("Supervised process vanished without exit status"),
        };

        Ok(RawOutcome {
            termination,
            stdout: capture.stdout,
            stderr: capture.stderr,
            stdout_truncated: capture.stdout_truncated,
            stderr_truncated: capture.stderr_truncated,
            wall_time,
            cpu_time: peak.cpu_time,
            peak_memory_bytes: peak.memory_bytes,
        })
    }
}

/// SIGKILL every process in the group; a group that is already gone is fine.
fn kill_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

/// SIGKILL every descendant of `root`, then the root's process group.
///
/// Descendants go first so that a keeper root is still alive to hold on to
/// orphans while they are being killed. Processes that cannot be signalled
/// (isolate's boxed uid) are left to the backend's cleanup.
pub fn kill_tree(root: Pid) {
    for _ in 0..KILL_PASSES {
        let members = procfs::live_descendants(root.as_raw());
        if members.is_empty() {
            break;
        }
        for pid in members {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
                Err(e) => warn!("Failed to kill process {}: {}", pid, e),
            }
        }
    }
    kill_group(root);
}

/// Kills the supervised tree if supervision ends before the root is reaped,
/// including when the supervising future is dropped. Once the root is reaped
/// its pid may be reused, so the guard disarms.
#[derive(Debug)]
struct TreeGuard {
    root: Option<Pid>,
}

impl TreeGuard {
    fn new(root: Pid) -> Self {
        Self { root: Some(root) }
    }

    fn kill(&mut self) {
        if let Some(root) = self.root {
            kill_tree(root);
        }
    }

    fn reaped(&mut self) {
        self.root = None;
    }
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn read_from<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut Option<R>, stream: Stream, capture: &mut Capture) {
    let Some(r) = reader.as_mut() else {
        return;
    };
    let mut buf = [0u8; 8192];
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, r.read(&mut buf)).await {
        if n == 0 {
            break;
        }
        capture.push(stream, &buf[..n]);
    }
    *reader = None;
}
