//! Per-phase keeper process
//!
//! The native backend never execs a program straight from the spawned child.
//! The child marks itself a child subreaper and forks: the new process goes on
//! to exec the program while the keeper stays behind as its parent. Whatever
//! the program starts remains below the keeper, even after `setsid`, double
//! forks or the death of an intermediate parent, so the monitor can find the
//! whole tree by following parent links from the keeper.
//!
//! Once the program exits the keeper kills and reaps every remaining
//! descendant, then exits with the program's exit code or signal.
//!
//! All of this runs between `fork` and `exec` of a multi-threaded process:
//! plain syscalls only, no allocation, no locks.

use std::fs::File;
use std::io::{self, Read};
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::prctl;
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, getpid, ForkResult, Pid};

/// Children of the calling thread, space separated
const CHILDREN: &str = "/proc/thread-self/children";
const SWEEP_PAUSE: Duration = Duration::from_millis(1);
/// Upper bound for the descriptor sweep when `close_range` is missing
const MAX_FD_SWEEP: i32 = 65_536;

/// Split the calling process into keeper and program. Returns only in the
/// program process; the keeper never returns.
///
/// # Safety
///
/// Must only be called from a `pre_exec` hook, after fork and before exec.
pub unsafe fn split() -> io::Result<()> {
    prctl::set_child_subreaper(true)?;

    match fork()? {
        ForkResult::Child => {
            // A killed keeper takes the program down with it
            prctl::set_pdeathsig(Signal::SIGKILL)?;
            Ok(())
        }
        ForkResult::Parent { child } => keep(child),
    }
}

fn keep(program: Pid) -> ! {
    // Handlers inherited from the engine must not run in the keeper
    // SAFETY: resetting to the default disposition installs no handler
    let _ = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) };
    // The spawner's error pipe and the output pipes belong to the program
    close_all_fds();

    let status = wait_program(program);
    sweep();
    exit_like(status)
}

fn wait_program(program: Pid) -> WaitStatus {
    loop {
        match waitpid(program, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => return status,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return WaitStatus::Exited(program, libc::EXIT_FAILURE),
        }
    }
}

/// Kill and reap descendants until none are left. Orphans are reparented to
/// the keeper, so each pass sees what the previous one uncovered.
fn sweep() {
    loop {
        kill_children();
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(SWEEP_PAUSE),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return,
        }
    }
}

fn kill_children() {
    let Ok(mut file) = File::open(CHILDREN) else {
        return;
    };
    let mut buf = [0u8; 1024];
    let mut pids = PidList::default();
    while let Ok(n) = file.read(&mut buf) {
        if n == 0 {
            break;
        }
        pids.feed(&buf[..n], |pid| {
            let _ = kill(pid, Signal::SIGKILL);
        });
    }
    pids.finish(|pid| {
        let _ = kill(pid, Signal::SIGKILL);
    });
}

/// Incremental parser for whitespace-separated pids split across reads
#[derive(Debug, Default)]
struct PidList {
    current: Option<i32>,
}

impl PidList {
    fn feed(&mut self, bytes: &[u8], mut each: impl FnMut(Pid)) {
        for &b in bytes {
            if b.is_ascii_digit() {
                let digit = i32::from(b - b'0');
                let value = self.current.unwrap_or(0);
                self.current = Some(value.saturating_mul(10).saturating_add(digit));
            } else if let Some(pid) = self.current.take() {
                each(Pid::from_raw(pid));
            }
        }
    }

    fn finish(&mut self, mut each: impl FnMut(Pid)) {
        if let Some(pid) = self.current.take() {
            each(Pid::from_raw(pid));
        }
    }
}

fn close_all_fds() {
    // SAFETY: close_range takes no pointers
    let closed = unsafe { libc::syscall(libc::SYS_close_range, 0u32, u32::MAX, 0u32) };
    if closed == 0 {
        return;
    }
    for fd in 0..MAX_FD_SWEEP {
        let _ = close(fd);
    }
}

fn exit_like(status: WaitStatus) -> ! {
    let code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => {
            // SAFETY: default disposition, no handler code involved
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
            let _ = kill(getpid(), sig);
            128 + sig as i32
        }
        _ => libc::EXIT_FAILURE,
    };
    // SAFETY: _exit skips atexit handlers and stdio flushing
    unsafe { libc::_exit(code) }
}
