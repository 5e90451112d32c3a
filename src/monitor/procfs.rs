//! Process-tree accounting from /proc
//!
//! Sums CPU time, resident memory and live process count over every
//! descendant of a root process, found by following parent links.

use std::collections::HashMap;
use std::fs;
use std::sync::OnceLock;
use std::time::Duration;

use nix::unistd::{sysconf, SysconfVar};

/// Point-in-time usage of one process tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub cpu_time: Duration,
    pub memory_bytes: u64,
    pub processes: u32,
}

/// Fields of /proc/<pid>/stat the monitor cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub ppid: i32,
    pub pgrp: i32,
    /// utime + stime + cutime + cstime, in clock ticks
    pub cpu_ticks: u64,
    pub rss_pages: u64,
}

impl ProcStat {
    pub fn is_live(&self) -> bool {
        self.state != 'Z' && self.state != 'X'
    }
}

/// Parse the contents of /proc/<pid>/stat.
///
/// The command name (field 2) may contain spaces and parentheses, so fields
/// are counted from the last ')'.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) of proc(5)
    let field = |n: usize| fields.get(n - 3).copied();

    let state = field(3)?.chars().next()?;
    let ppid = field(4)?.parse().ok()?;
    let pgrp = field(5)?.parse().ok()?;
    let mut cpu_ticks = 0u64;
    for n in 14..=17 {
        let ticks: i64 = field(n)?.parse().ok()?;
        cpu_ticks += ticks.max(0) as u64;
    }
    let rss_pages: i64 = field(24)?.parse().ok()?;

    Some(ProcStat {
        state,
        ppid,
        pgrp,
        cpu_ticks,
        rss_pages: rss_pages.max(0) as u64,
    })
}

/// Every readable process on the host, keyed by pid
pub fn snapshot() -> HashMap<i32, ProcStat> {
    let mut processes = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return processes;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // Processes may exit between listing and reading
        let Ok(content) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        if let Some(stat) = parse_stat(&content) {
            processes.insert(pid, stat);
        }
    }
    processes
}

/// Pids below `root` (not including it), parents before children
pub fn descendants(processes: &HashMap<i32, ProcStat>, root: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for (&pid, stat) in processes {
        children.entry(stat.ppid).or_default().push(pid);
    }

    let mut found = Vec::new();
    let mut pending = vec![root];
    while let Some(parent) = pending.pop() {
        if let Some(kids) = children.get(&parent) {
            for &kid in kids {
                // A pid recycled mid-snapshot can close a loop
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    pending.push(kid);
                }
            }
        }
    }
    found
}

/// Live descendants of `root`
pub fn live_descendants(root: i32) -> Vec<i32> {
    let processes = snapshot();
    descendants(&processes, root)
        .into_iter()
        .filter(|pid| processes.get(pid).is_some_and(ProcStat::is_live))
        .collect()
}

/// Sample the tree under `root`.
///
/// The root itself is a keeper or launcher: only its CPU counts, which
/// includes every descendant it has already reaped.
pub fn sample_tree(root: i32) -> Usage {
    let processes = snapshot();

    let mut ticks = processes.get(&root).map_or(0, |stat| stat.cpu_ticks);
    let mut pages = 0u64;
    let mut live = 0u32;

    for pid in descendants(&processes, root) {
        let Some(stat) = processes.get(&pid) else {
            continue;
        };
        ticks += stat.cpu_ticks;
        pages += stat.rss_pages;
        if stat.is_live() {
            live += 1;
        }
    }

    Usage {
        cpu_time: ticks_to_duration(ticks),
        memory_bytes: pages * page_size(),
        processes: live,
    }
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_millis(ticks.saturating_mul(1000) / clock_ticks())
}

fn clock_ticks() -> u64 {
    static CLK_TCK: OnceLock<u64> = OnceLock::new();
    *CLK_TCK.get_or_init(|| sysconf_u64(SysconfVar::CLK_TCK).unwrap_or(100))
}

fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| sysconf_u64(SysconfVar::PAGE_SIZE).unwrap_or(4096))
}

fn sysconf_u64(var: SysconfVar) -> Option<u64> {
    match sysconf(var) {
        Ok(Some(v)) if v > 0 => u64::try_from(v).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat() {
        let content = "4242 (python3) S 4200 4242 4242 0 -1 4194560 1234 0 0 0 \
                       150 50 7 3 20 0 1 0 100000 123456789 2048 18446744073709551615";
        let stat = parse_stat(content).unwrap();

        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 4200);
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.cpu_ticks, 150 + 50 + 7 + 3);
        assert_eq!(stat.rss_pages, 2048);
    }

    #[test]
    fn test_parse_stat_hostile_comm() {
        let content = "77 (a) b) Z 1 99 99 0 -1 0 0 0 0 0 1 2 0 0 20 0 1 0 5 0 0 0";
        let stat = parse_stat(content).unwrap();

        assert_eq!(stat.state, 'Z');
        assert!(!stat.is_live());
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 99);
        assert_eq!(stat.cpu_ticks, 3);
        assert_eq!(stat.rss_pages, 0);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("12 (sh) R 1 12").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    fn stat(ppid: i32, state: char) -> ProcStat {
        ProcStat {
            state,
            ppid,
            pgrp: 0,
            cpu_ticks: 0,
            rss_pages: 0,
        }
    }

    #[test]
    fn test_descendants_follow_parent_links() {
        // 10 -> 11 -> 12, 10 -> 13; 20 is unrelated
        let processes = HashMap::from([
            (10, stat(1, 'S')),
            (11, stat(10, 'S')),
            (12, stat(11, 'R')),
            (13, stat(10, 'Z')),
            (20, stat(1, 'S')),
        ]);

        let mut found = descendants(&processes, 10);
        found.sort();
        assert_eq!(found, vec![11, 12, 13]);
        assert!(descendants(&processes, 12).is_empty());
    }

    #[test]
    fn test_sample_tree_counts_children() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();

        let usage = sample_tree(std::process::id() as i32);
        let live = live_descendants(std::process::id() as i32);
        child.kill().unwrap();
        child.wait().unwrap();

        assert!(usage.processes >= 1);
        assert!(usage.memory_bytes > 0);
        assert!(live.contains(&(child.id() as i32)));
    }
}
