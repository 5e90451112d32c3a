//! Isolate meta file parser
//!
//! Parses the `--meta` file isolate writes after each run.

use std::time::Duration;

/// Run status reported by isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateStatus {
    /// Program exited normally (any exit code)
    Ok,
    /// Time limit exceeded (CPU or wall)
    TimeOut,
    /// Killed by signal
    Signal(i32),
    /// Non-zero exit
    RuntimeError,
    /// Isolate itself failed
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateMeta {
    pub time: Duration,
    pub wall_time: Duration,
    /// Peak memory in KiB (cg-mem or max-rss, whichever is larger)
    pub memory_kb: u64,
    pub exit_code: i32,
    pub status: IsolateStatus,
    /// The cgroup OOM killer fired
    pub oom_killed: bool,
    /// Isolate's human-readable message, if any
    pub message: Option<String>,
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            time: Duration::ZERO,
            wall_time: Duration::ZERO,
            memory_kb: 0,
            exit_code: 0,
            status: IsolateStatus::Ok,
            oom_killed: false,
            message: None,
        }
    }
}

fn seconds(value: &str) -> Option<Duration> {
    value
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status_str = "";
    let mut signal = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Some(t) = seconds(value) {
                    meta.time = t;
                }
            }
            "time-wall" => {
                if let Some(t) = seconds(value) {
                    meta.wall_time = t;
                }
            }
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u64>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "cg-oom-killed" => meta.oom_killed = value == "1",
            "status" => status_str = value,
            "exitcode" => meta.exit_code = value.parse().unwrap_or(0),
            "exitsig" => signal = value.parse::<i32>().ok(),
            "message" => meta.message = Some(value.to_string()),
            _ => {}
        }
    }

    meta.status = match (signal, status_str) {
        (_, "TO") => IsolateStatus::TimeOut,
        (Some(sig), _) => IsolateStatus::Signal(sig),
        (None, "SG") => IsolateStatus::Signal(0),
        (None, "XX") => IsolateStatus::InternalError,
        (None, "RE") => IsolateStatus::RuntimeError,
        (None, _) if meta.exit_code != 0 => IsolateStatus::RuntimeError,
        (None, _) => IsolateStatus::Ok,
    };

    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_success() {
        let content = "time:0.015\ntime-wall:0.020\ncg-mem:1024\nmax-rss:900\nexitcode:0\n";
        let meta = parse_meta(content);

        assert_eq!(meta.time, Duration::from_millis(15));
        assert_eq!(meta.wall_time, Duration::from_millis(20));
        assert_eq!(meta.memory_kb, 1024);
        assert_eq!(meta.exit_code, 0);
        assert_eq!(meta.status, IsolateStatus::Ok);
        assert!(!meta.oom_killed);
    }

    #[test]
    fn test_parse_meta_timeout() {
        let meta = parse_meta("time:1.000\nstatus:TO\nmessage:Time limit exceeded\n");

        assert_eq!(meta.time, Duration::from_secs(1));
        assert_eq!(meta.status, IsolateStatus::TimeOut);
        assert_eq!(meta.message.as_deref(), Some("Time limit exceeded"));
    }

    #[test]
    fn test_parse_meta_signal() {
        let meta = parse_meta("status:SG\nexitsig:11\n");
        assert_eq!(meta.status, IsolateStatus::Signal(11));

        let meta = parse_meta("status:SG\nexitsig:9\ncg-oom-killed:1\n");
        assert_eq!(meta.status, IsolateStatus::Signal(9));
        assert!(meta.oom_killed);
    }

    #[test]
    fn test_parse_meta_exit_code() {
        let meta = parse_meta("status:RE\nexitcode:3\n");
        assert_eq!(meta.status, IsolateStatus::RuntimeError);
        assert_eq!(meta.exit_code, 3);

        assert_eq!(parse_meta("status:XX\n").status, IsolateStatus::InternalError);
        assert_eq!(parse_meta("").status, IsolateStatus::Ok);
    }
}
