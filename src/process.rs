//! Liveness probe for Claude Code processes.
//!
//! Status inference only reports `Stopped` for a stale session whose process is
//! gone, so the monitor periodically asks a probe which working directories
//! have a running `claude` process.

use std::collections::HashSet;
#[cfg(any(target_os = "macos", target_os = "linux"))]
use std::process::Command;

/// Source of running-process working directories.
pub trait ProcessProbe: Send + Sync {
    /// Working directories of running agent processes, or `None` when the
    /// platform is not supported.
    fn active_paths(&self) -> Option<HashSet<String>>;
}

/// Probe backed by `ps` plus `/proc` (Linux) or `lsof` (macOS).
///
/// # Platform Support
/// - **macOS**: via `ps` and `lsof`
/// - **Linux**: via `ps` and `/proc`
/// - **Other**: unsupported (returns `None`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn active_paths(&self) -> Option<HashSet<String>> {
        #[cfg(target_os = "macos")]
        {
            Some(
                get_claude_pids()
                    .into_iter()
                    .filter_map(get_process_cwd_macos)
                    .collect(),
            )
        }

        #[cfg(target_os = "linux")]
        {
            Some(
                get_claude_pids()
                    .into_iter()
                    .filter_map(get_process_cwd_linux)
                    .collect(),
            )
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

/// Probe that reports nothing; used when process tracking is turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl ProcessProbe for NoProbe {
    fn active_paths(&self) -> Option<HashSet<String>> {
        None
    }
}

/// Probe returning a fixed set of paths.
#[derive(Debug, Default, Clone)]
pub struct FixedProbe {
    pub paths: HashSet<String>,
}

impl FixedProbe {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl ProcessProbe for FixedProbe {
    fn active_paths(&self) -> Option<HashSet<String>> {
        Some(self.paths.clone())
    }
}

/// Whether a session with this cwd/project path has a live process.
/// `None` when liveness is unknown.
pub fn is_alive(
    active: Option<&HashSet<String>>,
    cwd: Option<&str>,
    project_path: &str,
) -> Option<bool> {
    let active = active?;
    let hit = cwd.map(|c| active.contains(c)).unwrap_or(false) || active.contains(project_path);
    Some(hit)
}

/// Parse `ps -eo pid,comm` output into PIDs of "claude" processes.
#[cfg_attr(not(any(target_os = "macos", target_os = "linux")), allow(dead_code))]
fn parse_claude_pids(ps_output: &str) -> Vec<u32> {
    ps_output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 && parts[1] == "claude" {
                parts[0].parse::<u32>().ok()
            } else {
                None
            }
        })
        .collect()
}

/// Get PIDs of all running "claude" processes.
#[cfg(any(target_os = "macos", target_os = "linux"))]
fn get_claude_pids() -> Vec<u32> {
    // Use ps which is more reliable than pgrep across systems
    let output = match Command::new("ps").args(["-eo", "pid,comm"]).output() {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!(error = %e, "ps unavailable");
            return Vec::new();
        }
    };
    parse_claude_pids(&String::from_utf8_lossy(&output.stdout))
}

/// Get the current working directory of a process by PID on macOS.
#[cfg(target_os = "macos")]
fn get_process_cwd_macos(pid: u32) -> Option<String> {
    let output = Command::new("lsof")
        .args(["-p", &pid.to_string()])
        .output()
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        if line.contains("cwd") {
            // COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME; NAME may contain spaces
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 9 {
                return Some(parts[8..].join(" "));
            }
        }
    }

    None
}

/// Get the current working directory of a process by PID on Linux.
#[cfg(target_os = "linux")]
fn get_process_cwd_linux(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{}/cwd", pid))
        .ok()
        .and_then(|p| p.to_str().map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_claude_pids() {
        let output = "  PID COMM\n    1 init\n  420 claude\n  421 claude-helper\n  999 claude\n";
        assert_eq!(parse_claude_pids(output), vec![420, 999]);
    }

    #[test]
    fn test_is_alive() {
        let active: HashSet<String> = ["/home/dev/app".to_string()].into_iter().collect();
        assert_eq!(is_alive(None, Some("/home/dev/app"), "/x"), None);
        assert_eq!(is_alive(Some(&active), Some("/home/dev/app"), "/x"), Some(true));
        assert_eq!(is_alive(Some(&active), None, "/home/dev/app"), Some(true));
        assert_eq!(is_alive(Some(&active), Some("/other"), "/other"), Some(false));
    }

    #[test]
    fn test_fixed_and_no_probe() {
        let probe = FixedProbe::new(["/a", "/b"]);
        assert_eq!(probe.active_paths().map(|p| p.len()), Some(2));
        assert!(NoProbe.active_paths().is_none());
    }

    #[test]
    fn test_system_probe_support() {
        let result = SystemProbe.active_paths();

        #[cfg(any(target_os = "macos", target_os = "linux"))]
        assert!(result.is_some());

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        assert!(result.is_none());
    }
}
