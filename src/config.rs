//! Monitor configuration.
//!
//! Defaults suit a desktop machine watching `~/.claude/projects`. A JSON file
//! named by `SESSION_MONITOR_CONFIG` may override any field, and
//! `CLAUDE_PROJECTS_DIR` overrides the projects directory last.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MonitorError;

pub const PROJECTS_DIR_ENV: &str = "CLAUDE_PROJECTS_DIR";
pub const CONFIG_FILE_ENV: &str = "SESSION_MONITOR_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Root directory holding one encoded subdirectory per project.
    pub projects_dir: PathBuf,
    pub debounce_ms: u64,
    /// No new entries for this long (and no live process) means `Stopped`.
    pub liveness_threshold_secs: u64,
    pub status_tick_ms: u64,
    pub worker_threads: usize,
    pub content_batch_size: usize,
    pub scan_batch_size: usize,
    pub scan_max_depth: usize,
    pub watch_retry_initial_ms: u64,
    pub watch_retry_max_ms: u64,
    /// Consecutive setup failures before the host is told.
    pub watch_failure_report_after: u32,
    pub track_processes: bool,
    /// Entries kept per session for status inference.
    pub tail_capacity: usize,
    /// Also track `agent-*.jsonl` sub-agent logs.
    pub include_subagents: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            projects_dir: default_projects_dir(),
            debounce_ms: 500,
            liveness_threshold_secs: 90,
            status_tick_ms: 5_000,
            worker_threads: 4,
            content_batch_size: 50,
            scan_batch_size: 200,
            scan_max_depth: 4,
            watch_retry_initial_ms: 500,
            watch_retry_max_ms: 30_000,
            watch_failure_report_after: 5,
            track_processes: true,
            tail_capacity: 256,
            include_subagents: false,
        }
    }
}

/// Get the Claude Code projects directory path.
fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".claude").join("projects"))
        .unwrap_or_else(|| PathBuf::from(".claude").join("projects"))
}

impl MonitorConfig {
    /// Build the configuration from the environment.
    pub fn from_env() -> Result<Self, MonitorError> {
        let mut config = match std::env::var_os(CONFIG_FILE_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };

        if let Some(dir) = std::env::var_os(PROJECTS_DIR_ENV) {
            if !dir.is_empty() {
                config.projects_dir = PathBuf::from(dir);
            }
        }

        config.validate()
    }

    /// Load a JSON configuration file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, MonitorError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: MonitorConfig = serde_json::from_str(&content).map_err(|e| {
            MonitorError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()
    }

    /// Clamp values that would stall the engine.
    pub fn validate(mut self) -> Result<Self, MonitorError> {
        if self.projects_dir.as_os_str().is_empty() {
            return Err(MonitorError::Config("projectsDir is empty".to_string()));
        }
        self.worker_threads = self.worker_threads.max(1);
        self.content_batch_size = self.content_batch_size.max(1);
        self.scan_batch_size = self.scan_batch_size.max(1);
        self.scan_max_depth = self.scan_max_depth.max(1);
        self.tail_capacity = self.tail_capacity.max(1);
        self.watch_failure_report_after = self.watch_failure_report_after.max(1);
        if self.watch_retry_max_ms < self.watch_retry_initial_ms {
            self.watch_retry_max_ms = self.watch_retry_initial_ms;
        }
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }

    pub fn status_tick(&self) -> Duration {
        Duration::from_millis(self.status_tick_ms.max(1))
    }
}
