//! Directory watcher for the projects root.
//!
//! Watches the root recursively through a debounced notify watcher and hands
//! changed paths to a `WatchSink`. Setup runs on a supervisor thread that
//! retries with backoff until the watch attaches or the monitor shuts down.

use notify_debouncer_mini::{
    new_debouncer, notify::RecursiveMode, DebounceEventResult, DebouncedEventKind, Debouncer,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::MonitorConfig;
use crate::error::{MonitorError, WatchError};
use crate::metadata;

/// What a changed path means to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    SessionLog,
    SessionsIndex,
    Irrelevant,
}

/// Classify a path by name only; it may already be gone.
pub fn classify(path: &Path, include_subagents: bool) -> PathKind {
    if metadata::is_sessions_index(path) {
        return PathKind::SessionsIndex;
    }
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return PathKind::Irrelevant;
    }
    let is_subagent = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("agent-"))
        .unwrap_or(false);
    if is_subagent && !include_subagents {
        return PathKind::Irrelevant;
    }
    PathKind::SessionLog
}

/// Receiver of watcher output. Called from notify's thread.
pub trait WatchSink: Send + Sync + 'static {
    /// A debounced batch of changed paths (deduplicated, unclassified).
    fn paths_changed(&self, paths: Vec<PathBuf>);
    /// Events may have been dropped; state should be rebuilt from a scan.
    fn events_lost(&self, reason: &str);
    /// Setup kept failing. Called once per failure streak.
    fn setup_failed(&self, error: &WatchError);
    /// Setup succeeded after at least one failure.
    fn setup_recovered(&self);
}

/// Retry and timing knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub root: PathBuf,
    pub debounce: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub report_after: u32,
}

impl WatchOptions {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            root: config.projects_dir.clone(),
            debounce: config.debounce(),
            retry_initial: Duration::from_millis(config.watch_retry_initial_ms),
            retry_max: Duration::from_millis(config.watch_retry_max_ms),
            report_after: config.watch_failure_report_after,
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_initial
            .saturating_mul(1u32 << shift)
            .min(self.retry_max)
    }
}

/// Running watcher. Dropping it stops the supervisor.
pub struct WatchHandle {
    stop: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(&mut self) {
        // Dropping the sender wakes the supervisor
        self.stop.take();
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                tracing::error!("watch supervisor panicked");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the supervisor thread.
pub fn spawn_watch(options: WatchOptions, sink: Arc<dyn WatchSink>) -> Result<WatchHandle, MonitorError> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let name = "watch-supervisor".to_string();
    let supervisor = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || supervise(options, sink, stop_rx))
        .map_err(|source| MonitorError::Spawn { name, source })?;

    Ok(WatchHandle {
        stop: Some(stop_tx),
        supervisor: Some(supervisor),
    })
}

fn supervise(options: WatchOptions, sink: Arc<dyn WatchSink>, stop: mpsc::Receiver<()>) {
    let mut attempts: u32 = 0;
    let mut reported = false;

    loop {
        match attach(&options, Arc::clone(&sink)) {
            Ok(debouncer) => {
                if attempts > 0 {
                    tracing::info!(
                        root = %options.root.display(),
                        attempts,
                        "directory watch attached after retries"
                    );
                    sink.setup_recovered();
                } else {
                    tracing::info!(root = %options.root.display(), "watching for session changes");
                }
                // Hold the debouncer until shutdown
                let _ = stop.recv();
                drop(debouncer);
                return;
            }
            Err(reason) => {
                attempts += 1;
                let delay = options.retry_delay(attempts);
                tracing::warn!(
                    root = %options.root.display(),
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "failed to watch projects directory"
                );
                if attempts >= options.report_after && !reported {
                    let error = WatchError::SetupFailed {
                        path: options.root.clone(),
                        attempts,
                        reason,
                    };
                    tracing::error!(error = %error, "directory watch unavailable");
                    sink.setup_failed(&error);
                    reported = true;
                }
                match stop.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }
}

fn attach(
    options: &WatchOptions,
    sink: Arc<dyn WatchSink>,
) -> Result<Debouncer<notify::RecommendedWatcher>, String> {
    let mut debouncer = new_debouncer(options.debounce, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let mut seen = HashSet::new();
                let paths: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|e| {
                        matches!(
                            e.kind,
                            DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                        )
                    })
                    .map(|e| e.path)
                    .filter(|p| seen.insert(p.clone()))
                    .collect();
                if !paths.is_empty() {
                    sink.paths_changed(paths);
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "watch error, events may be lost");
                sink.events_lost(&error.to_string());
            }
        }
    })
    .map_err(|e| format!("failed to create watcher: {}", e))?;

    debouncer
        .watcher()
        .watch(&options.root, RecursiveMode::Recursive)
        .map_err(|e| format!("failed to watch {}: {}", options.root.display(), e))?;

    Ok(debouncer)
}

/// Every session log under `root`, bounded by `max_depth`, sorted.
pub fn scan_logs(root: &Path, max_depth: usize, include_subagents: bool) -> Vec<PathBuf> {
    let mut logs = Vec::new();
    let mut unreadable = 0usize;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .max_depth(max_depth)
        .into_iter();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if classify(entry.path(), include_subagents) == PathKind::SessionLog {
            logs.push(entry.into_path());
        }
    }

    if unreadable > 0 {
        tracing::debug!(root = %root.display(), unreadable, "skipped unreadable scan entries");
    }
    logs.sort();
    logs
}
