//! Error types for the session monitor.
//!
//! Per-line and per-file errors are contained by their callers; only watcher
//! setup failure and a poisoned registry reach the host as failures.

use std::path::PathBuf;
use thiserror::Error;

/// Why a single log line did not produce a conversation entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Not JSON, not an object, or missing any record discriminator.
    #[error("malformed line: {0}")]
    Malformed(String),
    /// A well-formed record that carries no conversation content
    /// (progress ticks, file-history snapshots and the like).
    #[error("skipped `{0}` record")]
    Skipped(String),
}

/// Errors raised while tailing a session log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("log file shrank from {previous} to {current} bytes")]
    Truncated { previous: u64, current: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error)]
pub enum WatchError {
    #[error("failed to watch {} after {attempts} attempt(s): {reason}", .path.display())]
    SetupFailed {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum IndexError {
    #[error("failed to fetch search text for {} session(s): {reason}", .paths.len())]
    FetchFailed { paths: Vec<PathBuf>, reason: String },
    #[error("search engine error: {0}")]
    Engine(String),
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(err: tantivy::TantivyError) -> Self {
        IndexError::Engine(err.to_string())
    }
}

/// Top-level error returned across the boundary commands.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("session registry lock poisoned")]
    RegistryPoisoned,
    #[error("unknown session: {}", .0.display())]
    UnknownSession(PathBuf),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}

impl LogError {
    /// Map an io error on `path`, turning `NotFound` into the dedicated variant.
    pub fn from_io(path: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            LogError::NotFound(path.to_path_buf())
        } else {
            LogError::Io(err)
        }
    }
}
