//! Project directory naming and `sessions-index.json` hints.
//!
//! Claude Code stores each project's logs under a directory whose name is the
//! project path with separators replaced by dashes. Some versions also write a
//! `sessions-index.json` next to the logs carrying a summary and first prompt
//! per session; those take precedence over what the log itself yields.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const SESSIONS_INDEX_FILE: &str = "sessions-index.json";

/// Metadata entry from sessions-index.json.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHint {
    pub session_id: String,
    pub full_path: Option<String>,
    pub first_prompt: Option<String>,
    pub summary: Option<String>,
    pub message_count: Option<u64>,
    pub created: Option<String>,
    pub modified: Option<String>,
    pub git_branch: Option<String>,
    pub project_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionsIndexFile {
    #[serde(default)]
    entries: Vec<SessionHint>,
}

/// Hints keyed by session id.
pub type HintMap = HashMap<String, SessionHint>;

/// Convert a project path to its encoded directory name.
/// e.g., "/Users/ramos/project" -> "-Users-ramos-project"
pub fn encode_project_path(project_path: &str) -> String {
    project_path.replace(['/', ' '], "-")
}

/// Best-effort inverse of `encode_project_path`. Lossy: dashes that were
/// part of directory names come back as separators.
pub fn decode_project_dir(dir_name: &str) -> String {
    if dir_name.starts_with('-') {
        dir_name.replace('-', "/")
    } else {
        dir_name.to_string()
    }
}

/// The encoded project directory that owns a log file.
///
/// Sub-agent logs live one or two levels below it
/// (`<project>/<session>/subagents/agent-*.jsonl`), so walk up to the
/// nearest ancestor whose name looks encoded.
pub fn project_dir_of(log_path: &Path) -> Option<&Path> {
    let mut dir = log_path.parent()?;
    let first = dir;
    for _ in 0..3 {
        let name = dir.file_name()?.to_string_lossy();
        if name.starts_with('-') {
            return Some(dir);
        }
        dir = dir.parent()?;
    }
    Some(first)
}

/// Project path decoded from the log's directory name, used until the log
/// reveals its real cwd.
pub fn project_path_from_log(log_path: &Path) -> String {
    project_dir_of(log_path)
        .and_then(|d| d.file_name())
        .map(|n| decode_project_dir(&n.to_string_lossy()))
        .unwrap_or_default()
}

/// Load one project's `sessions-index.json`. Missing or unreadable files
/// yield no hints.
pub fn load_project_hints(project_dir: &Path) -> HintMap {
    let index_path = project_dir.join(SESSIONS_INDEX_FILE);
    let content = match fs::read_to_string(&index_path) {
        Ok(c) => c,
        Err(_) => return HintMap::new(),
    };
    match serde_json::from_str::<SessionsIndexFile>(&content) {
        Ok(file) => file
            .entries
            .into_iter()
            .map(|e| (e.session_id.clone(), e))
            .collect(),
        Err(e) => {
            tracing::warn!(path = %index_path.display(), error = %e, "ignoring unreadable sessions index");
            HintMap::new()
        }
    }
}

/// Load all sessions-index.json files directly under the projects directory.
pub fn load_all_hints(projects_dir: &Path) -> HintMap {
    let mut map = HintMap::new();
    let entries = match fs::read_dir(projects_dir) {
        Ok(e) => e,
        Err(_) => return map,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            map.extend(load_project_hints(&path));
        }
    }
    map
}

/// Session id used to look up hints: the log's file stem.
pub fn hint_key(log_path: &Path) -> Option<String> {
    log_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
}

/// Whether `path` is a project's sessions index.
pub fn is_sessions_index(path: &Path) -> bool {
    path.file_name().map(|n| n == SESSIONS_INDEX_FILE).unwrap_or(false)
}
