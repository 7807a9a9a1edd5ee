//! Status Inference: derives a session's activity state from its latest entries.
//!
//! Rules are checked most specific first:
//! 1. an unresolved tool call at the end of the log -> `ExecutingTool`
//! 2. a trailing thinking block -> `Thinking`
//! 3. a trailing permission request -> `AwaitingApproval`
//! 4. stale and no live process -> `Stopped`
//! 5. trailing assistant text -> `Waiting`
//! 6. nothing classifiable -> `Unknown`
//! 7. anything else -> `Idle`

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use crate::session::{ContentType, ConversationEntry, EntryKind, Role, SessionStatus};

/// Time and process inputs to status inference.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    pub now: DateTime<Utc>,
    /// Newest entry timestamp, or the file mtime when entries carry none.
    pub last_activity: Option<DateTime<Utc>>,
    /// `None` when the process is not tracked; treated as not running.
    pub process_alive: Option<bool>,
    pub threshold: Duration,
}

impl Liveness {
    /// No activity for longer than the threshold.
    pub fn is_stale(&self) -> bool {
        match self.last_activity {
            Some(last) => self
                .now
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed > self.threshold)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Infer the current status from entries in file order.
pub fn infer_status<'a, I>(entries: I, liveness: &Liveness) -> SessionStatus
where
    I: IntoIterator<Item = &'a ConversationEntry>,
    I::IntoIter: DoubleEndedIterator,
{
    let classifiable: Vec<&ConversationEntry> = entries
        .into_iter()
        .rev()
        .filter(|e| e.is_classifiable())
        .collect();

    let Some(last) = classifiable.first().copied() else {
        return SessionStatus::Unknown;
    };

    if let Some(name) = pending_tool(&classifiable) {
        return SessionStatus::ExecutingTool { name };
    }

    if last.kind == EntryKind::Message && last.content_type == ContentType::Thinking {
        return SessionStatus::Thinking;
    }

    let stale = liveness.is_stale();
    let awaiting_model =
        last.kind == EntryKind::Message && (last.is_user_prompt() || last.content_type == ContentType::ToolResult);
    if awaiting_model && !stale {
        return SessionStatus::Thinking;
    }

    if last.kind == EntryKind::ApprovalRequest {
        return SessionStatus::AwaitingApproval;
    }

    if stale && liveness.process_alive != Some(true) {
        return SessionStatus::Stopped;
    }

    if last.role == Role::Assistant && last.content_type == ContentType::Text {
        return SessionStatus::Waiting;
    }

    SessionStatus::Idle
}

/// Name of the most recent tool call left without a result in the trailing
/// run of tool events. `newest_first` is the classifiable history reversed.
fn pending_tool(newest_first: &[&ConversationEntry]) -> Option<String> {
    let run_len = newest_first
        .iter()
        .take_while(|e| e.kind == EntryKind::Message && e.is_tool_event())
        .count();
    if run_len == 0 {
        return None;
    }

    // (tool_use_id, name) in call order
    let mut pending: VecDeque<(Option<String>, String)> = VecDeque::new();
    for entry in newest_first[..run_len].iter().rev() {
        for block in &entry.blocks {
            match block.content_type {
                ContentType::ToolUse => pending.push_back((
                    block.tool_use_id.clone(),
                    block.tool_name.clone().unwrap_or_else(|| "unknown".to_string()),
                )),
                ContentType::ToolResult => {
                    let matched = block.tool_use_id.as_ref().and_then(|id| {
                        pending
                            .iter()
                            .position(|(use_id, _)| use_id.as_ref() == Some(id))
                    });
                    match matched {
                        Some(i) => {
                            pending.remove(i);
                        }
                        None => {
                            // Anonymous (or unknown-id) results resolve the oldest call
                            pending.pop_front();
                        }
                    }
                }
                ContentType::Text | ContentType::Thinking => {}
            }
        }
    }

    pending.pop_back().map(|(_, name)| name)
}
