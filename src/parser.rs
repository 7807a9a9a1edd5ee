//! Entry Parser: one JSONL log line in, one typed conversation entry out.
//!
//! Two record shapes are accepted. Flat records put everything at the top
//! level (`{"type":"tool_use","name":"Edit"}`); Claude Code records nest an
//! API message (`{"type":"assistant","message":{"content":[...],"usage":{...}}}`).
//! Parsing is stateless and never panics on foreign input.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::session::{ContentBlock, ContentType, ConversationEntry, EntryKind, Role, TokenUsage};

const TOOL_INPUT_MAX_CHARS: usize = 200;
const TOOL_RESULT_MAX_CHARS: usize = 500;
const APPROVAL_PREFIX: &str = "Claude needs your permission";

/// Internal struct for deserializing one JSONL record.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    subtype: Option<String>,
    role: Option<String>,
    message: Option<RawMessage>,
    text: Option<Value>,
    content: Option<Value>,
    thinking: Option<String>,
    name: Option<String>,
    id: Option<String>,
    #[serde(alias = "tool_use_id")]
    tool_use_id: Option<String>,
    input: Option<Value>,
    summary: Option<String>,
    timestamp: Option<Value>,
    #[serde(alias = "session_id")]
    session_id: Option<String>,
    cwd: Option<String>,
    #[serde(alias = "git_branch")]
    git_branch: Option<String>,
    model: Option<String>,
    usage: Option<Value>,
    #[serde(alias = "is_meta")]
    is_meta: Option<bool>,
}

#[derive(Deserialize)]
struct RawMessage {
    id: Option<String>,
    role: Option<String>,
    model: Option<String>,
    content: Option<Value>,
    usage: Option<Value>,
}

/// Parse one complete log line.
///
/// Returns `ParseError::Malformed` for anything that is not a JSON object with
/// a record discriminator, and `ParseError::Skipped` for well-formed records
/// that carry no conversation content.
pub fn parse_line(line: &str) -> Result<ConversationEntry, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Malformed("empty line".to_string()));
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| ParseError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ParseError::Malformed("expected a JSON object".to_string()));
    }

    let raw: RawEntry =
        serde_json::from_value(value).map_err(|e| ParseError::Malformed(e.to_string()))?;
    raw.into_entry()
}

impl RawEntry {
    fn into_entry(self) -> Result<ConversationEntry, ParseError> {
        let discriminator = match (&self.entry_type, &self.message) {
            (Some(t), _) => t.clone(),
            (None, Some(msg)) => msg.role.clone().unwrap_or_default(),
            (None, None) => {
                return Err(ParseError::Malformed("record has no type".to_string()));
            }
        };

        if is_approval_type(&discriminator) || self.subtype.as_deref().is_some_and(is_approval_type)
        {
            return Ok(self.approval_entry());
        }

        match discriminator.as_str() {
            "user" | "assistant" | "system" | "tool" => Ok(self.message_entry(&discriminator)),
            "tool_use" => {
                let block = ContentBlock {
                    content_type: ContentType::ToolUse,
                    tool_name: Some(self.name.clone().unwrap_or_else(|| "unknown".to_string())),
                    tool_use_id: self.id.clone(),
                    text: self.input.as_ref().map(tool_input_text).unwrap_or_default(),
                };
                Ok(self.build(Role::Assistant, EntryKind::Message, vec![block]))
            }
            "tool_result" => {
                let text = self
                    .content
                    .as_ref()
                    .or(self.text.as_ref())
                    .map(tool_result_text)
                    .unwrap_or_default();
                let block = ContentBlock {
                    content_type: ContentType::ToolResult,
                    tool_name: None,
                    tool_use_id: self.tool_use_id.clone(),
                    text,
                };
                Ok(self.build(Role::User, EntryKind::Message, vec![block]))
            }
            "thinking" => {
                let text = self
                    .thinking
                    .clone()
                    .or_else(|| self.text.as_ref().and_then(value_str))
                    .unwrap_or_default();
                let block = text_block(ContentType::Thinking, text);
                Ok(self.build(Role::Assistant, EntryKind::Message, vec![block]))
            }
            "text" => {
                let role = self.role.as_deref().map(role_from_str).unwrap_or(Role::Assistant);
                let text = self.text.as_ref().and_then(value_str).unwrap_or_default();
                Ok(self.build(role, EntryKind::Message, vec![text_block(ContentType::Text, text)]))
            }
            "summary" => {
                let text = self.summary.clone().unwrap_or_default();
                Ok(self.build(
                    Role::System,
                    EntryKind::Summary,
                    vec![text_block(ContentType::Text, text)],
                ))
            }
            "notification" => {
                let text = self.plain_text();
                if text.to_lowercase().contains("permission") {
                    Ok(self.build(
                        Role::System,
                        EntryKind::ApprovalRequest,
                        vec![text_block(ContentType::Text, text)],
                    ))
                } else {
                    Err(ParseError::Skipped(discriminator))
                }
            }
            "" => Err(ParseError::Malformed("record has no type".to_string())),
            _ => Err(ParseError::Skipped(discriminator)),
        }
    }

    /// User, assistant, system and tool records, flat or nested.
    fn message_entry(&self, discriminator: &str) -> ConversationEntry {
        let role = self
            .message
            .as_ref()
            .and_then(|m| m.role.as_deref())
            .map(role_from_str)
            .unwrap_or_else(|| role_from_str(discriminator));

        let content = self
            .message
            .as_ref()
            .and_then(|m| m.content.as_ref())
            .or(self.content.as_ref())
            .or(self.text.as_ref());
        let blocks = content.map(blocks_from_content).unwrap_or_default();

        let kind = if role == Role::System && join_block_text(&blocks).starts_with(APPROVAL_PREFIX) {
            EntryKind::ApprovalRequest
        } else {
            EntryKind::Message
        };

        self.build(role, kind, blocks)
    }

    fn approval_entry(&self) -> ConversationEntry {
        let text = self.plain_text();
        self.build(
            Role::System,
            EntryKind::ApprovalRequest,
            vec![text_block(ContentType::Text, text)],
        )
    }

    /// Best text for records that are not conversation messages.
    fn plain_text(&self) -> String {
        let content = self
            .message
            .as_ref()
            .and_then(|m| m.content.as_ref())
            .or(self.content.as_ref())
            .or(self.text.as_ref());
        let blocks = content.map(blocks_from_content).unwrap_or_default();
        join_block_text(&blocks)
    }

    fn build(&self, role: Role, kind: EntryKind, blocks: Vec<ContentBlock>) -> ConversationEntry {
        let (content_type, tool_name) = blocks
            .last()
            .map(|b| (b.content_type, b.tool_name.clone()))
            .unwrap_or((ContentType::Text, None));

        let usage = self
            .message
            .as_ref()
            .and_then(|m| m.usage.as_ref())
            .or(self.usage.as_ref())
            .and_then(usage_from_value);

        let model = self
            .message
            .as_ref()
            .and_then(|m| m.model.clone())
            .or_else(|| self.model.clone());

        ConversationEntry {
            role,
            content_type,
            tool_name,
            text: join_block_text(&blocks),
            timestamp: self.timestamp.as_ref().and_then(parse_timestamp),
            kind,
            blocks,
            usage,
            model,
            message_id: self.message.as_ref().and_then(|m| m.id.clone()),
            session_id: non_empty(&self.session_id),
            cwd: non_empty(&self.cwd),
            git_branch: non_empty(&self.git_branch),
            is_meta: self.is_meta.unwrap_or(false),
        }
    }
}

fn is_approval_type(t: &str) -> bool {
    matches!(t, "permission_request" | "approval_request")
}

fn role_from_str(role: &str) -> Role {
    match role {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        // Tool results travel as user-role messages
        _ => Role::User,
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

fn value_str(value: &Value) -> Option<String> {
    value.as_str().map(|s| s.to_string())
}

fn text_block(content_type: ContentType, text: String) -> ContentBlock {
    ContentBlock {
        content_type,
        tool_name: None,
        tool_use_id: None,
        text,
    }
}

fn join_block_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|b| b.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract content blocks (content can be a string or an array of blocks).
fn blocks_from_content(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(s) => vec![text_block(ContentType::Text, s.clone())],
        Value::Array(arr) => arr
            .iter()
            .filter_map(|item| item.as_object())
            .filter_map(block_from_object)
            .collect(),
        _ => Vec::new(),
    }
}

fn block_from_object(obj: &Map<String, Value>) -> Option<ContentBlock> {
    let block_type = obj.get("type").and_then(|t| t.as_str())?;
    let get_str = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());

    match block_type {
        "text" => Some(text_block(ContentType::Text, get_str("text").unwrap_or_default())),
        "thinking" => Some(text_block(
            ContentType::Thinking,
            get_str("thinking").or_else(|| get_str("text")).unwrap_or_default(),
        )),
        "tool_use" => Some(ContentBlock {
            content_type: ContentType::ToolUse,
            tool_name: Some(get_str("name").unwrap_or_else(|| "unknown".to_string())),
            tool_use_id: get_str("id"),
            text: obj.get("input").map(tool_input_text).unwrap_or_default(),
        }),
        "tool_result" => Some(ContentBlock {
            content_type: ContentType::ToolResult,
            tool_name: None,
            tool_use_id: get_str("tool_use_id"),
            text: obj.get("content").map(tool_result_text).unwrap_or_default(),
        }),
        _ => None,
    }
}

fn tool_input_text(input: &Value) -> String {
    let compact = match input {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    truncate_string(&compact, TOOL_INPUT_MAX_CHARS)
}

fn tool_result_text(content: &Value) -> String {
    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(arr) => arr
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    truncate_string(&text, TOOL_RESULT_MAX_CHARS)
}

/// Token usage from a usage object. Producers disagree on field names and
/// sometimes emit floats or nulls; anything unusable counts as zero.
fn usage_from_value(value: &Value) -> Option<TokenUsage> {
    let obj = value.as_object()?;
    Some(TokenUsage {
        input_tokens: count_field(obj, &["input_tokens", "inputTokens", "prompt_tokens"]),
        output_tokens: count_field(obj, &["output_tokens", "outputTokens", "completion_tokens"]),
        cache_creation_tokens: count_field(
            obj,
            &[
                "cache_creation_input_tokens",
                "cacheCreationInputTokens",
                "cache_creation_tokens",
                "cacheCreationTokens",
            ],
        ),
        cache_read_tokens: count_field(
            obj,
            &[
                "cache_read_input_tokens",
                "cacheReadInputTokens",
                "cache_read_tokens",
                "cacheReadTokens",
            ],
        ),
    })
}

fn count_field(obj: &Map<String, Value>, names: &[&str]) -> u64 {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find_map(|v| {
            v.as_u64().or_else(|| {
                v.as_f64()
                    .filter(|f| f.is_finite() && *f > 0.0)
                    .map(|f| f as u64)
            })
        })
        .unwrap_or(0)
}

/// Parse an RFC 3339 string or a numeric epoch (seconds or milliseconds).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(epoch_to_datetime)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(num: i64) -> Option<DateTime<Utc>> {
    if num <= 0 {
        None
    } else if num > 1_000_000_000_000 {
        DateTime::from_timestamp_millis(num)
    } else {
        DateTime::from_timestamp(num, 0)
    }
}

/// Truncate a string to a maximum number of characters.
pub(crate) fn truncate_string(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =============================================================================
    // Flat Record Tests
    // =============================================================================

    #[test]
    fn test_parse_flat_user_text() {
        let entry = parse_line(r#"{"type":"user","text":"fix bug"}"#).unwrap();
        assert_eq!(entry.role, Role::User);
        assert_eq!(entry.content_type, ContentType::Text);
        assert_eq!(entry.text, "fix bug");
        assert_eq!(entry.kind, EntryKind::Message);
        assert!(entry.timestamp.is_none());
        assert!(entry.is_user_prompt());
    }

    #[test]
    fn test_parse_flat_tool_use() {
        let entry = parse_line(r#"{"type":"tool_use","name":"Edit"}"#).unwrap();
        assert_eq!(entry.role, Role::Assistant);
        assert_eq!(entry.content_type, ContentType::ToolUse);
        assert_eq!(entry.tool_name.as_deref(), Some("Edit"));
        assert!(entry.blocks[0].tool_use_id.is_none());
    }

    #[test]
    fn test_parse_flat_tool_result() {
        let entry =
            parse_line(r#"{"type":"tool_result","tool_use_id":"t1","content":"ok"}"#).unwrap();
        assert_eq!(entry.role, Role::User);
        assert_eq!(entry.content_type, ContentType::ToolResult);
        assert_eq!(entry.blocks[0].tool_use_id.as_deref(), Some("t1"));
        assert_eq!(entry.text, "ok");
        assert!(!entry.is_user_prompt());
    }

    #[test]
    fn test_parse_flat_thinking() {
        let entry = parse_line(r#"{"type":"thinking","thinking":"hmm"}"#).unwrap();
        assert_eq!(entry.content_type, ContentType::Thinking);
        assert_eq!(entry.text, "hmm");
    }

    // =============================================================================
    // Nested Message Tests
    // =============================================================================

    #[test]
    fn test_parse_assistant_message_blocks() {
        let line = r#"{"type":"assistant","sessionId":"abc","cwd":"/home/dev/app","gitBranch":"main","timestamp":"2026-01-15T10:30:00.000Z","message":{"id":"msg_1","role":"assistant","model":"claude-opus-4-5","content":[{"type":"thinking","thinking":"Let me look"},{"type":"text","text":"Editing now"},{"type":"tool_use","id":"toolu_1","name":"Edit","input":{"file_path":"src/main.rs"}}],"usage":{"input_tokens":10,"output_tokens":5,"cache_creation_input_tokens":100,"cache_read_input_tokens":200}}}"#;
        let entry = parse_line(line).unwrap();

        assert_eq!(entry.role, Role::Assistant);
        assert_eq!(entry.blocks.len(), 3);
        assert_eq!(entry.content_type, ContentType::ToolUse);
        assert_eq!(entry.tool_name.as_deref(), Some("Edit"));
        assert_eq!(entry.blocks[2].tool_use_id.as_deref(), Some("toolu_1"));
        assert!(entry.blocks[2].text.contains("src/main.rs"));
        assert!(entry.text.starts_with("Let me look\nEditing now"));
        assert_eq!(entry.model.as_deref(), Some("claude-opus-4-5"));
        assert_eq!(entry.message_id.as_deref(), Some("msg_1"));
        assert_eq!(entry.session_id.as_deref(), Some("abc"));
        assert_eq!(entry.cwd.as_deref(), Some("/home/dev/app"));
        assert_eq!(entry.git_branch.as_deref(), Some("main"));
        assert!(entry.timestamp.is_some());
        assert_eq!(
            entry.usage,
            Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                cache_creation_tokens: 100,
                cache_read_tokens: 200,
            })
        );
    }

    #[test]
    fn test_parse_user_tool_result_array() {
        let line = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":[{"type":"text","text":"line one"},{"type":"text","text":"line two"}]}]}}"#;
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.role, Role::User);
        assert_eq!(entry.content_type, ContentType::ToolResult);
        assert_eq!(entry.text, "line one\nline two");
    }

    #[test]
    fn test_parse_user_string_content_meta() {
        let line = r#"{"type":"user","isMeta":true,"message":{"role":"user","content":"<local-command-caveat>"}}"#;
        let entry = parse_line(line).unwrap();
        assert!(entry.is_meta);
        assert!(!entry.is_user_prompt());
        assert!(!entry.is_classifiable());
    }

    #[test]
    fn test_parse_message_without_type() {
        let entry = parse_line(r#"{"message":{"role":"assistant","content":"hi"}}"#).unwrap();
        assert_eq!(entry.role, Role::Assistant);
        assert_eq!(entry.text, "hi");
    }

    // =============================================================================
    // Usage Field Tolerance Tests
    // =============================================================================

    #[test]
    fn test_usage_camel_case_and_floats() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[],"usage":{"inputTokens":7.0,"outputTokens":3,"cacheReadInputTokens":null}}}"#;
        let usage = parse_line(line).unwrap().usage.unwrap();
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(usage.cache_read_tokens, 0);
        assert_eq!(usage.cache_creation_tokens, 0);
    }

    #[test]
    fn test_usage_negative_and_strings_count_as_zero() {
        let line = r#"{"type":"assistant","usage":{"input_tokens":-4,"output_tokens":"12"},"message":{"role":"assistant","content":"x"}}"#;
        let usage = parse_line(line).unwrap().usage.unwrap();
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
    }

    #[test]
    fn test_usage_absent() {
        let entry = parse_line(r#"{"type":"assistant","text":"done"}"#).unwrap();
        assert!(entry.usage.is_none());
    }

    // =============================================================================
    // Special Record Tests
    // =============================================================================

    #[test]
    fn test_parse_summary_record() {
        let entry = parse_line(r#"{"type":"summary","summary":"Refactor auth","leafUuid":"x"}"#)
            .unwrap();
        assert_eq!(entry.kind, EntryKind::Summary);
        assert_eq!(entry.text, "Refactor auth");
        assert!(!entry.is_classifiable());
    }

    #[test]
    fn test_parse_approval_markers() {
        let entry = parse_line(r#"{"type":"permission_request","tool":"Bash"}"#).unwrap();
        assert_eq!(entry.kind, EntryKind::ApprovalRequest);

        let entry =
            parse_line(r#"{"type":"system","subtype":"approval_request","content":"Run rm?"}"#)
                .unwrap();
        assert_eq!(entry.kind, EntryKind::ApprovalRequest);

        let entry = parse_line(
            r#"{"type":"system","content":"Claude needs your permission to use Bash"}"#,
        )
        .unwrap();
        assert_eq!(entry.kind, EntryKind::ApprovalRequest);

        let entry = parse_line(
            r#"{"type":"notification","message":{"content":"Waiting for permission"}}"#,
        )
        .unwrap();
        assert_eq!(entry.kind, EntryKind::ApprovalRequest);
    }

    #[test]
    fn test_plain_system_message_is_not_approval() {
        let entry = parse_line(r#"{"type":"system","content":"Compacting conversation"}"#).unwrap();
        assert_eq!(entry.kind, EntryKind::Message);
        assert_eq!(entry.role, Role::System);
    }

    #[test]
    fn test_skipped_records() {
        assert_eq!(
            parse_line(r#"{"type":"progress","data":{}}"#),
            Err(ParseError::Skipped("progress".to_string()))
        );
        assert!(matches!(
            parse_line(r#"{"type":"file-history-snapshot","snapshot":{}}"#),
            Err(ParseError::Skipped(_))
        ));
        assert!(matches!(
            parse_line(r#"{"type":"notification","message":{"content":"Task done"}}"#),
            Err(ParseError::Skipped(_))
        ));
    }

    // =============================================================================
    // Malformed Input Tests
    // =============================================================================

    #[test]
    fn test_malformed_lines() {
        for line in [
            "not json",
            r#"{"type":"too"#,
            "[1,2,3]",
            "42",
            r#"{"foo":"bar"}"#,
            r#"{"type":""}"#,
            r#"{"type":"user","cwd":5}"#,
            "",
        ] {
            assert!(
                matches!(parse_line(line), Err(ParseError::Malformed(_))),
                "expected malformed: {line}"
            );
        }
    }

    // =============================================================================
    // Timestamp Tests
    // =============================================================================

    #[test]
    fn test_parse_timestamp_formats() {
        let iso = parse_timestamp(&Value::String("2026-01-15T10:30:00.000Z".to_string())).unwrap();
        assert_eq!(iso.timestamp(), 1_768_473_000);

        let secs = parse_timestamp(&serde_json::json!(1_768_473_000)).unwrap();
        assert_eq!(secs, iso);

        let millis = parse_timestamp(&serde_json::json!(1_768_473_000_000i64)).unwrap();
        assert_eq!(millis, iso);

        let string_millis = parse_timestamp(&Value::String("1768473000000".to_string())).unwrap();
        assert_eq!(string_millis, iso);

        assert!(parse_timestamp(&Value::String("yesterday".to_string())).is_none());
        assert!(parse_timestamp(&Value::Bool(true)).is_none());
    }

    // =============================================================================
    // Truncation Tests
    // =============================================================================

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("hello world", 5), "hello...");
        assert_eq!(truncate_string("", 5), "");
        assert_eq!(truncate_string("日本語テキスト", 3), "日本語...");
    }

    #[test]
    fn test_tool_input_is_truncated() {
        let long = "x".repeat(1000);
        let line = format!(
            r#"{{"type":"tool_use","name":"Write","input":{{"content":"{}"}}}}"#,
            long
        );
        let entry = parse_line(&line).unwrap();
        assert_eq!(entry.text.chars().count(), TOOL_INPUT_MAX_CHARS + 3);
    }
}
