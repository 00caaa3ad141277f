//! Message types exchanged between the harness and the language model.
//!
//! Messages follow the chat-completion conventions: a role, text content,
//! and for assistant messages an optional list of tool calls that later
//! `tool`-role messages answer by `call_id`. A message is immutable once it
//! has been appended to the context store.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions and ambient facts.
    System,
    /// User message (the goal or a step instruction).
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message answering an assistant tool call.
    Tool,
}

impl Role {
    /// String representation used on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call requested by the model.
///
/// The `id` is opaque and binds the call to the `tool`-role message that
/// carries its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier, echoed back in the matching tool message.
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// Arguments keyed by parameter name.
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Stable short hash of the argument map, used by history compression.
    #[must_use]
    pub fn args_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        // serde_json::Map preserves insertion order; hash a sorted view so
        // the same arguments always produce the same line.
        let mut keys: Vec<&String> = self.arguments.keys().collect();
        keys.sort();
        for key in keys {
            key.hash(&mut hasher);
            self.arguments[key].to_string().hash(&mut hasher);
        }
        format!("{:08x}", hasher.finish() as u32)
    }

    /// Deserialize the arguments into a concrete type.
    pub fn parse_arguments<T: for<'a> Deserialize<'a>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.arguments.clone()))
    }
}

/// Result of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the originating [`ToolCall`].
    pub call_id: String,
    /// Whether the tool completed without error.
    pub ok: bool,
    /// Output payload, already truncated to the per-tool limit.
    pub payload: String,
    /// Wall-clock execution time in milliseconds.
    pub elapsed_ms: u64,
    /// Present when the payload was truncated; states how many bytes were elided.
    pub truncation_note: Option<String>,
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool calls declared by an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For tool messages: the call this message answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool messages: the tool name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation time.
    #[serde(skip, default = "SystemTime::now")]
    pub timestamp: SystemTime,
    /// Conservative token estimate for context budgeting.
    #[serde(skip)]
    pub token_estimate: usize,
}

impl Message {
    fn build(role: Role, content: String) -> Self {
        let token_estimate = estimate_tokens(&content) + ROLE_OVERHEAD_TOKENS;
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp: SystemTime::now(),
            token_estimate,
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::build(Role::System, content.into())
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::build(Role::User, content.into())
    }

    /// Create a plain assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::build(Role::Assistant, content.into())
    }

    /// Create an assistant message that declares tool calls.
    #[must_use]
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::build(Role::Assistant, content.into());
        let call_tokens: usize = calls
            .iter()
            .map(|c| estimate_tokens(&Value::Object(c.arguments.clone()).to_string()) + estimate_tokens(&c.name))
            .sum();
        msg.token_estimate += call_tokens;
        msg.tool_calls = Some(calls);
        msg
    }

    /// Create a tool message answering `call_id`.
    #[must_use]
    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, payload: impl Into<String>) -> Self {
        let mut msg = Self::build(Role::Tool, payload.into());
        msg.tool_call_id = Some(call_id.into());
        msg.name = Some(name.into());
        msg
    }

    /// Build the tool message for a completed [`ToolResult`].
    #[must_use]
    pub fn from_result(name: &str, result: &ToolResult) -> Self {
        let payload = if result.ok {
            result.payload.clone()
        } else {
            format!("error: {}", result.payload)
        };
        Self::tool(result.call_id.clone(), name, payload)
    }

    /// Whether this assistant message declares at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Fixed per-message overhead added to every estimate (role and framing).
const ROLE_OVERHEAD_TOKENS: usize = 4;

/// Chars-per-token constant for Latin-heavy content.
const CHARS_PER_TOKEN_LATIN: f64 = 3.3;
/// Chars-per-token constant for CJK-heavy content.
const CHARS_PER_TOKEN_CJK: f64 = 2.0;
/// CJK char ratio above which the CJK constant is used.
const CJK_RATIO_THRESHOLD: f64 = 0.3;

/// Estimate the token count of `text`.
///
/// Character-count based with a per-script constant, detected by
/// unicode-block ratio. Estimates are padded so they never under-count by
/// more than 10%.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut total = 0usize;
    let mut cjk = 0usize;
    for ch in text.chars() {
        total += 1;
        if is_cjk(ch) {
            cjk += 1;
        }
    }
    let ratio = cjk as f64 / total as f64;
    let chars_per_token = if ratio > CJK_RATIO_THRESHOLD {
        CHARS_PER_TOKEN_CJK
    } else {
        CHARS_PER_TOKEN_LATIN
    };
    // 10% conservative padding, rounded up.
    ((total as f64 / chars_per_token) * 1.1).ceil() as usize
}

/// Whether `ch` falls into a CJK unicode block.
const fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF       // CJK Unified Ideographs
        | 0x3400..=0x4DBF     // CJK Extension A
        | 0x3040..=0x30FF     // Hiragana + Katakana
        | 0xAC00..=0xD7AF     // Hangul Syllables
        | 0xF900..=0xFAFF)    // CJK Compatibility Ideographs
}

/// Seconds since the Unix epoch, saturating at zero.
#[must_use]
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_latin() {
        let text = "a".repeat(330);
        let est = estimate_tokens(&text);
        // 330 chars / 3.3 = 100 tokens, padded 10%.
        assert_eq!(est, 110);
    }

    #[test]
    fn test_estimate_cjk() {
        let text = "漢".repeat(100);
        let est = estimate_tokens(&text);
        // 100 chars / 2.0 = 50 tokens, padded 10%.
        assert_eq!(est, 55);
    }

    #[test]
    fn test_estimate_never_undercounts() {
        // A mixed string must estimate at least chars/3.3.
        let text = "fix the failing tests in src/lib.rs";
        let est = estimate_tokens(text);
        assert!(est as f64 >= text.chars().count() as f64 / CHARS_PER_TOKEN_LATIN);
    }

    #[test]
    fn test_args_hash_is_order_independent() {
        let mut a = Map::new();
        a.insert("path".into(), Value::String("a.py".into()));
        a.insert("find".into(), Value::String("x".into()));
        let mut b = Map::new();
        b.insert("find".into(), Value::String("x".into()));
        b.insert("path".into(), Value::String("a.py".into()));
        let call_a = ToolCall::new("1", "edit_file", a);
        let call_b = ToolCall::new("2", "edit_file", b);
        assert_eq!(call_a.args_hash(), call_b.args_hash());
    }

    #[test]
    fn test_tool_message_binding() {
        let msg = Message::tool("call_7", "read_file", "contents");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_7"));
        assert_eq!(msg.name.as_deref(), Some("read_file"));
    }
}
