//! OpenAI-compatible chat-completions client.
//!
//! The harness addresses the model by [`Tier`](crate::config::Tier); the
//! concrete model identifier is resolved from configuration at request time.
//! Responses are assembled into an [`LmResponse`] from either a single JSON
//! reply or a stream of SSE chunks.

mod client;
mod streaming;

pub use client::LmClient;
pub use streaming::{SseStream, StreamDelta};

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Tier;
use crate::message::Message;

/// The chat transport seam. [`LmClient`] is the HTTP implementation; tests
/// substitute scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issue one chat-completion request.
    async fn chat(&self, request: &ChatRequest, cancel: &CancellationToken)
    -> Result<LmResponse, LmError>;
}

#[async_trait]
impl ChatBackend for LmClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<LmResponse, LmError> {
        Self::chat(self, request, cancel).await
    }
}

/// Default cooldown when a rate-limit reply names no retry interval.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Errors surfaced by the LM transport.
#[derive(Debug, Error)]
pub enum LmError {
    /// Connection failure, 5xx status, or unreadable body.
    #[error("lm transport: {message}")]
    Transport {
        /// Underlying error text.
        message: String,
    },
    /// The response envelope decoded but did not match the protocol.
    #[error("lm protocol: {message}")]
    Protocol {
        /// What was malformed.
        message: String,
    },
    /// The request exceeded its per-attempt deadline.
    #[error("lm request timed out after {secs}s")]
    Timeout {
        /// The deadline that was hit.
        secs: u64,
    },
    /// HTTP 429 or a rate-limit lexicon match in the reply.
    #[error("lm rate limited, retry after {}s: {message}", cooldown.as_secs())]
    RateLimited {
        /// How long to wait before retrying.
        cooldown: Duration,
        /// The upstream message.
        message: String,
    },
}

/// One chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation built by the context store.
    pub messages: Vec<Message>,
    /// Capability tier to resolve against the tier table.
    pub tier: Tier,
    /// Whether to stream token chunks.
    pub stream: bool,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional stop sequences.
    pub stop: Option<Vec<String>>,
    /// Tool schemas in the wire `tools` format.
    pub tool_schemas: Option<Vec<serde_json::Value>>,
}

impl ChatRequest {
    /// A request with harness defaults: streaming on, temperature 0.2.
    #[must_use]
    pub fn new(messages: Vec<Message>, tier: Tier) -> Self {
        Self {
            messages,
            tier,
            stream: true,
            max_tokens: None,
            temperature: 0.2,
            stop: None,
            tool_schemas: None,
        }
    }

    /// Attach tool schemas.
    #[must_use]
    pub fn with_tools(mut self, schemas: Vec<serde_json::Value>) -> Self {
        self.tool_schemas = Some(schemas);
        self
    }
}

/// Token accounting reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt-side tokens.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Completion-side tokens.
    #[serde(default)]
    pub completion_tokens: u32,
}

/// A tool call as carried in the native `tool_calls` field: the name and id
/// are trusted, the argument text still goes through the repair pass.
#[derive(Debug, Clone, Default)]
pub struct RawToolCall {
    /// Opaque call id assigned by the endpoint.
    pub id: String,
    /// Function name as emitted by the model.
    pub name: String,
    /// Argument JSON text, possibly malformed.
    pub arguments: String,
}

/// An assembled model response.
#[derive(Debug, Clone, Default)]
pub struct LmResponse {
    /// Assistant text content (may be empty).
    pub assistant_text: String,
    /// Tool calls carried in the native `tool_calls` field.
    pub tool_calls: Vec<RawToolCall>,
    /// Concatenation of the raw streamed chunks (empty for non-streaming).
    pub raw_chunks: String,
    /// The endpoint's finish reason, when present.
    pub finish_reason: Option<String>,
    /// Token usage, when reported.
    pub usage: Option<Usage>,
}

static RATE_LIMIT_LEXICON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate limit|quota|too many requests").expect("lexicon regex is valid")
});

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)try again in (\d{1,5})\s*(minute|second|min|sec)s?")
        .expect("retry-after regex is valid")
});

/// Bounded head of `text`, cut at a char boundary.
fn scan_head(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Whether `text` matches the rate-limit lexicon.
#[must_use]
pub fn rate_limit_lexicon_matches(text: &str) -> bool {
    // Bound the scan; rate-limit notices appear near the start of a reply.
    RATE_LIMIT_LEXICON.is_match(scan_head(text, 4096))
}

/// Parse `"try again in N minutes/seconds"` out of `text`.
#[must_use]
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    let caps = RETRY_AFTER.captures(scan_head(text, 4096))?;
    let n: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let secs = if unit.starts_with("min") { n * 60 } else { n };
    Some(Duration::from_secs(secs))
}

/// Build a [`LmError::RateLimited`] from an upstream message, applying the
/// default cooldown when no interval is stated.
#[must_use]
pub fn rate_limited(message: impl Into<String>) -> LmError {
    let message = message.into();
    let cooldown = parse_retry_after(&message).unwrap_or(DEFAULT_COOLDOWN);
    LmError::RateLimited { cooldown, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicon_is_case_insensitive() {
        assert!(rate_limit_lexicon_matches("429 Rate Limit hit"));
        assert!(rate_limit_lexicon_matches("monthly QUOTA exhausted"));
        assert!(rate_limit_lexicon_matches("too many requests"));
        assert!(!rate_limit_lexicon_matches("all tests passed"));
    }

    #[test]
    fn test_retry_after_minutes_and_seconds() {
        assert_eq!(
            parse_retry_after("429 rate limit, try again in 10 minutes"),
            Some(Duration::from_secs(600))
        );
        assert_eq!(
            parse_retry_after("Try again in 45 seconds."),
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn test_default_cooldown_applies() {
        let err = rate_limited("quota exceeded");
        match err {
            LmError::RateLimited { cooldown, .. } => assert_eq!(cooldown, DEFAULT_COOLDOWN),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
