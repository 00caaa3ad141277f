//! Server-sent-event parsing for streamed chat completions.
//!
//! Lines arrive as `data: <JSON>` with a literal `data: [DONE]` terminator.
//! The adapter buffers partial lines across network chunks and yields one
//! [`StreamDelta`] per data line.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;

use super::{LmError, Usage};

/// One parsed streaming delta.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    /// Text content fragment.
    pub content: Option<String>,
    /// Tool-call fragments, keyed by index for reassembly.
    pub tool_calls: Vec<ToolCallFragment>,
    /// Finish reason, present on the closing chunk of a choice.
    pub finish_reason: Option<String>,
    /// Usage, present on the final chunk when requested.
    pub usage: Option<Usage>,
    /// The raw data line this delta was parsed from.
    pub raw: String,
}

/// A partial tool call as it appears across stream chunks.
#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment {
    /// Position in the call list.
    pub index: usize,
    /// Call id (first fragment only).
    pub id: Option<String>,
    /// Function name (first fragment only).
    pub name: Option<String>,
    /// Argument JSON text fragment.
    pub arguments: String,
}

/// SSE parser over a byte stream.
pub struct SseStream<S> {
    inner: S,
    buffer: String,
    done: bool,
}

impl<S> SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    /// Wrap a response byte stream.
    pub const fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: String::new(),
            done: false,
        }
    }

    /// Parse a single SSE line into a delta. `None` for blanks, comments
    /// and the `[DONE]` terminator.
    fn parse_line(line: &str) -> Option<Result<StreamDelta, LmError>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return None;
        }
        let data = trimmed.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            return None;
        }
        match serde_json::from_str::<WireChunk>(data) {
            Ok(chunk) => Some(Ok(Self::chunk_to_delta(chunk, data))),
            Err(e) => Some(Err(LmError::Protocol {
                message: format!("bad stream chunk: {e}"),
            })),
        }
    }

    fn chunk_to_delta(chunk: WireChunk, raw: &str) -> StreamDelta {
        let mut delta = StreamDelta {
            raw: raw.to_string(),
            usage: chunk.usage,
            ..StreamDelta::default()
        };
        if let Some(choice) = chunk.choices.into_iter().next() {
            delta.content = choice.delta.content;
            delta.finish_reason = choice.finish_reason;
            if let Some(calls) = choice.delta.tool_calls {
                delta.tool_calls = calls
                    .into_iter()
                    .map(|tc| ToolCallFragment {
                        index: tc.index.unwrap_or(0),
                        id: tc.id,
                        name: tc.function.as_ref().and_then(|f| f.name.clone()),
                        arguments: tc
                            .function
                            .and_then(|f| f.arguments)
                            .unwrap_or_default(),
                    })
                    .collect();
            }
        }
        delta
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<StreamDelta, LmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            // Drain complete lines from the buffer first.
            if let Some(newline) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=newline).collect();
                if let Some(result) = Self::parse_line(&line) {
                    return Poll::Ready(Some(result));
                }
                continue;
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(LmError::Transport {
                        message: e.to_string(),
                    })));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    // Flush whatever is left without a trailing newline.
                    let remaining = std::mem::take(&mut self.buffer);
                    for line in remaining.lines() {
                        if let Some(result) = Self::parse_line(line) {
                            return Poll::Ready(Some(result));
                        }
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// Wire-format structures for one streamed chunk.

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<WireFunction>,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: Option<String>,
    arguments: Option<String>,
}
