//! HTTP client for the chat-completions endpoint.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::streaming::SseStream;
use super::{ChatRequest, LmError, LmResponse, RawToolCall, Usage, rate_limited};
use crate::config::{EndpointConfig, TierTable};
use crate::events::{Event, EventBus};
use crate::message::{Message, Role};

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
///
/// Cheap to clone; all clones share the connection pool and event bus.
#[derive(Clone)]
pub struct LmClient {
    http: reqwest::Client,
    endpoint: EndpointConfig,
    tiers: TierTable,
    bus: EventBus,
}

impl std::fmt::Debug for LmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmClient")
            .field("base_url", &self.endpoint.base_url)
            .finish_non_exhaustive()
    }
}

impl LmClient {
    /// Build a client for the configured endpoint.
    pub fn new(
        endpoint: EndpointConfig,
        tiers: TierTable,
        bus: EventBus,
    ) -> Result<Self, LmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LmError::Transport {
                message: format!("http client: {e}"),
            })?;
        Ok(Self {
            http,
            endpoint,
            tiers,
            bus,
        })
    }

    /// Issue one chat-completion request, streaming or not.
    ///
    /// During streaming, token deltas are published as
    /// [`Event::LmTokenChunk`]. The whole attempt is bounded by the
    /// configured request timeout, and aborted when `cancel` fires.
    pub async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<LmResponse, LmError> {
        let timeout_secs = self.endpoint.request_timeout_secs;
        let deadline = Duration::from_secs(timeout_secs);
        let attempt = self.chat_inner(request);

        tokio::select! {
            () = cancel.cancelled() => Err(LmError::Transport {
                message: "request aborted by cancellation".to_string(),
            }),
            result = tokio::time::timeout(deadline, attempt) => match result {
                Ok(inner) => inner,
                Err(_) => Err(LmError::Timeout { secs: timeout_secs }),
            },
        }
    }

    async fn chat_inner(&self, request: &ChatRequest) -> Result<LmResponse, LmError> {
        let model = self.tiers.resolve(request.tier);
        let body = self.build_body(request, model);
        debug!(model, stream = request.stream, messages = request.messages.len(), "chat request");

        let url = format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'));
        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| LmError::Transport {
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || super::rate_limit_lexicon_matches(&text) {
                warn!(%status, "endpoint rate limited");
                return Err(rate_limited(text));
            }
            return Err(LmError::Transport {
                message: format!("HTTP {status}: {text}"),
            });
        }

        if request.stream {
            self.collect_stream(response).await
        } else {
            let envelope: Value = response.json().await.map_err(|e| LmError::Protocol {
                message: format!("bad response body: {e}"),
            })?;
            Self::parse_single(&envelope)
        }
    }

    /// Assemble a response from an SSE stream, publishing token chunks.
    async fn collect_stream(&self, response: reqwest::Response) -> Result<LmResponse, LmError> {
        let mut stream = SseStream::new(response.bytes_stream());
        let mut out = LmResponse::default();
        // Tool-call fragments are keyed by index and concatenated.
        let mut calls: Vec<RawToolCall> = Vec::new();

        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if !delta.raw.is_empty() {
                out.raw_chunks.push_str(&delta.raw);
                out.raw_chunks.push('\n');
            }
            if let Some(text) = delta.content {
                if !text.is_empty() {
                    self.bus.emit(Event::LmTokenChunk { text: text.clone() });
                    out.assistant_text.push_str(&text);
                }
            }
            for fragment in delta.tool_calls {
                if fragment.index >= calls.len() {
                    calls.resize_with(fragment.index + 1, RawToolCall::default);
                }
                let slot = &mut calls[fragment.index];
                if let Some(id) = fragment.id {
                    slot.id = id;
                }
                if let Some(name) = fragment.name {
                    slot.name = name;
                }
                slot.arguments.push_str(&fragment.arguments);
            }
            if delta.finish_reason.is_some() {
                out.finish_reason = delta.finish_reason;
            }
            if delta.usage.is_some() {
                out.usage = delta.usage;
            }
        }

        out.tool_calls = calls.into_iter().filter(|c| !c.name.is_empty()).collect();
        Ok(out)
    }

    /// Parse a non-streaming response envelope.
    fn parse_single(envelope: &Value) -> Result<LmResponse, LmError> {
        let choice = envelope["choices"].get(0).ok_or_else(|| LmError::Protocol {
            message: "no choices in response".to_string(),
        })?;
        let message = &choice["message"];

        let mut out = LmResponse {
            assistant_text: message["content"].as_str().unwrap_or_default().to_string(),
            finish_reason: choice["finish_reason"].as_str().map(String::from),
            ..LmResponse::default()
        };

        if let Some(array) = message["tool_calls"].as_array() {
            out.tool_calls = array
                .iter()
                .map(|tc| RawToolCall {
                    id: tc["id"].as_str().unwrap_or_default().to_string(),
                    name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: match &tc["function"]["arguments"] {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                })
                .filter(|c| !c.name.is_empty())
                .collect();
        }

        out.usage = envelope.get("usage").and_then(|u| {
            serde_json::from_value::<Usage>(u.clone()).ok()
        });
        Ok(out)
    }

    /// Build the request body in wire format.
    fn build_body(&self, request: &ChatRequest, model: &str) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(Self::message_to_wire).collect();
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": request.stream,
        });
        if request.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                body["stop"] = json!(stop);
            }
        }
        if let Some(tools) = &request.tool_schemas {
            if !tools.is_empty() {
                body["tools"] = json!(tools);
                body["tool_choice"] = json!("auto");
            }
        }
        body
    }

    fn message_to_wire(msg: &Message) -> Value {
        let mut obj = json!({
            "role": msg.role.as_str(),
            "content": msg.content,
        });
        if let Some(calls) = &msg.tool_calls {
            let wire: Vec<Value> = calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": Value::Object(c.arguments.clone()).to_string(),
                        }
                    })
                })
                .collect();
            obj["tool_calls"] = json!(wire);
        }
        if msg.role == Role::Tool {
            if let Some(id) = &msg.tool_call_id {
                obj["tool_call_id"] = json!(id);
            }
            if let Some(name) = &msg.name {
                obj["name"] = json!(name);
            }
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tier;
    use crate::message::ToolCall;

    fn client() -> LmClient {
        LmClient::new(EndpointConfig::default(), TierTable::default(), EventBus::new()).unwrap()
    }

    #[test]
    fn test_body_includes_tier_model() {
        let c = client();
        let request = ChatRequest::new(vec![Message::user("hi")], Tier::Large);
        let body = c.build_body(&request, c.tiers.resolve(request.tier));
        assert_eq!(body["model"], "qwen2.5-coder:32b");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_tool_message_wire_shape() {
        let msg = Message::tool("call_1", "read_file", "contents");
        let wire = LmClient::message_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
        assert_eq!(wire["name"], "read_file");
    }

    #[test]
    fn test_assistant_calls_serialize_arguments_as_string() {
        let mut args = serde_json::Map::new();
        args.insert("path".into(), Value::String("a.py".into()));
        let msg = Message::assistant_with_calls("", vec![ToolCall::new("c1", "read_file", args)]);
        let wire = LmClient::message_to_wire(&msg);
        let arguments = wire["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        assert_eq!(arguments, "{\"path\":\"a.py\"}");
    }

    #[test]
    fn test_parse_single_with_native_calls() {
        let envelope = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "git_status", "arguments": "{}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        });
        let resp = LmClient::parse_single(&envelope).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "git_status");
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(resp.usage.unwrap().prompt_tokens, 10);
    }
}
