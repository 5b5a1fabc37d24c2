//! OpenAI-compatible chat-completions backend.
//!
//! Shared by the `openai`, `openrouter`, and `ollama` connection kinds —
//! they speak the same wire format and differ only in endpoint and auth.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{
    parse_sse_line, ChatRequest, ModelBackend, ProviderError, SseParsed, StreamEvent, Usage,
};

pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    backend_name: String,
    api_key: Option<String>,
    base_url: String,
    chat_path: String,
}

impl OpenAiCompatBackend {
    pub fn openai(name: &str, api_key: String, base_url: Option<String>) -> Self {
        Self::custom(
            name,
            Some(api_key),
            base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
        )
    }

    pub fn openrouter(name: &str, api_key: String, base_url: Option<String>) -> Self {
        Self::custom(
            name,
            Some(api_key),
            base_url.unwrap_or_else(|| "https://openrouter.ai/api".to_string()),
        )
    }

    /// Local Ollama has no auth; the OpenAI-compatible endpoint lives
    /// under `/v1` like the hosted providers.
    pub fn ollama(name: &str, base_url: Option<String>) -> Self {
        Self::custom(
            name,
            None,
            base_url.unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
        )
    }

    fn custom(name: &str, api_key: Option<String>, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            backend_name: name.to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_path: "/v1/chat/completions".to_string(),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}{}", self.base_url, self.chat_path);
        debug!(model = %req.model, backend = %self.backend_name, "streaming chat completion");

        let mut http = self
            .client
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let resp = http.json(&body).send().await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, backend = %self.backend_name, "chat completions error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        process_stream(resp, tx).await;
        Ok(())
    }
}

fn build_request_body(req: &ChatRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": req.system })];
    if let Some(raw) = &req.raw_messages {
        for msg in raw {
            messages.extend(convert_raw_message(msg));
        }
    } else {
        for m in &req.messages {
            messages.push(json!({ "role": m.role, "content": m.content }));
        }
    }

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

/// Convert one Anthropic-style raw message into the OpenAI shape:
/// `tool_use` blocks become `tool_calls` on the assistant message, and
/// `tool_result` blocks become separate `tool`-role messages.
fn convert_raw_message(msg: &Value) -> Vec<Value> {
    let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
    let Some(blocks) = msg.get("content").and_then(|c| c.as_array()) else {
        return vec![msg.clone()];
    };

    let has_tool_use = blocks
        .iter()
        .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"));
    let has_tool_result = blocks
        .iter()
        .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"));

    if has_tool_use && role == "assistant" {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text_parts.push(t.to_string());
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(json!({
                        "id": block.get("id").and_then(|v| v.as_str()).unwrap_or("call_0"),
                        "type": "function",
                        "function": {
                            "name": block.get("name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                            "arguments": block.get("input").cloned().unwrap_or(json!({})).to_string(),
                        }
                    }));
                }
                _ => {}
            }
        }
        let mut out = json!({ "role": "assistant", "tool_calls": tool_calls });
        if !text_parts.is_empty() {
            out["content"] = json!(text_parts.join("\n"));
        }
        return vec![out];
    }

    if has_tool_result {
        return blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
            .map(|b| {
                json!({
                    "role": "tool",
                    "tool_call_id": b.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or(""),
                    "content": b.get("content").and_then(|v| v.as_str()).unwrap_or(""),
                })
            })
            .collect();
    }

    // Plain text blocks — flatten back to a string message.
    let text: Vec<&str> = blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    vec![json!({ "role": role, "content": text.join("\n") })]
}

/// Accumulating state for one streamed tool call.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut usage = Usage::default();
    let mut stop_reason = String::new();
    let mut pending: Vec<PendingToolCall> = Vec::new();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(&data) else {
                continue;
            };
            if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
                usage.tokens_in = u
                    .get("prompt_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                usage.tokens_out = u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
            }
            let Some(choice) = value
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
            else {
                continue;
            };
            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                stop_reason = reason.to_string();
            }
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                if !content.is_empty()
                    && tx
                        .send(StreamEvent::TextDelta {
                            text: content.to_string(),
                        })
                        .await
                        .is_err()
                {
                    return;
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for call in calls {
                    let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                    while pending.len() <= index {
                        pending.push(PendingToolCall::default());
                    }
                    let slot = &mut pending[index];
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        slot.id = id.to_string();
                    }
                    if let Some(f) = call.get("function") {
                        if let Some(name) = f.get("name").and_then(|v| v.as_str()) {
                            slot.name.push_str(name);
                        }
                        if let Some(args) = f.get("arguments").and_then(|v| v.as_str()) {
                            slot.arguments.push_str(args);
                        }
                    }
                }
            }
        }
        line_buf = remainder;
    }

    // Emit the completed tool calls once the stream has ended.
    for call in pending {
        if call.name.is_empty() {
            continue;
        }
        let input = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
        if tx
            .send(StreamEvent::ToolUse {
                id: if call.id.is_empty() {
                    "call_0".to_string()
                } else {
                    call.id
                },
                name: call.name,
                input,
            })
            .await
            .is_err()
        {
            return;
        }
    }

    let _ = tx
        .send(StreamEvent::Done { usage, stop_reason })
        .await;
}
