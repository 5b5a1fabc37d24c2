//! Google Gemini backend — `streamGenerateContent` over SSE.
//!
//! Gemini has no incremental tool-call deltas: a `functionCall` part
//! arrives complete inside a candidate, so it maps straight to one
//! `ToolUse` event. Raw tool-round blocks are converted to
//! `functionCall`/`functionResponse` parts.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{
    parse_sse_line, ChatRequest, ModelBackend, ProviderError, SseParsed, StreamEvent, Usage,
};

pub struct GoogleBackend {
    client: reqwest::Client,
    backend_name: String,
    api_key: String,
    base_url: String,
}

impl GoogleBackend {
    pub fn new(name: &str, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            backend_name: name.to_string(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl ModelBackend for GoogleBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, req.model
        );
        debug!(model = %req.model, backend = %self.backend_name, "streaming generateContent");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, backend = %self.backend_name, "generateContent error");
            if status == 429 {
                return Err(ProviderError::RateLimited {
                    retry_after_ms: 5000,
                });
            }
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
    let contents: Vec<Value> = match &req.raw_messages {
        Some(raw) => raw.iter().map(convert_raw_message).collect(),
        None => req
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    tamias_sessions::Role::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect(),
    };

    let mut body = json!({
        "contents": contents,
        "systemInstruction": { "parts": [{ "text": req.system }] },
        "generationConfig": { "maxOutputTokens": req.max_tokens },
    });
    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

/// Anthropic-style content blocks → Gemini parts.
fn convert_raw_message(msg: &Value) -> Value {
    let role = match msg.get("role").and_then(|r| r.as_str()) {
        Some("assistant") => "model",
        _ => "user",
    };
    let parts: Vec<Value> = match msg.get("content") {
        Some(Value::String(text)) => vec![json!({ "text": text })],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| match b.get("type").and_then(|t| t.as_str()) {
                Some("text") => Some(json!({ "text": b.get("text").cloned().unwrap_or_default() })),
                Some("tool_use") => Some(json!({
                    "functionCall": {
                        "name": b.get("name").cloned().unwrap_or_default(),
                        "args": b.get("input").cloned().unwrap_or(json!({})),
                    }
                })),
                Some("tool_result") => Some(json!({
                    "functionResponse": {
                        "name": b.get("tool_use_id").cloned().unwrap_or_default(),
                        "response": { "output": b.get("content").cloned().unwrap_or_default() },
                    }
                })),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    json!({ "role": role, "parts": parts })
}

async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut usage = Usage::default();
    let mut stop_reason = String::new();
    let mut call_seq = 0u32;
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
            let Some(SseParsed::Data(data)) = parse_sse_line(line.trim()) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&data) else {
                continue;
            };
            if let Some(meta) = value.get("usageMetadata") {
                usage.tokens_in = meta
                    .get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                usage.tokens_out = meta
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
            }
            let Some(candidate) = value
                .get("candidates")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
            else {
                continue;
            };
            if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
                stop_reason = reason.to_string();
            }
            let Some(parts) = candidate
                .pointer("/content/parts")
                .and_then(|p| p.as_array())
            else {
                continue;
            };
            for part in parts {
                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                    if !t.is_empty()
                        && tx
                            .send(StreamEvent::TextDelta {
                                text: t.to_string(),
                            })
                            .await
                            .is_err()
                    {
                        return;
                    }
                }
                if let Some(call) = part.get("functionCall") {
                    call_seq += 1;
                    let event = StreamEvent::ToolUse {
                        id: format!("call_{call_seq}"),
                        name: call
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        input: call.get("args").cloned().unwrap_or(json!({})),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done { usage, stop_reason })
        .await;
}
