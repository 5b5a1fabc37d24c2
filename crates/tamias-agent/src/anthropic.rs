//! Anthropic Messages API backend.
//!
//! Raw tool-round messages already use Anthropic content blocks, so this
//! backend passes them through untouched. SSE event flow:
//! `message_start → content_block_start/delta/stop* → message_delta →
//! message_stop`; `tool_use` blocks accumulate `input_json_delta` fragments
//! until their `content_block_stop`.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{
    parse_sse_line, ChatRequest, ModelBackend, ProviderError, SseParsed, StreamEvent, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    client: reqwest::Client,
    backend_name: String,
    api_key: String,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(name: &str, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            backend_name: name.to_string(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.anthropic.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %req.model, backend = %self.backend_name, "streaming messages request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

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
            warn!(status, body = %text, backend = %self.backend_name, "messages API error");
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
    let messages: Vec<Value> = match &req.raw_messages {
        Some(raw) => raw.clone(),
        None => req
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect(),
    };

    let mut body = json!({
        "model": req.model,
        "system": req.system,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": true,
    });
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut current_event = String::new();
    let mut block_type = String::new();
    let mut tool_id = String::new();
    let mut tool_name = String::new();
    let mut tool_input_json = String::new();
    let mut usage = Usage::default();
    let mut stop_reason = String::new();
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
            if line.is_empty() {
                continue;
            }
            match parse_sse_line(line) {
                Some(SseParsed::Event(ev)) => current_event = ev,
                Some(SseParsed::Data(data)) => {
                    let Ok(value) = serde_json::from_str::<Value>(&data) else {
                        continue;
                    };
                    match current_event.as_str() {
                        "message_start" => {
                            usage.tokens_in = value
                                .pointer("/message/usage/input_tokens")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(0) as u32;
                        }
                        "content_block_start" => {
                            block_type = value
                                .pointer("/content_block/type")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string();
                            if block_type == "tool_use" {
                                tool_id = value
                                    .pointer("/content_block/id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                tool_name = value
                                    .pointer("/content_block/name")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                tool_input_json.clear();
                            }
                        }
                        "content_block_delta" => {
                            match value.pointer("/delta/type").and_then(|v| v.as_str()) {
                                Some("text_delta") => {
                                    if let Some(t) =
                                        value.pointer("/delta/text").and_then(|v| v.as_str())
                                    {
                                        if tx
                                            .send(StreamEvent::TextDelta {
                                                text: t.to_string(),
                                            })
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                                Some("input_json_delta") => {
                                    if let Some(j) = value
                                        .pointer("/delta/partial_json")
                                        .and_then(|v| v.as_str())
                                    {
                                        tool_input_json.push_str(j);
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            if block_type == "tool_use" {
                                let input = serde_json::from_str(&tool_input_json)
                                    .unwrap_or(json!({}));
                                if tx
                                    .send(StreamEvent::ToolUse {
                                        id: std::mem::take(&mut tool_id),
                                        name: std::mem::take(&mut tool_name),
                                        input,
                                    })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            block_type.clear();
                        }
                        "message_delta" => {
                            if let Some(r) =
                                value.pointer("/delta/stop_reason").and_then(|v| v.as_str())
                            {
                                stop_reason = r.to_string();
                            }
                            if let Some(out) = value
                                .pointer("/usage/output_tokens")
                                .and_then(|v| v.as_u64())
                            {
                                usage.tokens_out = out as u32;
                            }
                        }
                        "error" => {
                            let message = value
                                .pointer("/error/message")
                                .and_then(|v| v.as_str())
                                .unwrap_or("stream error")
                                .to_string();
                            let _ = tx.send(StreamEvent::Error { message }).await;
                            return;
                        }
                        _ => {}
                    }
                }
                None => {}
            }
        }
        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done { usage, stop_reason })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tamias_sessions::ChatMessage;

    #[test]
    fn body_keeps_system_out_of_messages() {
        let req = ChatRequest {
            model: "claude-sonnet-4-5".into(),
            system: "persona".into(),
            messages: vec![ChatMessage::user("hi")],
            raw_messages: None,
            tools: vec![],
            max_tokens: 2048,
        };
        let body = build_request_body(&req);
        assert_eq!(body["system"], "persona");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn raw_messages_pass_through_untouched() {
        let raw = vec![json!({
            "role": "user",
            "content": [{ "type": "tool_result", "tool_use_id": "t1", "content": "ok" }]
        })];
        let req = ChatRequest {
            model: "claude-sonnet-4-5".into(),
            system: String::new(),
            messages: vec![],
            raw_messages: Some(raw.clone()),
            tools: vec![],
            max_tokens: 2048,
        };
        let body = build_request_body(&req);
        assert_eq!(body["messages"], json!(raw));
    }
}
