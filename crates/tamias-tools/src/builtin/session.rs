//! Read-only helpers the LLM can use to inspect its own session.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::registry::ToolHost;
use crate::tool::{Tool, ToolResult};

pub struct StatusTool {
    host: Arc<dyn ToolHost>,
    session_id: String,
}

impl StatusTool {
    pub fn new(host: Arc<dyn ToolHost>, session_id: &str) -> Self {
        Self {
            host,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait]
impl Tool for StatusTool {
    fn name(&self) -> &str {
        "status"
    }

    fn description(&self) -> &str {
        "Show this session's id, model, message count and queue length."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _input: Value) -> ToolResult {
        let Some(handle) = self.host.store().get_session(&self.session_id) else {
            return ToolResult::failure("session no longer exists");
        };
        let queue_length = handle.queue_len();
        let body = handle.with(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "model": s.model,
                "messageCount": s.messages.len(),
                "queueLength": queue_length,
                "summary": s.summary,
            })
        });
        ToolResult::success(body.to_string())
    }
}

pub struct HistoryTool {
    host: Arc<dyn ToolHost>,
    session_id: String,
}

impl HistoryTool {
    pub fn new(host: Arc<dyn ToolHost>, session_id: &str) -> Self {
        Self {
            host,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait]
impl Tool for HistoryTool {
    fn name(&self) -> &str {
        "history"
    }

    fn description(&self) -> &str {
        "Return the most recent turns of this conversation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max turns to return (default 10)" }
            }
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let limit = input
            .get("limit")
            .and_then(|l| l.as_u64())
            .unwrap_or(10)
            .min(100) as usize;
        let Some(handle) = self.host.store().get_session(&self.session_id) else {
            return ToolResult::failure("session no longer exists");
        };
        let turns = handle.with(|s| {
            s.messages
                .iter()
                .rev()
                .take(limit)
                .rev()
                .map(|m| json!({ "role": m.role, "content": m.content }))
                .collect::<Vec<_>>()
        });
        ToolResult::success(json!({ "turns": turns }).to_string())
    }
}
