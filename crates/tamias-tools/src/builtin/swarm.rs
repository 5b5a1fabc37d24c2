//! Multi-agent routing tools: `transfer_to_agent` and `list_agents`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::ToolHost;
use crate::tool::{Tool, ToolResult};

pub struct TransferToAgentTool {
    host: Arc<dyn ToolHost>,
    session_id: String,
}

impl TransferToAgentTool {
    pub fn new(host: Arc<dyn ToolHost>, session_id: &str) -> Self {
        Self {
            host,
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TransferInput {
    agent: String,
    reason: String,
    #[serde(default)]
    context: Option<String>,
}

#[async_trait]
impl Tool for TransferToAgentTool {
    fn name(&self) -> &str {
        "transfer_to_agent"
    }

    fn description(&self) -> &str {
        "Hand this conversation over to a different named agent. The channel \
         is atomically rebound; future user messages reach the target agent."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": { "type": "string", "description": "Target agent id or slug" },
                "reason": { "type": "string", "description": "Why the handoff is happening" },
                "context": { "type": "string", "description": "Compressed context for the target agent" }
            },
            "required": ["agent", "reason"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let input: TransferInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return ToolResult::failure(format!("invalid input: {e}")),
        };
        match self
            .host
            .handoff(&self.session_id, &input.agent, &input.reason, input.context)
            .await
        {
            Ok(new_session_id) => ToolResult::success(
                json!({ "success": true, "newSessionId": new_session_id }).to_string(),
            ),
            Err(e) => ToolResult::failure(e),
        }
    }
}

pub struct ListAgentsTool {
    host: Arc<dyn ToolHost>,
}

impl ListAgentsTool {
    pub fn new(host: Arc<dyn ToolHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        "list_agents"
    }

    fn description(&self) -> &str {
        "List the named agents available for handoff."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _input: Value) -> ToolResult {
        let agents: Vec<Value> = self
            .host
            .agents()
            .into_iter()
            .filter(|a| a.enabled)
            .map(|a| json!({ "id": a.id, "slug": a.slug, "name": a.name }))
            .collect();
        ToolResult::success(json!({ "agents": agents }).to_string())
    }
}
