//! Sub-agent lifecycle tools: `spawn`, `callback`, `progress`.
//!
//! `spawn` creates a child session and seeds it with the task; `callback`
//! is how a sub-agent reports its terminal status; `progress` pushes an
//! interim note straight to the parent's bridge. The runner completes the
//! handshake: after a sub-agent's final turn it notifies the parent and
//! enqueues the structured report message.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use tamias_core::types::{task_slug, DaemonEvent, SubagentStatus};
use tamias_sessions::CreateSessionParams;

use crate::registry::ToolHost;
use crate::tool::{Tool, ToolResult};

pub struct SpawnTool {
    host: Arc<dyn ToolHost>,
    session_id: String,
}

impl SpawnTool {
    pub fn new(host: Arc<dyn ToolHost>, session_id: &str) -> Self {
        Self {
            host,
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnInput {
    task: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent session to work on a task in the background. \
         The sub-agent reports back via its callback when finished."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "What the sub-agent should do" },
                "agentId": { "type": "string", "description": "Optional named agent to run as" },
                "model": { "type": "string", "description": "Optional model override ({connection}/{model})" },
                "instructions": { "type": "string", "description": "Extra instructions appended to the task" }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let input: SpawnInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return ToolResult::failure(format!("invalid input: {e}")),
        };
        let store = self.host.store();
        let Some(parent) = store.get_session(&self.session_id) else {
            return ToolResult::failure("calling session no longer exists");
        };

        let agent = match &input.agent_id {
            Some(key) => match self.host.find_agent(key) {
                Some(a) => Some(a),
                None => return ToolResult::failure(format!("Agent not found: {key}")),
            },
            None => None,
        };

        let (channel_id, channel_user_id, channel_name, project_slug, tenant_id) = parent.with(|s| {
            (
                s.channel_id.clone(),
                s.channel_user_id.clone(),
                s.channel_name.clone(),
                s.project_slug.clone(),
                s.tenant_id.clone(),
            )
        });

        let params = CreateSessionParams {
            model: input
                .model
                .or_else(|| agent.as_ref().and_then(|a| a.model.clone())),
            channel_id: Some(channel_id),
            channel_user_id: Some(channel_user_id),
            channel_name,
            parent_session_id: Some(parent.id.clone()),
            is_subagent: true,
            task: Some(input.task.clone()),
            agent_id: agent.as_ref().map(|a| a.id.clone()),
            agent_slug: agent.as_ref().map(|a| a.slug.clone()),
            agent_dir: agent.as_ref().map(|a| format!("agents/{}", a.slug)),
            project_slug,
            tenant_id,
        };

        let child = match store.create_session(params) {
            Ok(c) => c,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        let mut first = input.task.clone();
        if let Some(extra) = &input.instructions {
            first.push_str("\n\nAdditional instructions:\n");
            first.push_str(extra);
        }
        if let Err(e) = store.enqueue_message(&child.id, first, None) {
            return ToolResult::failure(e.to_string());
        }

        let slug = task_slug(&input.task);
        parent.emit(DaemonEvent::SubagentStatus {
            subagent_id: child.id.clone(),
            parent_session_id: parent.id.clone(),
            task: input.task.clone(),
            task_slug: slug.clone(),
            status: "started".to_string(),
            message: None,
        });
        info!(parent = %parent.id, subagent = %child.id, slug = %slug, "sub-agent spawned");

        ToolResult::success(
            json!({ "success": true, "subagentId": child.id, "taskSlug": slug }).to_string(),
        )
    }
}

pub struct CallbackTool {
    host: Arc<dyn ToolHost>,
    session_id: String,
}

impl CallbackTool {
    pub fn new(host: Arc<dyn ToolHost>, session_id: &str) -> Self {
        Self {
            host,
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CallbackInput {
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
}

#[async_trait]
impl Tool for CallbackTool {
    fn name(&self) -> &str {
        "callback"
    }

    fn description(&self) -> &str {
        "Report your final status to the session that spawned you. \
         Call exactly once, when the task is finished or has failed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["completed", "failed"] },
                "outcome": { "type": "string", "description": "What was accomplished" },
                "reason": { "type": "string", "description": "Why the task failed" }
            },
            "required": ["status"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let input: CallbackInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return ToolResult::failure(format!("invalid input: {e}")),
        };
        let status = match input.status.as_str() {
            "completed" => SubagentStatus::Completed,
            "failed" => SubagentStatus::Failed,
            other => return ToolResult::failure(format!("invalid status: {other}")),
        };
        let Some(handle) = self.host.store().get_session(&self.session_id) else {
            return ToolResult::failure("calling session no longer exists");
        };
        if !handle.with(|s| s.is_subagent) {
            return ToolResult::failure("only sub-agents can call subagent__callback");
        }
        handle.update(|s| {
            s.subagent_callback_called = true;
            s.subagent_status = Some(status);
            s.completed_at = Some(chrono::Utc::now().to_rfc3339());
            s.progress = input.outcome.clone().or_else(|| input.reason.clone());
        });
        ToolResult::success(json!({ "success": true }).to_string())
    }
}

pub struct ProgressTool {
    host: Arc<dyn ToolHost>,
    session_id: String,
}

impl ProgressTool {
    pub fn new(host: Arc<dyn ToolHost>, session_id: &str) -> Self {
        Self {
            host,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait]
impl Tool for ProgressTool {
    fn name(&self) -> &str {
        "progress"
    }

    fn description(&self) -> &str {
        "Send an interim progress note to the session that spawned you."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let message = input
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        if message.is_empty() {
            return ToolResult::failure("message is required");
        }
        let store = self.host.store();
        let Some(handle) = store.get_session(&self.session_id) else {
            return ToolResult::failure("calling session no longer exists");
        };
        let (is_subagent, parent_id, task, slug) = handle.with(|s| {
            (
                s.is_subagent,
                s.parent_session_id.clone(),
                s.task.clone().unwrap_or_default(),
                s.task_slug.clone().unwrap_or_default(),
            )
        });
        if !is_subagent {
            return ToolResult::failure("only sub-agents can call subagent__progress");
        }
        let Some(parent) = parent_id.and_then(|id| store.get_session(&id)) else {
            return ToolResult::failure("parent session no longer exists");
        };
        parent.emit(DaemonEvent::SubagentStatus {
            subagent_id: self.session_id.clone(),
            parent_session_id: parent.id.clone(),
            task,
            task_slug: slug,
            status: "progress".to_string(),
            message: Some(message),
        });
        ToolResult::success(json!({ "success": true }).to_string())
    }
}
