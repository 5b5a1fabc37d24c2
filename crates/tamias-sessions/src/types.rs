use serde::{Deserialize, Serialize};

use tamias_core::types::SubagentStatus;

/// One turn in a session's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A conversation's persisted state.
///
/// Runtime-only state (the job queue, the `processing` flag, the event
/// emitter, attached background tasks) lives on
/// [`SessionHandle`](crate::store::SessionHandle) and is rebuilt on load —
/// a saved-then-loaded session equals the original modulo those fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// `"{connectionNickname}/{modelId}"`.
    pub model: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Binding to the originating bridge; `"terminal"` is the local CLI.
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub channel_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,

    // Sub-agent fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub is_subagent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_status: Option<SubagentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default)]
    pub subagent_callback_called: bool,

    // Named-agent binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_dir: Option<String>,

    // Optional scoping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Cleared on handoff — an inactive session receives no bridge input
    /// but is kept on disk.
    #[serde(default = "bool_true")]
    pub active: bool,
}

impl Session {
    /// Whether `name` still looks auto-generated (unset or a `sess_` id) —
    /// compaction may adopt a model-suggested name in that case.
    pub fn name_is_auto(&self) -> bool {
        match &self.name {
            None => true,
            Some(n) => n.is_empty() || n.starts_with("sess_"),
        }
    }
}

/// The list-view projection served by `GET /sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub model: String,
    pub queue_length: usize,
    pub updated_at: String,
    pub is_subagent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagent_status: Option<SubagentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawned_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_name_detection() {
        let mut s = Session {
            id: "sess_x".into(),
            name: None,
            summary: None,
            model: "openai/gpt-4o".into(),
            created_at: String::new(),
            updated_at: String::new(),
            messages: vec![],
            channel_id: String::new(),
            channel_user_id: String::new(),
            channel_name: None,
            parent_session_id: None,
            is_subagent: false,
            task: None,
            task_slug: None,
            subagent_status: None,
            spawned_at: None,
            completed_at: None,
            progress: None,
            subagent_callback_called: false,
            agent_id: None,
            agent_slug: None,
            agent_dir: None,
            project_slug: None,
            tenant_id: None,
            active: true,
        };
        assert!(s.name_is_auto());
        s.name = Some("sess_abcdef".into());
        assert!(s.name_is_auto());
        s.name = Some("Weekend trip".into());
        assert!(!s.name_is_auto());
    }
}
