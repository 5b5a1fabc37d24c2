//! Shared wire types: inbound messages, daemon events, model references.
//!
//! `DaemonEvent` is the canonical transport-agnostic event a session emits.
//! Bridges and the SSE endpoint consume it; nothing else crosses the
//! session boundary.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sentinel response for scheduled heartbeat prompts. When an assistant
/// turn equals this literal exactly (after trimming), bridges must not
/// deliver the accumulated text.
pub const HEARTBEAT_SENTINEL: &str = "HEARTBEAT_OK";

/// Channel id of the local terminal bridge. Sessions bound to it skip
/// dispatcher registration — the terminal reads its emitter directly.
pub const TERMINAL_CHANNEL: &str = "terminal";

/// A message received from a bridge, normalised across transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Bridge instance id (e.g. "discord:main", "telegram:bot1", "terminal").
    pub channel_id: String,
    /// Platform-native conversation id (Discord channel, Telegram chat, …).
    pub channel_user_id: String,
    /// Human-readable channel name, if the platform exposes one.
    pub channel_name: Option<String>,
    /// Platform-native author id.
    pub author_id: Option<String>,
    /// Display name of the author.
    pub author_name: Option<String>,
    /// Plain text content.
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A file attached to an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: Option<String>,
    /// Download URL; attachments are fetched lazily by tool collaborators.
    pub url: Option<String>,
}

/// One queued unit of work for a session: a user message waiting its turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageJob {
    pub content: String,
    pub author_name: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessageJob {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            author_name: None,
            attachments: Vec::new(),
        }
    }
}

/// Terminal status of a sub-agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
}

impl SubagentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubagentStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubagentStatus::Running => "running",
            SubagentStatus::Completed => "completed",
            SubagentStatus::Failed => "failed",
        }
    }
}

/// The canonical event stream a session emits during a turn.
///
/// Serialised as one JSON object per event with a `type` tag — the exact
/// frames the SSE endpoint writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonEvent {
    /// A turn has begun.
    #[serde(rename = "start", rename_all = "camelCase")]
    Start { session_id: String },

    /// Incremental assistant text.
    #[serde(rename = "chunk")]
    Chunk { text: String },

    /// A tool invocation started.
    #[serde(rename = "tool_call")]
    ToolCall {
        name: String,
        input: serde_json::Value,
    },

    /// A tool call completed. Emitted only in debug mode.
    #[serde(rename = "tool_result")]
    ToolResult { name: String, output: String },

    /// Turn finished normally. `suppressed` means the assistant emitted the
    /// heartbeat sentinel and bridges must not deliver the buffered text.
    #[serde(rename = "done", rename_all = "camelCase")]
    Done {
        session_id: String,
        #[serde(default)]
        suppressed: bool,
    },

    /// The turn failed; bridges render a platform-appropriate apology.
    #[serde(rename = "error")]
    Error { message: String },

    /// The turn produced a binary artifact to deliver out-of-band.
    #[serde(rename = "file", rename_all = "camelCase")]
    File {
        name: String,
        #[serde(with = "b64")]
        buffer: Vec<u8>,
        mime_type: String,
    },

    /// Sub-agent lifecycle notification, published on the parent's emitter.
    #[serde(rename = "subagent-status", rename_all = "camelCase")]
    SubagentStatus {
        subagent_id: String,
        parent_session_id: String,
        task: String,
        task_slug: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Channel routing has moved to a different named agent.
    #[serde(rename = "agent-handoff", rename_all = "camelCase")]
    AgentHandoff {
        from_agent: String,
        to_agent: String,
        reason: String,
    },
}

impl DaemonEvent {
    /// True for the two terminal events that close a turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DaemonEvent::Done { .. } | DaemonEvent::Error { .. })
    }
}

/// Base64 transport encoding for binary event payloads.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A parsed `"{connectionNickname}/{modelId}"` model reference.
///
/// The model id may itself contain slashes (OpenRouter ids do), so only the
/// first `/` separates the two parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub nickname: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn parse(s: &str) -> Option<Self> {
        let (nickname, model_id) = s.split_once('/')?;
        if nickname.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(Self {
            nickname: nickname.to_string(),
            model_id: model_id.to_string(),
        })
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.nickname, self.model_id)
    }
}

/// A named persistent agent persona, stored in `agents.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub instructions: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_fallbacks: Vec<String>,
    pub enabled: bool,
    /// Channel ids this agent owns; overrides generic routing.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub extra_skills: Vec<String>,
    /// When non-empty, restricts internal tools to these categories.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub allowed_mcp_servers: Vec<String>,
}

/// Generate a session id: `sess_` plus a 12-char alphanumeric suffix.
pub fn new_session_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..12)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("sess_{suffix}")
}

/// Derive a short slug from a sub-agent task description.
///
/// Lowercased, non-alphanumerics collapsed to single dashes, capped at 32
/// chars. Empty tasks slug to `"task"`.
pub fn task_slug(task: &str) -> String {
    let mut slug = String::with_capacity(32);
    let mut last_dash = true;
    for ch in task.chars().flat_map(|c| c.to_lowercase()) {
        if slug.len() >= 32 {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_splits_on_first_slash_only() {
        let r = ModelRef::parse("router/openai/gpt-4o").expect("parse failed");
        assert_eq!(r.nickname, "router");
        assert_eq!(r.model_id, "openai/gpt-4o");
        assert_eq!(r.to_string(), "router/openai/gpt-4o");
    }

    #[test]
    fn model_ref_rejects_missing_parts() {
        assert!(ModelRef::parse("no-slash").is_none());
        assert!(ModelRef::parse("/model").is_none());
        assert!(ModelRef::parse("nick/").is_none());
    }

    #[test]
    fn session_ids_have_prefix_and_length() {
        let id = new_session_id();
        assert!(id.starts_with("sess_"));
        assert_eq!(id.len(), "sess_".len() + 12);
    }

    #[test]
    fn daemon_event_round_trips_with_type_tag() {
        let ev = DaemonEvent::Done {
            session_id: "sess_abc".into(),
            suppressed: true,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["sessionId"], "sess_abc");
        assert_eq!(json["suppressed"], true);
        let back: DaemonEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, DaemonEvent::Done { suppressed: true, .. }));
    }

    #[test]
    fn file_event_buffer_is_base64_on_the_wire() {
        let ev = DaemonEvent::File {
            name: "out.png".into(),
            buffer: vec![1, 2, 3],
            mime_type: "image/png".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["buffer"], "AQID");
    }

    #[test]
    fn task_slug_collapses_and_caps() {
        assert_eq!(task_slug("Find the Foo!!"), "find-the-foo");
        assert_eq!(task_slug(""), "task");
        assert!(task_slug(&"x".repeat(100)).len() <= 32);
    }
}
