//! Session compaction — rolling summarisation of long conversations.
//!
//! Scheduled fire-and-forget after a turn pushes `messages` past the
//! threshold. A separate LLM call produces
//! `{summary, sessionName?, insights?}`; on success the history collapses
//! to a summary-bearing system turn plus the last few messages. Any
//! failure is logged and swallowed — compaction must never fail the
//! user-facing turn.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tamias_sessions::{ChatMessage, SessionHandle, SessionStore};

use crate::provider::{ChatRequest, ModelBackend, ProviderError, StreamEvent};

/// Message count that triggers compaction.
pub const COMPACTION_THRESHOLD: usize = 20;
/// Turns kept verbatim after compaction.
pub const KEEP_LAST_TURNS: usize = 4;

const COMPACTION_PROMPT: &str = "\
You summarise conversations for long-term context. Read the transcript and \
return ONLY a JSON object, no prose and no code fences, with these keys: \
\"summary\" (required, at most 200 words, covering decisions, facts and \
open threads), \"sessionName\" (optional, a short human title for the \
conversation), \"insights\" (optional, an array of short strings worth \
remembering about the user or their projects).";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompactionReply {
    summary: String,
    #[serde(default)]
    session_name: Option<String>,
    #[serde(default)]
    insights: Option<Vec<String>>,
}

/// Run one compaction pass against the session's own model.
pub async fn compact_session(
    store: Arc<SessionStore>,
    handle: Arc<SessionHandle>,
    backend: Arc<dyn ModelBackend>,
    model_id: String,
) {
    let snapshot = handle.snapshot();
    if snapshot.messages.len() < COMPACTION_THRESHOLD {
        return;
    }

    let transcript: String = snapshot
        .messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let req = ChatRequest {
        model: model_id,
        system: COMPACTION_PROMPT.to_string(),
        messages: vec![ChatMessage::user(format!(
            "Summarise this conversation:\n\n{transcript}"
        ))],
        raw_messages: None,
        tools: Vec::new(),
        max_tokens: 1024,
    };

    let text = match collect_text(backend.as_ref(), &req).await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, session = %handle.id, "compaction model call failed");
            return;
        }
    };

    let reply: CompactionReply = match serde_json::from_str(strip_fences(&text)) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, session = %handle.id, "compaction reply was not valid JSON");
            return;
        }
    };
    if reply.summary.trim().is_empty() {
        warn!(session = %handle.id, "compaction returned an empty summary");
        return;
    }

    handle.update(|s| {
        s.summary = Some(reply.summary.clone());
        if let Some(name) = &reply.session_name {
            if s.name_is_auto() && !name.trim().is_empty() {
                s.name = Some(name.trim().to_string());
            }
        }
        let keep_from = s.messages.len().saturating_sub(KEEP_LAST_TURNS);
        let tail: Vec<ChatMessage> = s.messages.split_off(keep_from);
        s.messages = Vec::with_capacity(tail.len() + 1);
        s.messages.push(ChatMessage::system(format!(
            "Conversation summary: {}",
            reply.summary
        )));
        s.messages.extend(tail);
    });

    if let Some(insights) = reply.insights.filter(|i| !i.is_empty()) {
        write_insights(&store, &handle, &insights);
    }

    if let Err(e) = store.persist(&handle) {
        warn!(error = %e, session = %handle.id, "persisting compacted session failed");
    }
    info!(session = %handle.id, "session compacted");
}

/// Drain a non-tool stream into a single string.
async fn collect_text(
    backend: &dyn ModelBackend,
    req: &ChatRequest,
) -> Result<String, ProviderError> {
    let (tx, mut rx) = mpsc::channel(64);
    let mut text = String::new();
    let mut stream_error = None;

    let stream = backend.stream(req, tx);
    let collect = async {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta { text: t } => text.push_str(&t),
                StreamEvent::Error { message } => stream_error = Some(message),
                _ => {}
            }
        }
    };
    let (result, ()) = tokio::join!(stream, collect);
    result?;
    if let Some(message) = stream_error {
        return Err(ProviderError::Parse(message));
    }
    Ok(text)
}

/// Persona insights go next to the bound agent's files, or into today's
/// daily note otherwise. Best-effort.
fn write_insights(store: &SessionStore, handle: &SessionHandle, insights: &[String]) {
    let root = store.data_root();
    let snapshot = handle.snapshot();
    let path = match &snapshot.agent_slug {
        Some(slug) => root.agent_dir(slug).join("INSIGHTS.md"),
        None => root
            .memory_dir()
            .join("daily")
            .join(format!("{}.md", chrono::Utc::now().format("%Y-%m-%d"))),
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut body = String::new();
    for line in insights {
        body.push_str("- ");
        body.push_str(line);
        body.push('\n');
    }
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    if let Err(e) = std::fs::write(&path, format!("{existing}{body}")) {
        warn!(error = %e, path = %path.display(), "writing insights failed");
    }
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockTurn};
    use tamias_core::config::{Connection, Provider, TamiasConfig};
    use tamias_core::paths::DataRoot;
    use tamias_sessions::CreateSessionParams;

    fn test_store() -> (tempfile::TempDir, Arc<SessionStore>) {
        let mut config = TamiasConfig::default();
        config.connections.insert(
            "openai".to_string(),
            Connection {
                provider: Provider::OpenAi,
                env_key_name: "OPENAI_API_KEY".to_string(),
                base_url: None,
                selected_models: vec!["gpt-4o".to_string()],
            },
        );
        config.default_models = vec!["openai/gpt-4o".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(DataRoot::at(dir.path()), config));
        (dir, store)
    }

    #[tokio::test]
    async fn compaction_collapses_history_and_names_session() {
        let (_dir, store) = test_store();
        let handle = store.create_session(CreateSessionParams::default()).unwrap();
        handle.update(|s| {
            for i in 0..COMPACTION_THRESHOLD {
                s.messages.push(ChatMessage::user(format!("msg {i}")));
            }
        });

        let backend = MockBackend::new(
            "openai",
            vec![MockTurn::text(
                r#"{"summary":"Planning a trip to Lapland.","sessionName":"Lapland trip","insights":["User prefers trains"]}"#,
            )],
        );
        compact_session(store.clone(), handle.clone(), backend, "gpt-4o".into()).await;

        handle.with(|s| {
            assert_eq!(s.messages.len(), KEEP_LAST_TURNS + 1);
            assert!(s.messages[0].content.contains("Lapland"));
            assert_eq!(s.summary.as_deref(), Some("Planning a trip to Lapland."));
            assert_eq!(s.name.as_deref(), Some("Lapland trip"));
        });
    }

    #[tokio::test]
    async fn failed_compaction_leaves_session_untouched() {
        let (_dir, store) = test_store();
        let handle = store.create_session(CreateSessionParams::default()).unwrap();
        handle.update(|s| {
            for i in 0..COMPACTION_THRESHOLD {
                s.messages.push(ChatMessage::user(format!("msg {i}")));
            }
        });

        let backend = MockBackend::new("openai", vec![MockTurn::text("not json")]);
        compact_session(store.clone(), handle.clone(), backend, "gpt-4o".into()).await;

        handle.with(|s| {
            assert_eq!(s.messages.len(), COMPACTION_THRESHOLD);
            assert!(s.summary.is_none());
        });
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
    }
}
