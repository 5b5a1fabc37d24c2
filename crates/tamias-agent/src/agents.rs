//! Named agents and the orchestrator operations built on them:
//! model-chain resolution and runtime handoff.

use std::sync::Arc;

use tracing::{info, warn};

use tamias_core::error::{Result, TamiasError};
use tamias_core::paths::DataRoot;
use tamias_core::types::{Agent, DaemonEvent, InboundMessage, MessageJob};
use tamias_sessions::{ChatMessage, CreateSessionParams, SessionStore};

/// In-memory view of `agents.json`.
#[derive(Default)]
pub struct AgentsStore {
    agents: Vec<Agent>,
}

impl AgentsStore {
    /// Load from `agents.json`. A missing file is an empty store; a
    /// malformed one is logged and treated as empty — agents are an
    /// optional feature and must never block startup.
    pub fn load(root: &DataRoot) -> Self {
        let path = root.agents_file();
        let agents = match std::fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str::<Vec<Agent>>(&body) {
                Ok(agents) => agents,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "agents.json malformed, ignoring");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        info!(count = agents.len(), "agents loaded");
        Self { agents }
    }

    pub fn from_agents(agents: Vec<Agent>) -> Self {
        Self { agents }
    }

    /// Look up by id or slug.
    pub fn find(&self, key: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == key || a.slug == key)
    }

    pub fn list(&self) -> &[Agent] {
        &self.agents
    }

    /// The enabled agent whose `channels` list claims this channel, if any.
    /// Explicit channel bindings override generic routing.
    pub fn agent_for_channel(&self, channel_id: &str) -> Option<&Agent> {
        self.agents
            .iter()
            .find(|a| a.enabled && a.channels.iter().any(|c| c == channel_id))
    }
}

/// `[agent.model, ...agent.modelFallbacks]` with empty entries dropped.
/// The runner appends the global default chain to produce the full
/// degradation sequence.
pub fn resolve_agent_model_chain(agent: &Agent) -> Vec<String> {
    agent
        .model
        .iter()
        .chain(agent.model_fallbacks.iter())
        .filter(|m| !m.is_empty())
        .cloned()
        .collect()
}

/// Resolve the session a bridge should enqueue into: the indexed session
/// for the pair, or a fresh one. New sessions bind to the agent whose
/// `channels` list claims this channel, when there is one.
pub fn resolve_bridge_session(
    store: &Arc<SessionStore>,
    agents: &AgentsStore,
    channel_id: &str,
    channel_user_id: &str,
    channel_name: Option<String>,
) -> Result<Arc<tamias_sessions::SessionHandle>> {
    if let Some(handle) = store.get_session_for_bridge(channel_id, channel_user_id) {
        return Ok(handle);
    }
    let agent = agents.agent_for_channel(channel_id);
    store.create_session(CreateSessionParams {
        model: agent.and_then(|a| a.model.clone()),
        channel_id: Some(channel_id.to_string()),
        channel_user_id: Some(channel_user_id.to_string()),
        channel_name,
        agent_id: agent.map(|a| a.id.clone()),
        agent_slug: agent.map(|a| a.slug.clone()),
        agent_dir: agent.map(|a| format!("agents/{}", a.slug)),
        ..Default::default()
    })
}

/// Accept one normalised inbound message: resolve (or create) the target
/// session and enqueue the job. Returns the session id; any error means
/// the bridge should roll back its optimistic UI state.
pub fn route_inbound(
    store: &Arc<SessionStore>,
    agents: &AgentsStore,
    message: InboundMessage,
) -> Result<String> {
    let handle = resolve_bridge_session(
        store,
        agents,
        &message.channel_id,
        &message.channel_user_id,
        message.channel_name,
    )?;
    let job = MessageJob {
        content: message.content,
        author_name: message.author_name,
        attachments: message.attachments,
    };
    store.enqueue_job(&handle.id, job)?;
    Ok(handle.id.clone())
}

/// Hand a channel's conversation to a different named agent.
///
/// The channel index swap is a single map insert, so no inbound message can
/// observe a state between the two sessions. The old session is marked
/// inactive and kept; the new session starts from a system note rather than
/// the raw prior history.
pub async fn handoff_session(
    store: &Arc<SessionStore>,
    agents: &AgentsStore,
    session_id: &str,
    target_agent: &str,
    reason: &str,
    context: Option<String>,
) -> Result<String> {
    let target = agents
        .find(target_agent)
        .ok_or_else(|| TamiasError::AgentNotFound {
            id: target_agent.to_string(),
        })?;
    if !target.enabled {
        return Err(TamiasError::AgentDisabled {
            id: target_agent.to_string(),
        });
    }

    let old = store
        .get_session(session_id)
        .ok_or_else(|| TamiasError::SessionNotFound {
            id: session_id.to_string(),
        })?;
    let (channel_id, channel_user_id, channel_name, from_agent, project_slug, tenant_id) =
        old.with(|s| {
            (
                s.channel_id.clone(),
                s.channel_user_id.clone(),
                s.channel_name.clone(),
                s.agent_slug.clone().unwrap_or_else(|| "default".to_string()),
                s.project_slug.clone(),
                s.tenant_id.clone(),
            )
        });

    // Creating the bound session installs the new index entry — that insert
    // is the atomic swap.
    let new = store.create_session(CreateSessionParams {
        model: target.model.clone(),
        channel_id: Some(channel_id),
        channel_user_id: Some(channel_user_id),
        channel_name,
        agent_id: Some(target.id.clone()),
        agent_slug: Some(target.slug.clone()),
        agent_dir: Some(format!("agents/{}", target.slug)),
        project_slug,
        tenant_id,
        ..Default::default()
    })?;

    let mut note = format!(
        "Conversation handed over from agent '{from_agent}'. Reason: {reason}"
    );
    if let Some(context) = context.filter(|c| !c.is_empty()) {
        note.push_str("\n\nContext summary:\n");
        note.push_str(&context);
    }
    new.update(|s| s.messages.push(ChatMessage::system(note)));

    old.update(|s| s.active = false);
    if let Err(e) = store.persist(&old) {
        warn!(error = %e, session = %old.id, "persisting inactive session failed");
    }

    new.emit(DaemonEvent::AgentHandoff {
        from_agent: from_agent.clone(),
        to_agent: target.slug.clone(),
        reason: reason.to_string(),
    });
    info!(from = %from_agent, to = %target.slug, old = %old.id, new = %new.id, "agent handoff");
    Ok(new.id.clone())
}
