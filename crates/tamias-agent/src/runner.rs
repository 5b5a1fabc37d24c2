//! The session runner — one step-bounded tool-using turn at a time.
//!
//! Per-session ordering is strict: the `processing` flag admits exactly one
//! turn, the queue preserves FIFO order, and the emitted event sequence is
//! `start → (chunk|tool_call|tool_result|subagent-status|file)* →
//! done|error`. Across sessions everything runs concurrently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tamias_core::config::TURN_TIMEOUT_SECS;
use tamias_core::types::{
    DaemonEvent, MessageJob, ModelRef, SubagentStatus, HEARTBEAT_SENTINEL,
};
use tamias_sessions::{ChatMessage, Role, SessionHandle, SessionStore};
use tamias_tools::{build_active_tools, ActiveTools, ToolHost, ToolResult};

use crate::agents::{resolve_agent_model_chain, AgentsStore};
use crate::compact;
use crate::provider::{BackendFactory, ChatRequest, StreamEvent, Usage, DEFAULT_MAX_TOKENS};

/// Hard cap on tool-call rounds within one user turn.
pub const MAX_STEPS: usize = 20;

/// Cap on the synthesised fallback report for sub-agents that never call
/// their callback.
const FALLBACK_REPORT_CHARS: usize = 500;

pub struct Runner {
    store: Arc<SessionStore>,
    agents: Arc<AgentsStore>,
    factory: Arc<dyn BackendFactory>,
    host: Arc<dyn ToolHost>,
    shutdown: CancellationToken,
    debug: bool,
}

struct TurnOutcome {
    full_response: String,
    usage: Usage,
    model: ModelRef,
}

enum DriveError {
    Shutdown,
    Provider(String),
}

impl Runner {
    pub fn new(
        store: Arc<SessionStore>,
        agents: Arc<AgentsStore>,
        factory: Arc<dyn BackendFactory>,
        host: Arc<dyn ToolHost>,
        shutdown: CancellationToken,
        debug: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            agents,
            factory,
            host,
            shutdown,
            debug,
        })
    }

    /// Consume wake-ups from the store and fan each out to its own task.
    pub fn spawn_loop(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(session_id) = rx.recv().await {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    runner.process_session(&session_id).await;
                });
            }
        })
    }

    /// Drain a session's queue, one turn at a time. Returns immediately
    /// when a turn is already in flight or nothing is queued.
    pub async fn process_session(&self, session_id: &str) {
        let Some(handle) = self.store.get_session(session_id) else {
            return;
        };
        loop {
            if !handle.try_begin_turn() {
                return;
            }
            let Some(job) = handle.pop_job() else {
                handle.end_turn();
                return;
            };
            // A terminal sub-agent publishes nothing further; drop the job.
            let terminal = handle.with(|s| {
                s.is_subagent
                    && s.subagent_status.map(|st| st.is_terminal()).unwrap_or(false)
                    && s.subagent_callback_called
            });
            if terminal {
                debug!(session = %handle.id, "dropping job for terminal sub-agent");
                handle.end_turn();
                continue;
            }
            self.run_turn(&handle, job).await;
            handle.end_turn();
            if handle.queue_len() == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn run_turn(&self, handle: &Arc<SessionHandle>, job: MessageJob) {
        let started = Instant::now();
        let user_content = match &job.author_name {
            Some(author) => format!("{author}: {}", job.content),
            None => job.content.clone(),
        };
        handle.update(|s| s.messages.push(ChatMessage::user(user_content.clone())));

        let chain = self.resolve_chain(handle);
        if chain.is_empty() {
            handle.emit(DaemonEvent::Error {
                message: "No model configured for this session".to_string(),
            });
            return;
        }

        let active = build_active_tools(&self.host, handle).await;
        let snapshot = handle.snapshot();
        let agent = snapshot
            .agent_id
            .as_deref()
            .or(snapshot.agent_slug.as_deref())
            .and_then(|key| self.agents.find(key))
            .cloned();
        let system = crate::prompt::compose(
            self.store.data_root(),
            &snapshot,
            agent.as_ref(),
            &active.tool_names,
        );

        handle.emit(DaemonEvent::Start {
            session_id: handle.id.clone(),
        });

        let outcome = match tokio::time::timeout(
            Duration::from_secs(TURN_TIMEOUT_SECS),
            self.drive_chain(handle, &chain, &system, &snapshot.messages, &active),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!("turn timed out after {TURN_TIMEOUT_SECS}s")),
        };
        active.shutdown().await;

        match outcome {
            Ok(outcome) => {
                let suppressed = outcome.full_response.trim() == HEARTBEAT_SENTINEL;
                let now = chrono::Utc::now().to_rfc3339();
                handle.update(|s| {
                    s.messages
                        .push(ChatMessage::assistant(outcome.full_response.clone()));
                    s.updated_at = now;
                });
                if let Err(e) = self.store.persist(handle) {
                    warn!(error = %e, session = %handle.id, "snapshot write failed, next turn will re-persist");
                }
                handle.emit(DaemonEvent::Done {
                    session_id: handle.id.clone(),
                    suppressed,
                });
                let model = outcome.model.to_string();
                self.store.log_usage(
                    &handle.id,
                    &model,
                    outcome.usage.tokens_in,
                    outcome.usage.tokens_out,
                    started.elapsed().as_millis() as u64,
                );
                self.store
                    .mirror_turn(handle, &user_content, &outcome.full_response);
                info!(
                    session = %handle.id,
                    model = %model,
                    tokens_in = outcome.usage.tokens_in,
                    tokens_out = outcome.usage.tokens_out,
                    "turn complete"
                );

                self.maybe_compact(handle, &outcome.model);
                self.finish_subagent(handle, &outcome.full_response);
            }
            Err(message) => {
                warn!(session = %handle.id, error = %message, "turn failed");
                handle.emit(DaemonEvent::Error { message });
            }
        }
    }

    /// The effective degradation sequence: the bound agent's chain, then
    /// the session's own binding, then the global defaults — deduplicated,
    /// unknown connections pruned.
    fn resolve_chain(&self, handle: &SessionHandle) -> Vec<ModelRef> {
        let (agent_key, session_model) =
            handle.with(|s| (s.agent_id.clone().or_else(|| s.agent_slug.clone()), s.model.clone()));

        let mut entries: Vec<String> = Vec::new();
        if let Some(agent) = agent_key.as_deref().and_then(|k| self.agents.find(k)) {
            entries.extend(resolve_agent_model_chain(agent));
        }
        entries.push(session_model);
        entries.extend(self.store.config().default_models.iter().cloned());

        let mut chain = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for entry in entries {
            if !seen.insert(entry.clone()) {
                continue;
            }
            let Some(model_ref) = ModelRef::parse(&entry) else {
                warn!(entry = %entry, "unparseable model chain entry dropped");
                continue;
            };
            if !self
                .store
                .config()
                .connections
                .contains_key(&model_ref.nickname)
            {
                debug!(entry = %entry, "chain entry pruned, connection unknown");
                continue;
            }
            chain.push(model_ref);
        }
        chain
    }

    /// Walk the model chain until one model completes the turn.
    async fn drive_chain(
        &self,
        handle: &Arc<SessionHandle>,
        chain: &[ModelRef],
        system: &str,
        history: &[ChatMessage],
        active: &ActiveTools,
    ) -> Result<TurnOutcome, String> {
        let mut raw: Vec<Value> = history.iter().map(history_to_raw).collect();
        let mut full_response = String::new();
        let mut last_reason = String::from("no models in chain");

        for (i, model_ref) in chain.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                return Err("shutdown".to_string());
            }
            let connection = self
                .store
                .config()
                .connections
                .get(&model_ref.nickname)
                .cloned();
            let Some(connection) = connection else {
                continue;
            };
            let backend = match self.factory.backend(&model_ref.nickname, &connection) {
                Ok(b) => b,
                Err(e) => {
                    last_reason = e.to_string();
                    self.emit_fallback_notice(handle, model_ref, &last_reason, chain.get(i + 1));
                    continue;
                }
            };
            match self
                .drive_model(handle, &backend, model_ref, system, &mut raw, active, &mut full_response)
                .await
            {
                Ok(usage) => {
                    return Ok(TurnOutcome {
                        full_response,
                        usage,
                        model: model_ref.clone(),
                    })
                }
                Err(DriveError::Shutdown) => return Err("shutdown".to_string()),
                Err(DriveError::Provider(reason)) => {
                    warn!(model = %model_ref, reason = %reason, "model failed, degrading");
                    last_reason = reason;
                    self.emit_fallback_notice(handle, model_ref, &last_reason, chain.get(i + 1));
                }
            }
        }
        Err(format!("All models failed: {last_reason}"))
    }

    fn emit_fallback_notice(
        &self,
        handle: &SessionHandle,
        failed: &ModelRef,
        reason: &str,
        next: Option<&ModelRef>,
    ) {
        let next = next.map(|m| m.to_string()).unwrap_or_default();
        handle.emit(DaemonEvent::Chunk {
            text: format!("\n⚠️ Model {failed} failed: {reason}\nTrying fallback {next}...\n"),
        });
    }

    /// One model's step-bounded streaming loop. Hitting MAX_STEPS is not
    /// an error — the turn ends with whatever text accumulated.
    #[allow(clippy::too_many_arguments)]
    async fn drive_model(
        &self,
        handle: &Arc<SessionHandle>,
        backend: &Arc<dyn crate::provider::ModelBackend>,
        model_ref: &ModelRef,
        system: &str,
        raw: &mut Vec<Value>,
        active: &ActiveTools,
        full_response: &mut String,
    ) -> Result<Usage, DriveError> {
        let defs = active.definitions();
        let mut last_usage = Usage::default();

        for step in 0..MAX_STEPS {
            if self.shutdown.is_cancelled() {
                return Err(DriveError::Shutdown);
            }
            let req = ChatRequest {
                model: model_ref.model_id.clone(),
                system: system.to_string(),
                messages: Vec::new(),
                raw_messages: Some(raw.clone()),
                tools: defs.clone(),
                max_tokens: DEFAULT_MAX_TOKENS,
            };
            debug!(session = %handle.id, step, model = %model_ref, "model step");

            let (tx, mut rx) = mpsc::channel(64);
            let mut segment_text = String::new();
            let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
            let mut stream_error: Option<String> = None;

            let stream = backend.stream(&req, tx);
            let consume = async {
                while let Some(event) = rx.recv().await {
                    match event {
                        StreamEvent::TextDelta { text } => {
                            segment_text.push_str(&text);
                            full_response.push_str(&text);
                            handle.emit(DaemonEvent::Chunk { text });
                        }
                        StreamEvent::ToolUse { id, name, input } => {
                            handle.emit(DaemonEvent::ToolCall {
                                name: name.clone(),
                                input: input.clone(),
                            });
                            tool_calls.push((id, name, input));
                        }
                        StreamEvent::Done { usage, .. } => last_usage = usage,
                        StreamEvent::Error { message } => stream_error = Some(message),
                    }
                }
            };
            let (stream_result, ()) = tokio::join!(stream, consume);
            if let Err(e) = stream_result {
                return Err(DriveError::Provider(e.to_string()));
            }
            if let Some(message) = stream_error {
                return Err(DriveError::Provider(message));
            }
            if tool_calls.is_empty() {
                return Ok(last_usage);
            }

            // Feed the round back: assistant blocks, then tool results.
            let mut assistant_content = Vec::new();
            if !segment_text.is_empty() {
                assistant_content.push(json!({ "type": "text", "text": segment_text }));
            }
            for (id, name, input) in &tool_calls {
                assistant_content.push(json!({
                    "type": "tool_use", "id": id, "name": name, "input": input,
                }));
            }
            raw.push(json!({ "role": "assistant", "content": assistant_content }));

            let mut result_blocks = Vec::new();
            for (id, name, input) in tool_calls {
                let result = match active.find(&name) {
                    Some(tool) => tool.execute(input).await,
                    None => ToolResult::failure(format!("unknown tool: {name}")),
                };
                if self.debug {
                    handle.emit(DaemonEvent::ToolResult {
                        name: name.clone(),
                        output: result.content.clone(),
                    });
                }
                result_blocks.push(json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": result.content,
                    "is_error": result.is_error,
                }));
            }
            raw.push(json!({ "role": "user", "content": result_blocks }));
        }

        warn!(session = %handle.id, max_steps = MAX_STEPS, "tool round cap reached");
        Ok(last_usage)
    }

    fn maybe_compact(&self, handle: &Arc<SessionHandle>, model: &ModelRef) {
        let len = handle.with(|s| s.messages.len());
        if len < compact::COMPACTION_THRESHOLD {
            return;
        }
        let Some(connection) = self.store.config().connections.get(&model.nickname).cloned()
        else {
            return;
        };
        let backend = match self.factory.backend(&model.nickname, &connection) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "compaction backend unavailable");
                return;
            }
        };
        let store = Arc::clone(&self.store);
        let handle = Arc::clone(handle);
        let model_id = model.model_id.clone();
        tokio::spawn(async move {
            compact::compact_session(store, handle, backend, model_id).await;
        });
    }

    /// Close out a sub-agent turn: exactly one terminal `subagent-status`
    /// on the parent plus the structured report message. Sub-agents that
    /// never called back get a report synthesised from the response text.
    fn finish_subagent(&self, handle: &Arc<SessionHandle>, full_response: &str) {
        if !handle.with(|s| s.is_subagent) {
            return;
        }
        let called_back = handle.with(|s| s.subagent_callback_called);
        if !called_back {
            let mut fallback = full_response.trim().to_string();
            if fallback.len() > FALLBACK_REPORT_CHARS {
                let mut cut = FALLBACK_REPORT_CHARS;
                while !fallback.is_char_boundary(cut) {
                    cut -= 1;
                }
                fallback.truncate(cut);
                fallback.push('…');
            }
            handle.update(|s| {
                s.subagent_status = Some(SubagentStatus::Completed);
                s.completed_at = Some(chrono::Utc::now().to_rfc3339());
                s.progress = Some(fallback);
            });
        }

        let snapshot = handle.snapshot();
        let Some(status) = snapshot.subagent_status.filter(|st| st.is_terminal()) else {
            return;
        };
        let task = snapshot.task.clone().unwrap_or_default();
        let slug = snapshot.task_slug.clone().unwrap_or_default();
        let message = snapshot.progress.clone().unwrap_or_default();
        let Some(parent) = snapshot
            .parent_session_id
            .as_deref()
            .and_then(|id| self.store.get_session(id))
        else {
            warn!(session = %handle.id, "sub-agent finished but parent is gone");
            return;
        };

        parent.emit(DaemonEvent::SubagentStatus {
            subagent_id: handle.id.clone(),
            parent_session_id: parent.id.clone(),
            task,
            task_slug: slug.clone(),
            status: status.as_str().to_string(),
            message: Some(message.clone()),
        });
        let report = format!("[sub-agent {slug}] {}: {message}", status.as_str());
        if let Err(e) = self.store.enqueue_message(&parent.id, report, None) {
            warn!(error = %e, parent = %parent.id, "sub-agent report enqueue failed");
        }
        // Ensure the callback flag survives restarts so the report is not
        // duplicated on a replayed turn.
        handle.update(|s| s.subagent_callback_called = true);
        if let Err(e) = self.store.persist(handle) {
            warn!(error = %e, session = %handle.id, "persisting finished sub-agent failed");
        }
        info!(subagent = %handle.id, parent = %parent.id, status = %status.as_str(), "sub-agent finished");
    }
}

fn history_to_raw(message: &ChatMessage) -> Value {
    match message.role {
        Role::User => json!({ "role": "user", "content": message.content }),
        Role::Assistant => json!({ "role": "assistant", "content": message.content }),
        // Providers reject a system role inside messages; system notes
        // (handoff context) travel as annotated user turns.
        Role::System => json!({
            "role": "user",
            "content": format!("System note: {}", message.content),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockFactory, MockTurn};
    use async_trait::async_trait;
    use tamias_core::config::{Connection, Provider, TamiasConfig};
    use tamias_core::paths::DataRoot;
    use tamias_core::types::Agent;
    use tamias_sessions::CreateSessionParams;

    struct TestHost {
        store: Arc<SessionStore>,
    }

    #[async_trait]
    impl ToolHost for TestHost {
        fn store(&self) -> &SessionStore {
            &self.store
        }
        fn find_agent(&self, _key: &str) -> Option<Agent> {
            None
        }
        fn agents(&self) -> Vec<Agent> {
            Vec::new()
        }
        async fn handoff(
            &self,
            _session_id: &str,
            _target_agent: &str,
            _reason: &str,
            _context: Option<String>,
        ) -> Result<String, String> {
            Err("not wired".to_string())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SessionStore>,
        factory: Arc<MockFactory>,
        runner: Arc<Runner>,
        shutdown: CancellationToken,
    }

    fn fixture(default_models: Vec<&str>) -> Fixture {
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
        config.default_models = default_models.iter().map(|s| s.to_string()).collect();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(DataRoot::at(dir.path()), config));
        let factory = Arc::new(MockFactory::new());
        let host: Arc<dyn ToolHost> = Arc::new(TestHost {
            store: Arc::clone(&store),
        });
        let shutdown = CancellationToken::new();
        let runner = Runner::new(
            Arc::clone(&store),
            Arc::new(AgentsStore::default()),
            factory.clone() as Arc<dyn BackendFactory>,
            host,
            shutdown.clone(),
            false,
        );
        Fixture {
            _dir: dir,
            store,
            factory,
            runner,
            shutdown,
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<DaemonEvent>) -> Vec<DaemonEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn plain_turn_emits_start_chunk_done() {
        let f = fixture(vec!["openai/gpt-4o"]);
        f.factory
            .register("openai", MockBackend::always("openai", "hello"));
        let handle = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();
        let mut rx = handle.subscribe();

        f.store
            .enqueue_message(&handle.id, "Say 'hello'", None)
            .unwrap();
        f.runner.process_session(&handle.id).await;

        let events = drain(&mut rx);
        assert!(matches!(events[0], DaemonEvent::Start { .. }));
        assert!(matches!(&events[1], DaemonEvent::Chunk { text } if text == "hello"));
        assert!(
            matches!(&events[2], DaemonEvent::Done { suppressed, .. } if !*suppressed)
        );
        handle.with(|s| {
            assert_eq!(s.messages.len(), 2);
            assert_eq!(s.messages[1].content, "hello");
        });
        assert!(!handle.is_processing());
    }

    #[tokio::test]
    async fn heartbeat_sentinel_is_suppressed() {
        let f = fixture(vec!["openai/gpt-4o"]);
        f.factory
            .register("openai", MockBackend::always("openai", "HEARTBEAT_OK"));
        let handle = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();
        let mut rx = handle.subscribe();

        f.store.enqueue_message(&handle.id, "ping", None).unwrap();
        f.runner.process_session(&handle.id).await;

        let events = drain(&mut rx);
        assert!(matches!(&events[1], DaemonEvent::Chunk { text } if text == "HEARTBEAT_OK"));
        assert!(
            matches!(&events[2], DaemonEvent::Done { suppressed, .. } if *suppressed)
        );
    }

    #[tokio::test]
    async fn failing_chain_emits_notice_then_error() {
        // "ghost/x" has no connection, so the chain prunes to openai alone;
        // openai then fails and the turn errors out.
        let f = fixture(vec!["ghost/x", "openai/gpt-4o"]);
        f.factory.register(
            "openai",
            MockBackend::new(
                "openai",
                vec![MockTurn::Failure("502 bad gateway".to_string())],
            ),
        );
        let handle = f
            .store
            .create_session(CreateSessionParams {
                model: Some("openai/gpt-4o".to_string()),
                ..Default::default()
            })
            .unwrap();
        let mut rx = handle.subscribe();

        f.store.enqueue_message(&handle.id, "hi", None).unwrap();
        f.runner.process_session(&handle.id).await;

        let events = drain(&mut rx);
        assert!(matches!(events[0], DaemonEvent::Start { .. }));
        assert!(matches!(
            &events[1],
            DaemonEvent::Chunk { text }
                if text.contains("⚠️ Model openai/gpt-4o failed") && text.contains("Trying fallback")
        ));
        assert!(matches!(
            &events[2],
            DaemonEvent::Error { message } if message.starts_with("All models failed")
        ));
        // User turn kept, no assistant turn.
        handle.with(|s| assert_eq!(s.messages.len(), 1));
    }

    #[tokio::test]
    async fn degradation_falls_through_to_second_model() {
        // Two configured connections; the first fails, the second rescues.
        let mut config = TamiasConfig::default();
        for nick in ["openai", "backup"] {
            config.connections.insert(
                nick.to_string(),
                Connection {
                    provider: Provider::OpenAi,
                    env_key_name: "OPENAI_API_KEY".to_string(),
                    base_url: None,
                    selected_models: vec!["gpt-4o".to_string()],
                },
            );
        }
        config.default_models =
            vec!["openai/gpt-4o".to_string(), "backup/gpt-4o-mini".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(DataRoot::at(dir.path()), config));
        let factory = Arc::new(MockFactory::new());
        factory.register(
            "openai",
            MockBackend::new("openai", vec![MockTurn::Failure("down".to_string())]),
        );
        factory.register("backup", MockBackend::always("backup", "rescued"));
        let host: Arc<dyn ToolHost> = Arc::new(TestHost {
            store: Arc::clone(&store),
        });
        let runner = Runner::new(
            Arc::clone(&store),
            Arc::new(AgentsStore::default()),
            factory as Arc<dyn BackendFactory>,
            host,
            CancellationToken::new(),
            false,
        );

        let handle = store.create_session(CreateSessionParams::default()).unwrap();
        let mut rx = handle.subscribe();
        store.enqueue_message(&handle.id, "hi", None).unwrap();
        runner.process_session(&handle.id).await;

        let events = drain(&mut rx);
        let notice = events.iter().any(|e| {
            matches!(e, DaemonEvent::Chunk { text } if text.contains("Trying fallback backup/gpt-4o-mini"))
        });
        assert!(notice);
        assert!(events
            .iter()
            .any(|e| matches!(e, DaemonEvent::Chunk { text } if text == "rescued")));
        assert!(events
            .iter()
            .any(|e| matches!(e, DaemonEvent::Done { .. })));
    }

    #[tokio::test]
    async fn tool_round_feeds_results_back() {
        let f = fixture(vec!["openai/gpt-4o"]);
        let backend = MockBackend::new(
            "openai",
            vec![
                MockTurn::Events(vec![StreamEvent::ToolUse {
                    id: "t1".to_string(),
                    name: "session__status".to_string(),
                    input: json!({}),
                }]),
                MockTurn::text("all good"),
            ],
        );
        f.factory.register("openai", backend.clone());
        let handle = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();
        let mut rx = handle.subscribe();

        f.store.enqueue_message(&handle.id, "check", None).unwrap();
        f.runner.process_session(&handle.id).await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, DaemonEvent::ToolCall { name, .. } if name == "session__status")));
        assert!(events
            .iter()
            .any(|e| matches!(e, DaemonEvent::Chunk { text } if text == "all good")));

        // Second request must carry the tool_result round.
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let raw = requests[1].raw_messages.as_ref().unwrap();
        let has_result = raw.iter().any(|m| {
            m["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .any(|b| b["type"] == "tool_result" && b["tool_use_id"] == "t1")
                })
                .unwrap_or(false)
        });
        assert!(has_result);
    }

    #[tokio::test]
    async fn step_cap_terminates_without_error() {
        let f = fixture(vec!["openai/gpt-4o"]);
        let turns: Vec<MockTurn> = (0..MAX_STEPS + 5)
            .map(|i| {
                MockTurn::Events(vec![StreamEvent::ToolUse {
                    id: format!("t{i}"),
                    name: "session__status".to_string(),
                    input: json!({}),
                }])
            })
            .collect();
        let backend = MockBackend::new("openai", turns);
        f.factory.register("openai", backend.clone());
        let handle = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();
        let mut rx = handle.subscribe();

        f.store.enqueue_message(&handle.id, "loop", None).unwrap();
        f.runner.process_session(&handle.id).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, DaemonEvent::Done { .. })));
        assert!(!events.iter().any(|e| matches!(e, DaemonEvent::Error { .. })));
        assert_eq!(backend.requests.lock().unwrap().len(), MAX_STEPS);
    }

    #[tokio::test]
    async fn subagent_callback_reaches_parent() {
        let f = fixture(vec!["openai/gpt-4o"]);
        let backend = MockBackend::new(
            "openai",
            vec![
                MockTurn::Events(vec![StreamEvent::ToolUse {
                    id: "t1".to_string(),
                    name: "subagent__callback".to_string(),
                    input: json!({ "status": "completed", "outcome": "found foo at /x" }),
                }]),
                MockTurn::text("Reported."),
            ],
        );
        f.factory.register("openai", backend);

        let parent = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();
        let child = f
            .store
            .create_session(CreateSessionParams {
                parent_session_id: Some(parent.id.clone()),
                is_subagent: true,
                task: Some("find foo".to_string()),
                ..Default::default()
            })
            .unwrap();
        let mut parent_rx = parent.subscribe();

        f.store.enqueue_message(&child.id, "find foo", None).unwrap();
        f.runner.process_session(&child.id).await;

        let events = drain(&mut parent_rx);
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(e, DaemonEvent::SubagentStatus { status, .. } if status == "completed")
            })
            .collect();
        assert_eq!(terminal.len(), 1);
        match terminal[0] {
            DaemonEvent::SubagentStatus {
                message, task_slug, ..
            } => {
                assert_eq!(message.as_deref(), Some("found foo at /x"));
                assert_eq!(task_slug, "find-foo");
            }
            _ => unreachable!(),
        }
        // Parent got the structured report enqueued.
        let job = parent.pop_job().unwrap();
        assert!(job.content.contains("[sub-agent find-foo] completed"));
        assert!(job.content.contains("found foo at /x"));
    }

    #[tokio::test]
    async fn subagent_without_callback_gets_fallback_report() {
        let f = fixture(vec!["openai/gpt-4o"]);
        f.factory.register(
            "openai",
            MockBackend::always("openai", "I looked everywhere, nothing found."),
        );
        let parent = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();
        let child = f
            .store
            .create_session(CreateSessionParams {
                parent_session_id: Some(parent.id.clone()),
                is_subagent: true,
                task: Some("find bar".to_string()),
                ..Default::default()
            })
            .unwrap();

        f.store.enqueue_message(&child.id, "find bar", None).unwrap();
        f.runner.process_session(&child.id).await;

        assert_eq!(
            child.with(|s| s.subagent_status),
            Some(SubagentStatus::Completed)
        );
        let job = parent.pop_job().unwrap();
        assert!(job.content.contains("nothing found"));
    }

    #[tokio::test]
    async fn shutdown_terminates_turn_with_error() {
        let f = fixture(vec!["openai/gpt-4o"]);
        f.factory
            .register("openai", MockBackend::always("openai", "late"));
        let handle = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();
        let mut rx = handle.subscribe();

        f.shutdown.cancel();
        f.store.enqueue_message(&handle.id, "hi", None).unwrap();
        f.runner.process_session(&handle.id).await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, DaemonEvent::Error { message } if message == "shutdown")));
    }

    #[tokio::test]
    async fn queued_jobs_run_in_order() {
        let f = fixture(vec!["openai/gpt-4o"]);
        let backend = MockBackend::new(
            "openai",
            vec![MockTurn::text("first"), MockTurn::text("second")],
        );
        f.factory.register("openai", backend.clone());
        let handle = f
            .store
            .create_session(CreateSessionParams::default())
            .unwrap();

        f.store.enqueue_message(&handle.id, "one", None).unwrap();
        f.store.enqueue_message(&handle.id, "two", None).unwrap();
        f.runner.process_session(&handle.id).await;

        handle.with(|s| {
            assert_eq!(s.messages.len(), 4);
            assert_eq!(s.messages[0].content, "one");
            assert_eq!(s.messages[1].content, "first");
            assert_eq!(s.messages[2].content, "two");
            assert_eq!(s.messages[3].content, "second");
        });
    }
}
