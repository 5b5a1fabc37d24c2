//! The in-memory session registry and its lifecycle operations.
//!
//! The store exclusively owns every live [`SessionHandle`]. Bridges, the
//! dispatcher, and the HTTP API look sessions up by id and call
//! [`SessionStore::enqueue_message`]; they never touch a session's history
//! or queue directly. The runner is woken through a channel installed at
//! startup with [`SessionStore::set_runner`], which keeps this crate free
//! of any dependency on the LLM loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tamias_core::config::TamiasConfig;
use tamias_core::error::{Result, TamiasError};
use tamias_core::paths::DataRoot;
use tamias_core::types::{DaemonEvent, MessageJob, ModelRef};

use crate::db::AuxDb;
use crate::persist;
use crate::types::{Session, SessionSummary};

/// Emitter fan-out capacity. Slow subscribers past this lag are dropped
/// with a warning rather than blocking the runner.
const EMITTER_CAPACITY: usize = 256;

/// Called for every session entering the store (created or loaded), after
/// indices are registered. The gateway uses this to wire the dispatcher.
pub type SessionHook = dyn Fn(&Arc<SessionHandle>) + Send + Sync;

/// Runtime wrapper around one persisted [`Session`].
///
/// `processing` is the authoritative single-turn guard: a runner turn
/// starts only after winning the compare-and-swap in [`try_begin_turn`].
///
/// [`try_begin_turn`]: SessionHandle::try_begin_turn
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    data: Mutex<Session>,
    queue: Mutex<VecDeque<MessageJob>>,
    processing: AtomicBool,
    emitter: broadcast::Sender<DaemonEvent>,
    /// Background tasks bound to this session's lifetime (dispatcher
    /// pumps, heartbeat timers). Aborted on delete.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHandle {
    fn new(session: Session) -> Arc<Self> {
        let (emitter, _) = broadcast::channel(EMITTER_CAPACITY);
        Arc::new(Self {
            id: session.id.clone(),
            data: Mutex::new(session),
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            emitter,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Read access to the persisted state.
    pub fn with<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.data.lock().unwrap())
    }

    /// Write access to the persisted state.
    pub fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.data.lock().unwrap())
    }

    /// Clone the persisted state (for snapshots and HTTP responses).
    pub fn snapshot(&self) -> Session {
        self.data.lock().unwrap().clone()
    }

    /// Publish an event to every subscriber. Events with no subscribers
    /// are dropped silently — emission never blocks the runner.
    pub fn emit(&self, event: DaemonEvent) {
        let _ = self.emitter.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.emitter.subscribe()
    }

    pub fn push_job(&self, job: MessageJob) {
        self.queue.lock().unwrap().push_back(job);
    }

    pub fn pop_job(&self) -> Option<MessageJob> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Discard all queued jobs (shutdown path).
    pub fn clear_queue(&self) {
        self.queue.lock().unwrap().clear();
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Win the right to run a turn. Returns false when a turn is already
    /// in flight.
    pub fn try_begin_turn(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_turn(&self) {
        self.processing.store(false, Ordering::Release);
    }

    /// Tie a background task to this session; it is aborted when the
    /// session is deleted.
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Parameters for [`SessionStore::create_session`]. Everything is optional;
/// the store fills in defaults from config.
#[derive(Debug, Default, Clone)]
pub struct CreateSessionParams {
    pub model: Option<String>,
    pub channel_id: Option<String>,
    pub channel_user_id: Option<String>,
    pub channel_name: Option<String>,
    pub parent_session_id: Option<String>,
    pub is_subagent: bool,
    pub task: Option<String>,
    pub agent_id: Option<String>,
    pub agent_slug: Option<String>,
    pub agent_dir: Option<String>,
    pub project_slug: Option<String>,
    pub tenant_id: Option<String>,
}

pub struct SessionStore {
    root: DataRoot,
    config: TamiasConfig,
    sessions: DashMap<String, Arc<SessionHandle>>,
    /// `(channel_id, channel_user_id)` → session id. At most one entry per
    /// pair; handoff swaps the target atomically.
    by_channel: DashMap<(String, String), String>,
    aux: Option<AuxDb>,
    runner_tx: OnceLock<mpsc::UnboundedSender<String>>,
    on_session: OnceLock<Box<SessionHook>>,
}

impl SessionStore {
    /// Open the store. The auxiliary database is best-effort: a failure to
    /// open it is logged and the store runs without it.
    pub fn new(root: DataRoot, config: TamiasConfig) -> Self {
        let aux = match AuxDb::open(&root.database_file()) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(error = %e, "auxiliary database unavailable, continuing without it");
                None
            }
        };
        Self {
            root,
            config,
            sessions: DashMap::new(),
            by_channel: DashMap::new(),
            aux,
            runner_tx: OnceLock::new(),
            on_session: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &TamiasConfig {
        &self.config
    }

    pub fn data_root(&self) -> &DataRoot {
        &self.root
    }

    /// Install the runner wake channel. Ids sent on it are sessions with
    /// pending queue entries.
    pub fn set_runner(&self, tx: mpsc::UnboundedSender<String>) {
        let _ = self.runner_tx.set(tx);
    }

    /// Install the hook run for every session entering the store.
    pub fn set_session_hook(&self, hook: Box<SessionHook>) {
        let _ = self.on_session.set(hook);
    }

    /// Load every persisted session from disk, rebuild the channel index,
    /// and run the session hook. Historical events are never re-emitted —
    /// loaded sessions simply start with an idle emitter.
    pub fn load_persisted(&self) -> usize {
        let mut count = 0;
        for session in persist::load_all(&self.root) {
            if self.sessions.contains_key(&session.id) {
                continue;
            }
            count += 1;
            let index_key = channel_key(&session);
            let updated_at = session.updated_at.clone();
            let handle = SessionHandle::new(session);
            self.sessions.insert(handle.id.clone(), handle.clone());
            if let Some(key) = index_key {
                // Keep the most recently updated session per channel pair.
                match self.by_channel.get(&key).map(|e| e.value().clone()) {
                    Some(existing_id) => {
                        let existing_newer = self
                            .sessions
                            .get(&existing_id)
                            .map(|h| h.with(|s| s.updated_at.clone()) >= updated_at)
                            .unwrap_or(false);
                        if !existing_newer {
                            self.by_channel.insert(key, handle.id.clone());
                        }
                    }
                    None => {
                        self.by_channel.insert(key, handle.id.clone());
                    }
                }
            }
            if let Some(hook) = self.on_session.get() {
                hook(&handle);
            }
        }
        info!(count, "sessions loaded from disk");
        count
    }

    /// Create a new session.
    ///
    /// Model resolution: explicit param, else the first default-chain
    /// entry, else the first selected model of the first connection, else
    /// `NoModelConfigured`. The nickname half must name a configured
    /// connection or the call fails with `UnknownConnection`.
    pub fn create_session(&self, params: CreateSessionParams) -> Result<Arc<SessionHandle>> {
        let model = match params.model {
            Some(m) => m,
            None => self.config.pick_default_model()?,
        };
        let model_ref = ModelRef::parse(&model)
            .ok_or_else(|| TamiasError::UnknownConnection(model.clone()))?;
        if !self.config.connections.contains_key(&model_ref.nickname) {
            return Err(TamiasError::UnknownConnection(model_ref.nickname));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let session = Session {
            id: tamias_core::types::new_session_id(),
            name: None,
            summary: None,
            model,
            created_at: now.clone(),
            updated_at: now.clone(),
            messages: Vec::new(),
            channel_id: params.channel_id.unwrap_or_default(),
            channel_user_id: params.channel_user_id.unwrap_or_default(),
            channel_name: params.channel_name,
            parent_session_id: params.parent_session_id,
            is_subagent: params.is_subagent,
            task: params.task.clone(),
            task_slug: params
                .task
                .as_deref()
                .map(tamias_core::types::task_slug),
            subagent_status: params
                .is_subagent
                .then_some(tamias_core::types::SubagentStatus::Running),
            spawned_at: params.is_subagent.then_some(now),
            completed_at: None,
            progress: None,
            subagent_callback_called: false,
            agent_id: params.agent_id,
            agent_slug: params.agent_slug,
            agent_dir: params.agent_dir,
            project_slug: params.project_slug,
            tenant_id: params.tenant_id,
            active: true,
        };

        let index_key = channel_key(&session);
        let handle = SessionHandle::new(session);
        debug!(session = %handle.id, "session created");
        self.sessions.insert(handle.id.clone(), handle.clone());
        if let Some(key) = index_key {
            self.by_channel.insert(key, handle.id.clone());
        }
        if let Some(hook) = self.on_session.get() {
            hook(&handle);
        }
        Ok(handle)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn get_session_for_bridge(
        &self,
        channel_id: &str,
        channel_user_id: &str,
    ) -> Option<Arc<SessionHandle>> {
        let id = self
            .by_channel
            .get(&(channel_id.to_string(), channel_user_id.to_string()))?
            .value()
            .clone();
        self.get_session(&id)
    }

    /// Remove a session: abort attached tasks, drop indices, write a final
    /// snapshot. The emitter closes when the last `Arc` drops, which ends
    /// any remaining subscriber loops.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let (_, handle) = self
            .sessions
            .remove(id)
            .ok_or_else(|| TamiasError::SessionNotFound { id: id.to_string() })?;
        handle.abort_tasks();
        handle.clear_queue();
        let snapshot = handle.snapshot();
        if let Some(key) = channel_key(&snapshot) {
            self.by_channel.remove_if(&key, |_, v| v == id);
        }
        if let Err(e) = persist::save(&self.root, &snapshot) {
            warn!(error = %e, session = %id, "final snapshot failed");
        }
        info!(session = %id, "session deleted");
        Ok(())
    }

    /// Append a message job and wake the runner. Returns immediately — the
    /// turn itself runs on the runner's task.
    pub fn enqueue_message(
        &self,
        session_id: &str,
        content: impl Into<String>,
        author_name: Option<String>,
    ) -> Result<()> {
        let mut job = MessageJob::new(content.into());
        job.author_name = author_name;
        self.enqueue_job(session_id, job)
    }

    /// Full-control variant of [`enqueue_message`](Self::enqueue_message).
    pub fn enqueue_job(&self, session_id: &str, job: MessageJob) -> Result<()> {
        let handle = self
            .get_session(session_id)
            .ok_or_else(|| TamiasError::SessionNotFound {
                id: session_id.to_string(),
            })?;
        handle.push_job(job);
        self.wake_runner(session_id);
        Ok(())
    }

    /// Nudge the runner to process a session's queue.
    pub fn wake_runner(&self, session_id: &str) {
        if let Some(tx) = self.runner_tx.get() {
            let _ = tx.send(session_id.to_string());
        } else {
            debug!(session = %session_id, "no runner installed, queue left pending");
        }
    }

    /// Atomically point a channel pair at a different session (agent
    /// handoff). Returns the previously bound session id.
    pub fn swap_channel_binding(
        &self,
        channel_id: &str,
        channel_user_id: &str,
        new_session_id: &str,
    ) -> Option<String> {
        self.by_channel
            .insert(
                (channel_id.to_string(), channel_user_id.to_string()),
                new_session_id.to_string(),
            )
    }

    /// List-view projection for the HTTP API, newest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let handle = entry.value();
                let queue_length = handle.queue_len();
                handle.with(|s| SessionSummary {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    summary: s.summary.clone(),
                    model: s.model.clone(),
                    queue_length,
                    updated_at: s.updated_at.clone(),
                    is_subagent: s.is_subagent,
                    parent_session_id: s.parent_session_id.clone(),
                    task: s.task.clone(),
                    subagent_status: s.subagent_status,
                    spawned_at: s.spawned_at.clone(),
                    progress: s.progress.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Every live handle — used by the shutdown path to drain and persist.
    pub fn all_handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Write a session's snapshot to disk. `PersistenceError` is returned
    /// for logging but callers must treat it as non-fatal.
    pub fn persist(&self, handle: &SessionHandle) -> Result<()> {
        persist::save(&self.root, &handle.snapshot())
    }

    /// Best-effort usage ledger write.
    pub fn log_usage(
        &self,
        session_id: &str,
        model: &str,
        tokens_in: u32,
        tokens_out: u32,
        duration_ms: u64,
    ) {
        if let Some(aux) = &self.aux {
            aux.log_turn(session_id, model, tokens_in, tokens_out, duration_ms);
        }
    }

    /// Best-effort turn mirror into `data.sqlite`.
    pub fn mirror_turn(&self, handle: &SessionHandle, user: &str, assistant: &str) {
        if let Some(aux) = &self.aux {
            aux.mirror_turn(&handle.snapshot(), user, assistant);
        }
    }
}

/// The channel index key for a session, when it should be indexed at all.
/// Sub-agents share their parent's channel for notifications but never own
/// the pair, and inactive sessions stay unbound.
fn channel_key(session: &Session) -> Option<(String, String)> {
    if session.is_subagent
        || !session.active
        || session.channel_id.is_empty()
        || session.channel_user_id.is_empty()
    {
        return None;
    }
    Some((
        session.channel_id.clone(),
        session.channel_user_id.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tamias_core::config::{Connection, Provider};

    fn test_config() -> TamiasConfig {
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
        config
    }

    fn test_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(DataRoot::at(dir.path()), test_config());
        (dir, store)
    }

    #[test]
    fn create_uses_default_model_chain() {
        let (_dir, store) = test_store();
        let handle = store.create_session(CreateSessionParams::default()).unwrap();
        assert_eq!(handle.with(|s| s.model.clone()), "openai/gpt-4o");
        assert!(handle.id.starts_with("sess_"));
    }

    #[test]
    fn unknown_connection_is_rejected() {
        let (_dir, store) = test_store();
        let err = store
            .create_session(CreateSessionParams {
                model: Some("ghost/x".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, TamiasError::UnknownConnection(_)));
    }

    #[test]
    fn channel_index_points_at_one_session() {
        let (_dir, store) = test_store();
        let a = store
            .create_session(CreateSessionParams {
                channel_id: Some("discord:main".into()),
                channel_user_id: Some("chan1".into()),
                ..Default::default()
            })
            .unwrap();
        let found = store.get_session_for_bridge("discord:main", "chan1").unwrap();
        assert_eq!(found.id, a.id);

        // A handoff-style swap rebinds the pair atomically.
        let b = store
            .create_session(CreateSessionParams {
                model: Some("openai/gpt-4o".into()),
                ..Default::default()
            })
            .unwrap();
        let old = store.swap_channel_binding("discord:main", "chan1", &b.id);
        assert_eq!(old.as_deref(), Some(a.id.as_str()));
        let found = store.get_session_for_bridge("discord:main", "chan1").unwrap();
        assert_eq!(found.id, b.id);
    }

    #[test]
    fn subagents_never_take_the_channel_index() {
        let (_dir, store) = test_store();
        let parent = store
            .create_session(CreateSessionParams {
                channel_id: Some("telegram:bot".into()),
                channel_user_id: Some("42".into()),
                ..Default::default()
            })
            .unwrap();
        store
            .create_session(CreateSessionParams {
                channel_id: Some("telegram:bot".into()),
                channel_user_id: Some("42".into()),
                parent_session_id: Some(parent.id.clone()),
                is_subagent: true,
                task: Some("find foo".into()),
                ..Default::default()
            })
            .unwrap();
        let bound = store.get_session_for_bridge("telegram:bot", "42").unwrap();
        assert_eq!(bound.id, parent.id);
    }

    #[test]
    fn processing_guard_admits_exactly_one_turn() {
        let (_dir, store) = test_store();
        let handle = store.create_session(CreateSessionParams::default()).unwrap();
        assert!(handle.try_begin_turn());
        assert!(!handle.try_begin_turn());
        handle.end_turn();
        assert!(handle.try_begin_turn());
    }

    #[test]
    fn enqueue_queues_and_wakes_runner() {
        let (_dir, store) = test_store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_runner(tx);
        let handle = store.create_session(CreateSessionParams::default()).unwrap();
        store
            .enqueue_message(&handle.id, "hello", Some("alice".into()))
            .unwrap();
        assert_eq!(handle.queue_len(), 1);
        assert_eq!(rx.try_recv().unwrap(), handle.id);
    }

    #[test]
    fn delete_persists_a_final_snapshot() {
        let (dir, store) = test_store();
        let handle = store.create_session(CreateSessionParams::default()).unwrap();
        let id = handle.id.clone();
        drop(handle);
        store.delete_session(&id).unwrap();
        assert!(store.get_session(&id).is_none());

        let reloaded = SessionStore::new(DataRoot::at(dir.path()), test_config());
        assert_eq!(reloaded.load_persisted(), 1);
        assert!(reloaded.get_session(&id).is_some());
    }

    #[test]
    fn load_rebuilds_channel_index() {
        let (dir, store) = test_store();
        let handle = store
            .create_session(CreateSessionParams {
                channel_id: Some("discord:main".into()),
                channel_user_id: Some("c9".into()),
                ..Default::default()
            })
            .unwrap();
        store.persist(&handle).unwrap();
        let id = handle.id.clone();

        let reloaded = SessionStore::new(DataRoot::at(dir.path()), test_config());
        reloaded.load_persisted();
        let bound = reloaded.get_session_for_bridge("discord:main", "c9").unwrap();
        assert_eq!(bound.id, id);
    }
}
