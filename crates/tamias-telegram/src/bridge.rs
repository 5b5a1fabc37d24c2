//! Telegram bridge — teloxide long polling in, chunked sends out.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ReactionType};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tamias_agent::agents::{route_inbound, AgentsStore};
use tamias_bridges::{Bridge, BridgeError, BridgeStatus, ChannelQueue, Mark, SessionContext};
use tamias_core::config::{BridgeMode, TelegramBridgeConfig};
use tamias_core::types::{DaemonEvent, InboundMessage};
use tamias_sessions::SessionStore;

use crate::send;
use crate::typing::TypingHandle;

/// `(chat id, message id)` reference for the reaction queue.
pub(crate) type MsgRef = (i64, i32);

#[derive(Default)]
pub(crate) struct ChatState {
    pub queue: ChannelQueue<MsgRef>,
    pub buffer: String,
    pub typing: Option<TypingHandle>,
}

pub(crate) struct Shared {
    pub bridge_name: String,
    pub config: TelegramBridgeConfig,
    pub store: Arc<SessionStore>,
    pub agents: Arc<AgentsStore>,
    pub bot: OnceLock<Bot>,
    pub bot_username: OnceLock<String>,
    pub chats: DashMap<String, Mutex<ChatState>>,
    pub status: Mutex<BridgeStatus>,
}

impl Shared {
    pub fn with_chat<R>(&self, chat: &str, f: impl FnOnce(&mut ChatState) -> R) -> R {
        let entry = self.chats.entry(chat.to_string()).or_default();
        let mut state = entry.lock().unwrap();
        f(&mut state)
    }

    /// Set (or clear, with `None`) the bot's reaction on a message.
    /// No-ops under `simple_queue`.
    pub async fn set_reaction(&self, msg: MsgRef, mark: Option<Mark>) {
        if self.config.simple_queue {
            return;
        }
        let Some(bot) = self.bot.get() else { return };
        let reactions: Vec<ReactionType> = mark
            .into_iter()
            .map(|m| ReactionType::Emoji {
                emoji: m.emoji().to_string(),
            })
            .collect();
        let _ = bot
            .set_message_reaction(ChatId(msg.0), MessageId(msg.1))
            .reaction(reactions)
            .await;
    }
}

pub struct TelegramBridge {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramBridge {
    /// `key` is the config index; the bridge's channel id becomes
    /// `"telegram:{key}"`.
    pub fn new(
        key: &str,
        config: TelegramBridgeConfig,
        store: Arc<SessionStore>,
        agents: Arc<AgentsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                bridge_name: format!("telegram:{key}"),
                config,
                store,
                agents,
                bot: OnceLock::new(),
                bot_username: OnceLock::new(),
                chats: DashMap::new(),
                status: Mutex::new(BridgeStatus::Disconnected),
            }),
            poller: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Bridge for TelegramBridge {
    fn name(&self) -> &str {
        &self.shared.bridge_name
    }

    async fn connect(&self) -> Result<(), BridgeError> {
        let token = std::env::var(&self.shared.config.env_key_name)
            .map_err(|_| BridgeError::MissingToken(self.shared.config.env_key_name.clone()))?;
        *self.shared.status.lock().unwrap() = BridgeStatus::Connecting;

        let bot = Bot::new(token);
        let me = bot
            .get_me()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        let _ = self
            .shared
            .bot_username
            .set(me.user.username.clone().unwrap_or_default());
        let _ = self.shared.bot.set(bot.clone());
        *self.shared.status.lock().unwrap() = BridgeStatus::Connected;
        info!(bridge = %self.shared.bridge_name, bot = %me.user.first_name, "Telegram connected");

        let shared = Arc::clone(&self.shared);
        let handler = Update::filter_message().endpoint(
            move |_bot: Bot, msg: Message, shared: Arc<Shared>| async move {
                handle_message(msg, shared).await;
                respond(())
            },
        );
        let task = tokio::spawn(async move {
            Dispatcher::builder(bot, handler)
                .dependencies(teloxide::dptree::deps![shared])
                .build()
                .dispatch()
                .await;
        });
        *self.poller.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(task) = self.poller.lock().unwrap().take() {
            task.abort();
        }
        for entry in self.shared.chats.iter() {
            if let Some(typing) = entry.value().lock().unwrap().typing.take() {
                typing.stop();
            }
        }
        *self.shared.status.lock().unwrap() = BridgeStatus::Disconnected;
    }

    fn status(&self) -> BridgeStatus {
        self.shared.status.lock().unwrap().clone()
    }

    async fn handle_daemon_event(&self, event: &DaemonEvent, ctx: &SessionContext) {
        if self.shared.config.mode == BridgeMode::ListenOnly {
            return;
        }
        let shared = &self.shared;
        let chat = &ctx.channel_user_id;
        let Ok(chat_num) = chat.parse::<i64>() else {
            return;
        };
        let chat_id = ChatId(chat_num);

        match event {
            DaemonEvent::Start { .. } => {
                shared.with_chat(chat, |state| {
                    state.queue.begin();
                    state.buffer.clear();
                    if state.typing.is_none() {
                        if let Some(bot) = shared.bot.get() {
                            state.typing = Some(TypingHandle::start(bot.clone(), chat_id));
                        }
                    }
                });
            }
            DaemonEvent::Chunk { text } => {
                shared.with_chat(chat, |state| state.buffer.push_str(text));
            }
            DaemonEvent::Done { suppressed, .. } => {
                let (buffer, finished, promoted) = shared.with_chat(chat, |state| {
                    if let Some(typing) = state.typing.take() {
                        typing.stop();
                    }
                    let (finished, promoted) = state.queue.finish();
                    (std::mem::take(&mut state.buffer), finished, promoted)
                });
                if let Some(msg) = finished {
                    shared.set_reaction(msg, None).await;
                }
                if let Some(msg) = promoted {
                    shared.set_reaction(msg, Some(Mark::Eye)).await;
                }
                let text = buffer.trim();
                if !*suppressed && !text.is_empty() {
                    if let Some(bot) = shared.bot.get() {
                        if let Err(e) = send::send_chunked(bot, chat_id, text).await {
                            warn!(bridge = %shared.bridge_name, error = %e, "delivery failed");
                        }
                    }
                }
            }
            DaemonEvent::Error { message } => {
                let (finished, promoted) = shared.with_chat(chat, |state| {
                    if let Some(typing) = state.typing.take() {
                        typing.stop();
                    }
                    state.buffer.clear();
                    state.queue.finish()
                });
                if let Some(msg) = finished {
                    shared.set_reaction(msg, None).await;
                }
                if let Some(msg) = promoted {
                    shared.set_reaction(msg, Some(Mark::Eye)).await;
                }
                if let Some(bot) = shared.bot.get() {
                    let escaped = send::escape_markdown_v2(message);
                    send::send_notice(
                        bot,
                        chat_id,
                        &format!("⚠️ *Error:* {escaped}"),
                        &format!("⚠️ Error: {message}"),
                    )
                    .await;
                }
            }
            DaemonEvent::File { name, buffer, .. } => {
                if let Some(bot) = shared.bot.get() {
                    let doc = teloxide::types::InputFile::memory(buffer.clone())
                        .file_name(name.clone());
                    let _ = bot.send_document(chat_id, doc).await;
                }
            }
            DaemonEvent::SubagentStatus {
                subagent_id,
                task_slug,
                status,
                message,
                ..
            } => {
                if let Some(bot) = shared.bot.get() {
                    let note = message.as_deref().unwrap_or("");
                    let escaped_id = send::escape_markdown_v2(subagent_id);
                    let escaped_slug = send::escape_markdown_v2(task_slug);
                    let escaped_note = send::escape_markdown_v2(note);
                    send::send_notice(
                        bot,
                        chat_id,
                        &format!("🤖 Sub\\-agent `{escaped_id}` \\({escaped_slug}\\) {status}: {escaped_note}"),
                        &format!("🤖 Sub-agent {subagent_id} ({task_slug}) {status}: {note}"),
                    )
                    .await;
                }
            }
            DaemonEvent::AgentHandoff {
                from_agent,
                to_agent,
                reason,
            } => {
                if let Some(bot) = shared.bot.get() {
                    let escaped = send::escape_markdown_v2(reason);
                    send::send_notice(
                        bot,
                        chat_id,
                        &format!(
                            "🔀 {} → {}: {escaped}",
                            send::escape_markdown_v2(from_agent),
                            send::escape_markdown_v2(to_agent)
                        ),
                        &format!("🔀 {from_agent} → {to_agent}: {reason}"),
                    )
                    .await;
                }
            }
            DaemonEvent::ToolCall { .. } | DaemonEvent::ToolResult { .. } => {}
        }
    }
}

/// Inbound gating and enqueue, mirroring the Discord handler: bot filter →
/// allowlist → mode gate → optimistic reaction → enqueue → rollback.
async fn handle_message(msg: Message, shared: Arc<Shared>) {
    let Some(from) = msg.from.as_ref() else {
        return;
    };
    if from.is_bot {
        return;
    }
    let chat_key = msg.chat.id.0.to_string();

    let allowed = &shared.config.allowed_chats;
    let username = from.username.as_deref().unwrap_or("");
    if !allowed.is_empty()
        && !allowed.iter().any(|a| a == &chat_key || a == username)
    {
        return;
    }

    let text = msg.text().or(msg.caption()).unwrap_or("").trim();

    match shared.config.mode {
        BridgeMode::ListenOnly => {
            debug!(bridge = %shared.bridge_name, chat = %chat_key, "listen-only, message logged");
            return;
        }
        BridgeMode::MentionOnly => {
            let bot_username = shared.bot_username.get().map(String::as_str).unwrap_or("");
            if bot_username.is_empty() || !contains_mention(text, bot_username) {
                return;
            }
        }
        BridgeMode::Full => {}
    }

    if text.is_empty() {
        return;
    }

    let msg_ref: MsgRef = (msg.chat.id.0, msg.id.0);
    let mark = shared.with_chat(&chat_key, |state| state.queue.accept(msg_ref));
    shared.set_reaction(msg_ref, Some(mark)).await;

    let inbound = InboundMessage {
        channel_id: shared.bridge_name.clone(),
        channel_user_id: chat_key.clone(),
        channel_name: msg.chat.title().map(|t| t.to_string()),
        author_id: Some(from.id.0.to_string()),
        author_name: Some(from.full_name()),
        content: text.to_string(),
        attachments: Vec::new(),
    };
    let accepted = match route_inbound(&shared.store, &shared.agents, inbound) {
        Ok(_) => true,
        Err(e) => {
            warn!(bridge = %shared.bridge_name, error = %e, "inbound rejected");
            false
        }
    };

    if !accepted {
        shared.with_chat(&chat_key, |state| state.queue.rollback(&msg_ref));
        shared.set_reaction(msg_ref, None).await;
    }
}

/// True when `@{bot_username}` appears in the text (case-insensitive).
fn contains_mention(text: &str, bot_username: &str) -> bool {
    let needle = format!("@{}", bot_username.to_lowercase());
    text.to_lowercase().contains(&needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_detection_is_case_insensitive() {
        assert!(contains_mention("hey @TamiasBot, hi", "tamiasbot"));
        assert!(contains_mention("@tamiasbot hi", "TamiasBot"));
        assert!(!contains_mention("hi there", "tamiasbot"));
    }
}
