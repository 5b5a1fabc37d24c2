//! Discord bridge — serenity gateway in, chunked REST sends out.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serenity::http::{Http, Typing};
use serenity::model::channel::ReactionType;
use serenity::model::gateway::GatewayIntents;
use serenity::model::id::{ChannelId, MessageId, UserId};
use serenity::Client;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tamias_agent::agents::AgentsStore;
use tamias_bridges::{Bridge, BridgeError, BridgeStatus, ChannelQueue, Mark, SessionContext};
use tamias_core::config::{BridgeMode, DiscordBridgeConfig};
use tamias_core::types::DaemonEvent;
use tamias_sessions::SessionStore;

use crate::handler::DiscordHandler;
use crate::send;

/// `(discord channel id, message id)` — the per-message reference the
/// reaction queue tracks.
pub(crate) type MsgRef = (u64, u64);

pub(crate) struct ChannelState {
    pub queue: ChannelQueue<MsgRef>,
    pub buffer: String,
    pub typing: Option<Typing>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            queue: ChannelQueue::default(),
            buffer: String::new(),
            typing: None,
        }
    }
}

/// State shared between the bridge facade and the serenity event handler.
pub(crate) struct Shared {
    pub bridge_name: String,
    pub config: DiscordBridgeConfig,
    pub store: Arc<SessionStore>,
    pub agents: Arc<AgentsStore>,
    pub http: OnceLock<Arc<Http>>,
    pub bot_id: OnceLock<UserId>,
    pub channels: DashMap<String, Mutex<ChannelState>>,
    pub status: Mutex<BridgeStatus>,
}

impl Shared {
    /// Mutate one channel's state without holding the map lock across an
    /// await point.
    pub fn with_channel<R>(
        &self,
        channel_user_id: &str,
        f: impl FnOnce(&mut ChannelState) -> R,
    ) -> R {
        let entry = self
            .channels
            .entry(channel_user_id.to_string())
            .or_default();
        let mut state = entry.lock().unwrap();
        f(&mut state)
    }

    pub async fn set_reaction(&self, msg: MsgRef, mark: Mark) {
        let Some(http) = self.http.get() else { return };
        let reaction = ReactionType::Unicode(mark.emoji().to_string());
        // Errors are swallowed — the bot may lack reaction permission.
        let _ = http
            .create_reaction(ChannelId::new(msg.0), MessageId::new(msg.1), &reaction)
            .await;
    }

    pub async fn clear_reaction(&self, msg: MsgRef, mark: Mark) {
        let Some(http) = self.http.get() else { return };
        let reaction = ReactionType::Unicode(mark.emoji().to_string());
        let _ = http
            .delete_reaction_me(ChannelId::new(msg.0), MessageId::new(msg.1), &reaction)
            .await;
    }
}

pub struct DiscordBridge {
    shared: Arc<Shared>,
    gateway: Mutex<Option<JoinHandle<()>>>,
}

impl DiscordBridge {
    /// `key` is the config index; the bridge's channel id becomes
    /// `"discord:{key}"`.
    pub fn new(
        key: &str,
        config: DiscordBridgeConfig,
        store: Arc<SessionStore>,
        agents: Arc<AgentsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                bridge_name: format!("discord:{key}"),
                config,
                store,
                agents,
                http: OnceLock::new(),
                bot_id: OnceLock::new(),
                channels: DashMap::new(),
                status: Mutex::new(BridgeStatus::Disconnected),
            }),
            gateway: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Bridge for DiscordBridge {
    fn name(&self) -> &str {
        &self.shared.bridge_name
    }

    async fn connect(&self) -> Result<(), BridgeError> {
        let token = std::env::var(&self.shared.config.env_key_name)
            .map_err(|_| BridgeError::MissingToken(self.shared.config.env_key_name.clone()))?;
        *self.shared.status.lock().unwrap() = BridgeStatus::Connecting;

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILD_MESSAGE_REACTIONS;

        let handler = DiscordHandler {
            shared: Arc::clone(&self.shared),
        };
        let mut client = Client::builder(&token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        let _ = self.shared.http.set(Arc::clone(&client.http));

        // Drive the gateway with automatic reconnects for the daemon's
        // lifetime.
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                info!(bridge = %shared.bridge_name, "Discord gateway connecting");
                if let Err(e) = client.start().await {
                    warn!(bridge = %shared.bridge_name, error = %e, "gateway dropped, reconnecting in 5s");
                }
                *shared.status.lock().unwrap() = BridgeStatus::Connecting;
                tokio::time::sleep(Duration::from_secs(5)).await;

                client = loop {
                    let handler = DiscordHandler {
                        shared: Arc::clone(&shared),
                    };
                    match Client::builder(&token, intents).event_handler(handler).await {
                        Ok(c) => break c,
                        Err(e) => {
                            error!(bridge = %shared.bridge_name, error = %e, "rebuild failed, retrying in 30s");
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                };
            }
        });
        *self.gateway.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(task) = self.gateway.lock().unwrap().take() {
            task.abort();
        }
        for entry in self.shared.channels.iter() {
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
        // listen-only bridges never produce output.
        if self.shared.config.mode == BridgeMode::ListenOnly {
            return;
        }
        let shared = &self.shared;
        let chat = &ctx.channel_user_id;
        let Ok(discord_channel) = chat.parse::<u64>() else {
            return;
        };

        match event {
            DaemonEvent::Start { .. } => {
                shared.with_channel(chat, |state| {
                    state.queue.begin();
                    state.buffer.clear();
                    if state.typing.is_none() {
                        if let Some(http) = shared.http.get() {
                            // serenity's Typing rebroadcasts every ~7s until
                            // stopped.
                            state.typing =
                                Some(Typing::start(Arc::clone(http), ChannelId::new(discord_channel)));
                        }
                    }
                });
            }
            DaemonEvent::Chunk { text } => {
                shared.with_channel(chat, |state| state.buffer.push_str(text));
            }
            DaemonEvent::Done { suppressed, .. } => {
                let (buffer, finished, promoted) = shared.with_channel(chat, |state| {
                    if let Some(typing) = state.typing.take() {
                        typing.stop();
                    }
                    let (finished, promoted) = state.queue.finish();
                    (std::mem::take(&mut state.buffer), finished, promoted)
                });
                if let Some(msg) = finished {
                    shared.clear_reaction(msg, Mark::Eye).await;
                }
                if let Some(msg) = promoted {
                    shared.clear_reaction(msg, Mark::Hourglass).await;
                    shared.set_reaction(msg, Mark::Eye).await;
                }
                let text = buffer.trim();
                if !*suppressed && !text.is_empty() {
                    if let Some(http) = shared.http.get() {
                        if let Err(e) =
                            send::send_chunked(http, ChannelId::new(discord_channel), text).await
                        {
                            warn!(bridge = %shared.bridge_name, error = %e, "delivery failed");
                        }
                    }
                }
            }
            DaemonEvent::Error { message } => {
                let (finished, promoted) = shared.with_channel(chat, |state| {
                    if let Some(typing) = state.typing.take() {
                        typing.stop();
                    }
                    state.buffer.clear();
                    state.queue.finish()
                });
                if let Some(msg) = finished {
                    shared.clear_reaction(msg, Mark::Eye).await;
                }
                if let Some(msg) = promoted {
                    shared.clear_reaction(msg, Mark::Hourglass).await;
                    shared.set_reaction(msg, Mark::Eye).await;
                }
                if let Some(http) = shared.http.get() {
                    let _ = ChannelId::new(discord_channel)
                        .say(http, format!("⚠️ Error: {message}"))
                        .await;
                }
            }
            DaemonEvent::File {
                name, buffer, mime_type: _,
            } => {
                if let Some(http) = shared.http.get() {
                    use serenity::builder::{CreateAttachment, CreateMessage};
                    let attachment = CreateAttachment::bytes(buffer.clone(), name.clone());
                    let _ = ChannelId::new(discord_channel)
                        .send_message(http, CreateMessage::new().add_file(attachment))
                        .await;
                }
            }
            DaemonEvent::SubagentStatus {
                task_slug, status, message, ..
            } => {
                if let Some(http) = shared.http.get() {
                    let note = message.as_deref().unwrap_or("");
                    let _ = ChannelId::new(discord_channel)
                        .say(http, format!("🤖 Sub-agent `{task_slug}` {status} {note}"))
                        .await;
                }
            }
            DaemonEvent::AgentHandoff {
                from_agent, to_agent, reason,
            } => {
                if let Some(http) = shared.http.get() {
                    let _ = ChannelId::new(discord_channel)
                        .say(http, format!("🔀 {from_agent} → {to_agent}: {reason}"))
                        .await;
                }
            }
            DaemonEvent::ToolCall { .. } | DaemonEvent::ToolResult { .. } => {}
        }
    }
}
