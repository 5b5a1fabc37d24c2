//! Serenity event handler: inbound gating, queueing, and enqueue.
//!
//! Flow per message: bot filter → allowlist → mode gate → optimistic
//! reaction → session resolve + enqueue → rollback on rejection.

use std::sync::Arc;

use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::{Context, EventHandler};
use tracing::{debug, info, warn};

use tamias_agent::agents::route_inbound;
use tamias_bridges::BridgeStatus;
use tamias_core::config::BridgeMode;
use tamias_core::types::InboundMessage;

use crate::bridge::Shared;

pub struct DiscordHandler {
    pub shared: Arc<Shared>,
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.shared.bot_id.set(ready.user.id).ok();
        *self.shared.status.lock().unwrap() = BridgeStatus::Connected;
        info!(bridge = %self.shared.bridge_name, bot = %ready.user.name, "Discord connected");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        let shared = &self.shared;
        if msg.author.bot {
            return;
        }

        let channel_user_id = msg.channel_id.get().to_string();

        // Allowlist: empty accepts all.
        let allowed = &shared.config.allowed_channels;
        if !allowed.is_empty() && !allowed.iter().any(|c| c == &channel_user_id) {
            return;
        }

        match shared.config.mode {
            BridgeMode::ListenOnly => {
                debug!(bridge = %shared.bridge_name, channel = %channel_user_id, "listen-only, message logged");
                return;
            }
            BridgeMode::MentionOnly => {
                let Some(bot_id) = shared.bot_id.get() else {
                    return;
                };
                if !msg.mentions_user_id(*bot_id) {
                    return;
                }
            }
            BridgeMode::Full => {}
        }

        let content = msg.content.trim().to_string();
        if content.is_empty() && msg.attachments.is_empty() {
            return;
        }

        // Optimistic reaction before the enqueue; rolled back on rejection.
        let msg_ref = (msg.channel_id.get(), msg.id.get());
        let mark = shared.with_channel(&channel_user_id, |state| state.queue.accept(msg_ref));
        shared.set_reaction(msg_ref, mark).await;

        let inbound = InboundMessage {
            channel_id: shared.bridge_name.clone(),
            channel_user_id: channel_user_id.clone(),
            channel_name: None,
            author_id: Some(msg.author.id.get().to_string()),
            author_name: Some(msg.author.name.clone()),
            content,
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
            shared.with_channel(&channel_user_id, |state| state.queue.rollback(&msg_ref));
            shared.clear_reaction(msg_ref, mark).await;
        }
    }
}
