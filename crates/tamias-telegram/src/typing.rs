//! Telegram typing indicator — `sendChatAction` every 4 seconds.
//!
//! Telegram clears the typing status after ~5 seconds, so the keepalive
//! refreshes just under that. `TypingHandle::stop()` aborts immediately.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatAction;

pub struct TypingHandle(tokio::task::JoinHandle<()>);

impl TypingHandle {
    /// Send `ChatAction::Typing` now and then every 4 seconds.
    pub fn start(bot: Bot, chat_id: ChatId) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
        });
        TypingHandle(handle)
    }

    pub fn stop(self) {
        self.0.abort();
    }
}
