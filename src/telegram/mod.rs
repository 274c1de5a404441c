use std::sync::{Arc, Mutex};

use teloxide::prelude::*;
use teloxide::types::Recipient;
use tokio::runtime::Handle;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::journal::BackupLog;

/// Best-effort chat notification. Implementations must return immediately and
/// never surface delivery errors to the caller.
pub trait Notify: Send + Sync {
    fn notify(&self, message: &str);
}

/// Sends notifications through a Telegram bot. Disabled when either the token
/// or the chat id is missing.
pub struct TelegramNotifier {
    channel: Option<Channel>,
    node_id: String,
    journal: Arc<BackupLog>,
    pending: Mutex<JoinSet<()>>,
}

struct Channel {
    bot: Bot,
    chat: Recipient,
    runtime: Handle,
}

impl TelegramNotifier {
    pub fn from_config(cfg: &Config, journal: Arc<BackupLog>) -> Self {
        let token = cfg.telegram.token.trim();
        let chat_id = cfg.telegram.chat_id.trim();

        let channel = if token.is_empty() || chat_id.is_empty() {
            tracing::debug!("Telegram notifications disabled (no token/chat id)");
            None
        } else {
            match Handle::try_current() {
                Ok(runtime) => Some(Channel {
                    bot: build_bot(token, cfg.telegram.api_url.as_deref(), &journal),
                    chat: parse_recipient(chat_id),
                    runtime,
                }),
                Err(_) => {
                    journal.error("Telegram disabled: no async runtime available");
                    None
                }
            }
        };

        Self {
            channel,
            node_id: cfg.node.id.clone(),
            journal,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    /// Wait for notifications still in flight. Used before the process exits.
    pub async fn drain(&self) {
        let mut pending = {
            let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while pending.join_next().await.is_some() {}
    }
}

impl Notify for TelegramNotifier {
    fn notify(&self, message: &str) {
        let Some(channel) = &self.channel else {
            return;
        };

        let bot = channel.bot.clone();
        let chat = channel.chat.clone();
        let text = format_message(&self.node_id, message);
        let journal = self.journal.clone();

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while pending.try_join_next().is_some() {}
        pending.spawn_on(
            async move {
                if let Err(e) = bot.send_message(chat, text).await {
                    journal.error(&format!("Telegram send error: {}", e));
                }
            },
            &channel.runtime,
        );
    }
}

/// A custom API url points the bot at a self-hosted Bot API server.
fn build_bot(token: &str, api_url: Option<&str>, journal: &BackupLog) -> Bot {
    let bot = Bot::new(token);
    match api_url.map(reqwest::Url::parse) {
        Some(Ok(url)) => bot.set_api_url(url),
        Some(Err(e)) => {
            journal.error(&format!("Ignoring invalid Telegram API url: {}", e));
            bot
        }
        None => bot,
    }
}

/// Prefix a message with the node it came from.
pub fn format_message(node_id: &str, message: &str) -> String {
    format!("[{}] {}", node_id, message)
}

/// Numeric ids address chats directly; anything else is a channel username.
fn parse_recipient(chat_id: &str) -> Recipient {
    match chat_id.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(chat_id.to_string()),
    }
}
