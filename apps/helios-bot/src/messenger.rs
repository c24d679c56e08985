use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ChatMemberKind, InlineKeyboardMarkup, InputFile, UserId};
use tracing::warn;

use crate::bot::keyboards;

/// Inline action attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RenewKey(String),
    ViewProfile,
}

/// Narrow seam over the messaging channel. The lifecycle scheduler and
/// the backup task only ever talk to users through this trait.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Channel-membership probe: true when the user has blocked the
    /// bot. Probe failures count as not blocked, matching a best-effort
    /// delivery policy.
    async fn is_blocked(&self, tg_id: i64) -> bool;

    async fn send(&self, tg_id: i64, text: &str, action: Option<Action>) -> Result<()>;

    async fn send_document(&self, chat_id: i64, path: &Path) -> Result<()>;
}

pub struct TelegramMessenger {
    bot: Bot,
    bot_id: UserId,
}

impl TelegramMessenger {
    pub fn new(bot: Bot, bot_id: UserId) -> Self {
        Self { bot, bot_id }
    }

    fn keyboard(action: &Action) -> InlineKeyboardMarkup {
        match action {
            Action::RenewKey(client_id) => keyboards::renew_key(client_id),
            Action::ViewProfile => keyboards::view_profile(),
        }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn is_blocked(&self, tg_id: i64) -> bool {
        match self.bot.get_chat_member(ChatId(tg_id), self.bot_id).await {
            Ok(member) => matches!(member.kind, ChatMemberKind::Left),
            Err(e) => {
                warn!(tg_id, "Membership probe failed: {}", e);
                false
            }
        }
    }

    async fn send(&self, tg_id: i64, text: &str, action: Option<Action>) -> Result<()> {
        let mut request = self.bot.send_message(ChatId(tg_id), text);
        if let Some(action) = &action {
            request = request.reply_markup(Self::keyboard(action));
        }
        request
            .await
            .with_context(|| format!("Failed to send message to {}", tg_id))?;
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, path: &Path) -> Result<()> {
        self.bot
            .send_document(ChatId(chat_id), InputFile::file(path.to_path_buf()))
            .await
            .with_context(|| format!("Failed to send document to {}", chat_id))?;
        Ok(())
    }
}
