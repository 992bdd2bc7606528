//! Telegram messenger using teloxide.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId as TgMessageId, ParseMode};
use teloxide::{ApiError, RequestError};
use tracing::{debug, info, warn};

use crate::relay::messenger::{MessageId, Messenger, MessengerError};
use crate::relay::subscription::DestinationId;

/// Tracing target of this module's events.
pub const LOG_TARGET: &str = module_path!();

/// Telegram API client.
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn map_error(action: &str, e: RequestError) -> MessengerError {
    warn!("Failed to {action}: {e}");
    match e {
        RequestError::Network(e) => MessengerError::Network(e.to_string()),
        other => MessengerError::Api(other.to_string()),
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_message(&self, chat_id: DestinationId, text: &str) -> Result<MessageId, MessengerError> {
        info!("📤 Sending notification to chat {}", chat_id);
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
            .map(|msg| msg.id.0)
            .map_err(|e| map_error("send", e))
    }

    async fn edit_message_text(
        &self,
        chat_id: DestinationId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), MessengerError> {
        info!("✏️ Editing message {} in chat {}", message_id, chat_id);
        match self
            .bot
            .edit_message_text(ChatId(chat_id), TgMessageId(message_id), text)
            .parse_mode(ParseMode::Html)
            .await
        {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => {
                debug!("Message {} already up to date", message_id);
                Ok(())
            }
            Err(e) => Err(map_error("edit message", e)),
        }
    }

    async fn delete_message(&self, chat_id: DestinationId, message_id: MessageId) -> Result<(), MessengerError> {
        info!("🗑️ Deleting message {} in chat {}", message_id, chat_id);
        self.bot
            .delete_message(ChatId(chat_id), TgMessageId(message_id))
            .await
            .map(|_| ())
            .map_err(|e| map_error("delete message", e))
    }

    async fn pin_chat_message(&self, chat_id: DestinationId, message_id: MessageId) -> Result<(), MessengerError> {
        info!("📌 Pinning message {} in chat {}", message_id, chat_id);
        self.bot
            .pin_chat_message(ChatId(chat_id), TgMessageId(message_id))
            .disable_notification(true)
            .await
            .map(|_| ())
            .map_err(|e| map_error("pin message", e))
    }
}
