//! Messaging platform operations the relay depends on.

use async_trait::async_trait;

use crate::relay::subscription::DestinationId;

/// Platform message id.
pub type MessageId = i32;

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("messaging API error: {0}")]
    Api(String),
    #[error("network error: {0}")]
    Network(String),
}

/// Outbound message lifecycle calls. Text is HTML.
///
/// Implementations do not retry; the next presence event naturally tries
/// again.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, chat_id: DestinationId, text: &str) -> Result<MessageId, MessengerError>;
    async fn edit_message_text(
        &self,
        chat_id: DestinationId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), MessengerError>;
    async fn delete_message(&self, chat_id: DestinationId, message_id: MessageId) -> Result<(), MessengerError>;
    async fn pin_chat_message(&self, chat_id: DestinationId, message_id: MessageId) -> Result<(), MessengerError>;
}
