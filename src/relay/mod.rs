//! Relay module - mirrors Discord voice channel presence into Telegram chats.

pub mod commands;
pub mod decision;
pub mod engine;
pub mod messenger;
pub mod notification;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod subscription;
pub mod telegram;
pub mod wordle;

#[cfg(test)]
mod tests;

pub use decision::{NotifyAction, decide};
pub use engine::Relay;
pub use messenger::{MessageId, Messenger, MessengerError};
pub use notification::DiscordNotification;
pub use registry::{NotificationRegistry, PairKey};
pub use snapshot::{MemberPresence, PresenceSnapshot, RawChannelState, RawMember};
pub use store::{DurableStore, Fields, KvStore, MemoryStore, RetryPolicy, SqliteStore, StoreError};
pub use subscription::{DestinationId, Subscription, SubscriptionStore};
pub use telegram::TelegramMessenger;
pub use wordle::{GuildError, GuildEvents, WordleSchedule, WordleScheduler, WordleSettings};
