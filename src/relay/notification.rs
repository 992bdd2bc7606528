//! Lifecycle of one notification message per (destination, channel) pair.
//!
//! Each [`DiscordNotification`] owns a task that serializes every mutation
//! for its pair. After a send or edit the pair enters a cooldown; updates
//! arriving during the cooldown are parked as pending and applied by a single
//! edit once no newer update has arrived for a full cooldown window. A
//! `Clear` always wins: it cancels both timers and deletes the live message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::relay::messenger::{MessageId, Messenger};
use crate::relay::snapshot::PresenceSnapshot;
use crate::relay::subscription::DestinationId;

/// Default cooldown between two outbound mutations of the same pair.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

enum Command {
    Update(PresenceSnapshot),
    Clear,
}

/// Externally visible state of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationStatus {
    pub message_id: Option<MessageId>,
    pub pending: bool,
}

/// Handle to the task owning one pair's notification message.
///
/// Dropping the handle stops the task once queued commands are processed;
/// the live message, if any, is left in place.
pub struct DiscordNotification {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<NotificationStatus>,
}

impl DiscordNotification {
    pub fn spawn(
        chat_id: DestinationId,
        channel_id: u64,
        messenger: Arc<dyn Messenger>,
        cooldown: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(NotificationStatus::default());

        let record = Record {
            chat_id,
            channel_id,
            messenger,
            cooldown,
            current: None,
            message_id: None,
            pending: None,
            cooldown_until: None,
            pending_due: None,
            status: status_tx,
        };
        tokio::spawn(record.run(rx));

        Self { channel_id, tx, status }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn update(&self, snapshot: PresenceSnapshot) {
        self.send(Command::Update(snapshot));
    }

    pub fn clear(&self) {
        self.send(Command::Clear);
    }

    /// A live message currently exists in the destination chat.
    pub fn is_notified(&self) -> bool {
        self.status.borrow().message_id.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.status.borrow().pending
    }

    pub fn status(&self) -> NotificationStatus {
        *self.status.borrow()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("Notification task for channel {} is gone", self.channel_id);
        }
    }
}

struct Record {
    chat_id: DestinationId,
    channel_id: u64,
    messenger: Arc<dyn Messenger>,
    cooldown: Duration,
    current: Option<PresenceSnapshot>,
    message_id: Option<MessageId>,
    pending: Option<PresenceSnapshot>,
    cooldown_until: Option<Instant>,
    pending_due: Option<Instant>,
    status: watch::Sender<NotificationStatus>,
}

impl Record {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let pending_due = self.pending_due;
            tokio::select! {
                biased;

                command = rx.recv() => match command {
                    Some(Command::Update(snapshot)) => self.on_update(snapshot).await,
                    Some(Command::Clear) => self.on_clear().await,
                    None => break,
                },
                _ = sleep_until(pending_due.unwrap_or_else(Instant::now)), if pending_due.is_some() => {
                    self.flush_pending().await;
                }
            }
            self.publish();
        }
        debug!("Notification task for {}:{} stopped", self.chat_id, self.channel_id);
    }

    fn cooldown_active(&self) -> bool {
        self.cooldown_until.is_some_and(|until| Instant::now() < until)
    }

    fn publish(&self) {
        self.status.send_replace(NotificationStatus {
            message_id: self.message_id,
            pending: self.pending.is_some(),
        });
    }

    async fn on_update(&mut self, snapshot: PresenceSnapshot) {
        let Some(message_id) = self.message_id else {
            self.send_new(snapshot).await;
            return;
        };

        if self.cooldown_active() || self.pending.is_some() {
            debug!(
                "⏳ Cooldown for {}:{}, parking update",
                self.chat_id, self.channel_id
            );
            self.pending = Some(snapshot);
            self.pending_due = Some(Instant::now() + self.cooldown);
            return;
        }

        self.edit(message_id, snapshot).await;
    }

    async fn send_new(&mut self, snapshot: PresenceSnapshot) {
        let text = snapshot.render();
        match self.messenger.send_message(self.chat_id, &text).await {
            Ok(message_id) => {
                info!(
                    "🔔 Notified chat {} about channel {} (message {})",
                    self.chat_id, self.channel_id, message_id
                );
                self.message_id = Some(message_id);
                self.current = Some(snapshot);
                self.cooldown_until = Some(Instant::now() + self.cooldown);

                if let Err(e) = self.messenger.pin_chat_message(self.chat_id, message_id).await {
                    warn!("Couldn't pin message {} in chat {}: {e}", message_id, self.chat_id);
                }
            }
            Err(e) => {
                warn!(
                    "Couldn't send notification for channel {} to chat {}: {e}",
                    self.channel_id, self.chat_id
                );
            }
        }
    }

    async fn edit(&mut self, message_id: MessageId, snapshot: PresenceSnapshot) {
        let text = snapshot.render();
        if self.current.as_ref().is_some_and(|c| c.render() == text) {
            self.current = Some(snapshot);
            return;
        }

        match self
            .messenger
            .edit_message_text(self.chat_id, message_id, &text)
            .await
        {
            Ok(()) => {
                self.current = Some(snapshot);
                self.cooldown_until = Some(Instant::now() + self.cooldown);
            }
            Err(e) => {
                warn!("Couldn't edit message {} in chat {}: {e}", message_id, self.chat_id);
            }
        }
    }

    async fn flush_pending(&mut self) {
        self.pending_due = None;
        let Some(snapshot) = self.pending.take() else {
            return;
        };
        if let Some(message_id) = self.message_id {
            self.edit(message_id, snapshot).await;
        }
    }

    async fn on_clear(&mut self) {
        self.pending = None;
        self.pending_due = None;
        self.cooldown_until = None;
        self.current = None;

        let Some(message_id) = self.message_id.take() else {
            return;
        };
        info!(
            "🧹 Channel {} is empty, removing message {} from chat {}",
            self.channel_id, message_id, self.chat_id
        );
        if let Err(e) = self.messenger.delete_message(self.chat_id, message_id).await {
            warn!("Couldn't delete message {} in chat {}: {e}", message_id, self.chat_id);
        }
    }
}
