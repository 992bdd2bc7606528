//! Relay pipeline: presence event → snapshot → decision → notifications.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::relay::decision::NotifyAction;
use crate::relay::registry::{NotificationRegistry, PairKey};
use crate::relay::snapshot::{PresenceSnapshot, RawChannelState};
use crate::relay::subscription::{DestinationId, Subscription, SubscriptionStore};

/// The notification relay core.
pub struct Relay {
    subscriptions: SubscriptionStore,
    notifications: NotificationRegistry,
    /// Keeps decide + dispatch of one event from interleaving with another.
    pipeline: Mutex<()>,
}

impl Relay {
    pub fn new(subscriptions: SubscriptionStore, notifications: NotificationRegistry) -> Self {
        Self {
            subscriptions,
            notifications,
            pipeline: Mutex::new(()),
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionStore {
        &self.subscriptions
    }

    pub fn notifications(&self) -> &NotificationRegistry {
        &self.notifications
    }

    pub async fn is_watched(&self, channel_id: u64) -> bool {
        self.subscriptions.is_watched(channel_id).await
    }

    /// Handle a presence change of a (possibly) watched channel.
    pub async fn presence_changed(&self, raw: RawChannelState) -> NotifyAction {
        let snapshot = PresenceSnapshot::build(&raw);
        let channel_id = snapshot.channel_id;

        let _pipeline = self.pipeline.lock().await;
        let Some(advance) = self.subscriptions.advance(snapshot).await else {
            return NotifyAction::NoOp;
        };

        match &advance.action {
            NotifyAction::NoOp => {
                debug!("No visible change in channel {}", channel_id);
            }
            action => {
                info!(
                    "🔊 Channel {} changed: {} → {:?}",
                    channel_id,
                    match action {
                        NotifyAction::Clear => "clear",
                        _ => "update",
                    },
                    advance.destinations
                );
                for destination in &advance.destinations {
                    self.notifications
                        .dispatch(PairKey::new(*destination, channel_id), action);
                }
            }
        }
        advance.action
    }

    /// Subscribe `destination` to a channel. Returns false if it already was.
    ///
    /// A destination joining a channel that already has people in it gets
    /// the current presence right away.
    pub async fn subscribe(&self, guild_id: u64, channel_id: u64, destination: DestinationId) -> bool {
        let _pipeline = self.pipeline.lock().await;
        if !self.subscriptions.start(guild_id, channel_id, destination).await {
            return false;
        }

        let current = self
            .subscriptions
            .get(channel_id)
            .await
            .and_then(|sub| sub.last_snapshot)
            .filter(|snapshot| !snapshot.is_empty());
        if let Some(snapshot) = current {
            debug!("Catching up chat {} on channel {}", destination, channel_id);
            self.notifications.dispatch(
                PairKey::new(destination, channel_id),
                &NotifyAction::Update(snapshot),
            );
        }
        true
    }

    /// Unsubscribe one destination (or all) and take down their live
    /// notifications.
    pub async fn unsubscribe(&self, channel_id: u64, destination: Option<DestinationId>) -> Vec<DestinationId> {
        let _pipeline = self.pipeline.lock().await;
        let removed = self.subscriptions.stop(channel_id, destination).await;
        for destination in &removed {
            self.notifications.remove(PairKey::new(*destination, channel_id));
        }
        removed
    }

    /// Restore every stored subscription of a guild. The caller should feed
    /// the current presence of the returned channels afterwards.
    pub async fn restore_guild(&self, guild_id: u64) -> Vec<Subscription> {
        self.subscriptions.restore_guild(guild_id).await
    }

    /// Permanently remove a channel's subscription, live notifications and
    /// persisted record, whether or not the record is loaded. Not wired to a
    /// chat command; meant for the process embedding the relay.
    pub async fn wipe(&self, guild_id: u64, channel_id: u64) -> bool {
        let removed = self.unsubscribe(channel_id, None).await;
        let deleted = self.subscriptions.delete(guild_id, channel_id).await.is_some();
        deleted || !removed.is_empty()
    }
}
