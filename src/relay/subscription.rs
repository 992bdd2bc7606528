//! Watched-channel subscriptions and their persisted records.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::relay::decision::{NotifyAction, decide};
use crate::relay::snapshot::PresenceSnapshot;
use crate::relay::store::{DurableStore, Fields};

/// Current layout of the persisted subscription hash.
pub const SCHEMA_VERSION: u32 = 2;

/// Telegram chat id.
pub type DestinationId = i64;

pub fn subscription_key(guild_id: u64, channel_id: u64) -> String {
    format!("{}:channel_subscriber:{}", guild_id, channel_id)
}

pub fn subscription_prefix(guild_id: u64) -> String {
    format!("{}:channel_subscriber:", guild_id)
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed chat id list: {0}")]
    ChatIds(#[source] serde_json::Error),
    #[error("unsupported schema version {0}")]
    Version(String),
}

/// Subscription for one watched channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub guild_id: u64,
    pub channel_id: u64,
    pub active: bool,
    pub destination_ids: BTreeSet<DestinationId>,
    pub last_snapshot: Option<PresenceSnapshot>,
}

impl Subscription {
    pub fn new(guild_id: u64, channel_id: u64) -> Self {
        Self {
            guild_id,
            channel_id,
            active: false,
            destination_ids: BTreeSet::new(),
            last_snapshot: None,
        }
    }

    pub fn key(&self) -> String {
        subscription_key(self.guild_id, self.channel_id)
    }

    fn sync_active(&mut self) {
        self.active = !self.destination_ids.is_empty();
    }

    pub fn to_fields(&self) -> Fields {
        let chat_ids: Vec<DestinationId> = self.destination_ids.iter().copied().collect();
        let mut fields = Fields::new();
        fields.insert("schema_version".into(), SCHEMA_VERSION.to_string());
        fields.insert("active".into(), self.active.to_string());
        fields.insert(
            "telegram_chat_ids".into(),
            serde_json::to_string(&chat_ids).unwrap_or_else(|_| "[]".to_string()),
        );
        fields.insert(
            "last_state".into(),
            match &self.last_snapshot {
                Some(snapshot) => serde_json::to_string(snapshot).unwrap_or_else(|_| "null".into()),
                None => "null".into(),
            },
        );
        fields
    }

    /// Parse a stored record, upgrading older layouts.
    ///
    /// Version 1 records carry a single `telegram_chat_id` string instead of
    /// the `telegram_chat_ids` array. A `last_state` that no longer parses is
    /// dropped rather than treated as corruption.
    pub fn from_fields(guild_id: u64, channel_id: u64, fields: &Fields) -> Result<Self, RecordError> {
        let version = match fields.get("schema_version") {
            Some(v) => v.parse::<u32>().map_err(|_| RecordError::Version(v.clone()))?,
            None if fields.contains_key("telegram_chat_ids") => 2,
            None => 1,
        };
        if version > SCHEMA_VERSION {
            return Err(RecordError::Version(version.to_string()));
        }

        let destination_ids: BTreeSet<DestinationId> = match fields.get("telegram_chat_ids") {
            Some(raw) => parse_chat_ids(raw)?,
            None => fields
                .get("telegram_chat_id")
                .and_then(|id| id.trim().parse::<DestinationId>().ok())
                .into_iter()
                .collect(),
        };

        let last_snapshot = fields
            .get("last_state")
            .and_then(|raw| match serde_json::from_str::<Option<PresenceSnapshot>>(raw) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!("Dropping unreadable last_state for channel {}: {e}", channel_id);
                    None
                }
            });

        let active = fields.get("active").is_some_and(|a| a == "true") && !destination_ids.is_empty();

        Ok(Self {
            guild_id,
            channel_id,
            active,
            destination_ids,
            last_snapshot,
        })
    }
}

/// Chat ids were stored as strings before they were stored as numbers.
fn parse_chat_ids(raw: &str) -> Result<BTreeSet<DestinationId>, RecordError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw).map_err(RecordError::ChatIds)?;
    Ok(values
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect())
}

/// Result of feeding a new snapshot to a channel's subscription.
#[derive(Debug, Clone)]
pub struct Advance {
    pub action: NotifyAction,
    pub destinations: Vec<DestinationId>,
}

/// In-memory owner of all subscriptions, mirrored to the durable store.
pub struct SubscriptionStore {
    store: Arc<DurableStore>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
}

impl SubscriptionStore {
    pub fn new(store: Arc<DurableStore>) -> Self {
        Self {
            store,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, channel_id: u64) -> Option<Subscription> {
        self.subscriptions.lock().await.get(&channel_id).cloned()
    }

    pub async fn is_watched(&self, channel_id: u64) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(&channel_id)
            .is_some_and(|s| s.active)
    }

    /// Active channels of a guild.
    pub async fn watched_channels(&self, guild_id: u64) -> Vec<u64> {
        let mut channels: Vec<u64> = self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| s.guild_id == guild_id && s.active)
            .map(|s| s.channel_id)
            .collect();
        channels.sort_unstable();
        channels
    }

    /// Add `destination` to the channel. Returns false when it was already
    /// subscribed.
    pub async fn start(&self, guild_id: u64, channel_id: u64, destination: DestinationId) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        let sub = subscriptions
            .entry(channel_id)
            .or_insert_with(|| Subscription::new(guild_id, channel_id));
        if sub.active && sub.destination_ids.contains(&destination) {
            return false;
        }
        sub.destination_ids.insert(destination);
        sub.sync_active();
        info!("📡 Channel {} now notifies {:?}", channel_id, sub.destination_ids);
        self.persist(sub);
        true
    }

    /// Remove one destination, or all of them when `destination` is `None`.
    /// Returns the destinations that were removed.
    pub async fn stop(&self, channel_id: u64, destination: Option<DestinationId>) -> Vec<DestinationId> {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(sub) = subscriptions.get_mut(&channel_id) else {
            return Vec::new();
        };

        let removed: Vec<DestinationId> = match destination {
            Some(dest) if sub.destination_ids.remove(&dest) => vec![dest],
            Some(_) => Vec::new(),
            None => std::mem::take(&mut sub.destination_ids).into_iter().collect(),
        };
        if removed.is_empty() {
            return removed;
        }

        sub.sync_active();
        if !sub.active {
            sub.last_snapshot = None;
        }
        info!("🔕 Channel {} stopped notifying {:?}", channel_id, removed);
        self.persist(sub);
        removed
    }

    /// Diff `snapshot` against the stored one and remember it.
    /// `None` when the channel is not watched.
    pub async fn advance(&self, snapshot: PresenceSnapshot) -> Option<Advance> {
        let mut subscriptions = self.subscriptions.lock().await;
        let sub = subscriptions.get_mut(&snapshot.channel_id)?;
        if !sub.active {
            return None;
        }

        let action = decide(sub.last_snapshot.as_ref(), &snapshot);
        if action == NotifyAction::NoOp {
            return Some(Advance {
                action,
                destinations: Vec::new(),
            });
        }

        sub.last_snapshot = Some(snapshot);
        self.persist(sub);
        Some(Advance {
            action,
            destinations: sub.destination_ids.iter().copied().collect(),
        })
    }

    /// Queue a write of `sub`'s record.
    pub fn persist(&self, sub: &Subscription) {
        if !self.store.is_enabled() {
            return;
        }
        self.store.persist(&sub.key(), sub.to_fields());
    }

    /// Wait for queued writes to land.
    pub async fn flush(&self) {
        self.store.flush().await;
    }

    /// Load a channel's record into memory unless a live copy already exists.
    pub async fn restore(&self, guild_id: u64, channel_id: u64) -> Option<Subscription> {
        if !self.store.is_enabled() {
            return None;
        }
        if self.subscriptions.lock().await.contains_key(&channel_id) {
            info!("There is an active subscription for {}, no need for restoration", channel_id);
            return None;
        }

        let key = subscription_key(guild_id, channel_id);
        let Some(fields) = self.store.load(&key).await else {
            info!("Nothing to restore for {key}");
            return None;
        };

        let sub = match Subscription::from_fields(guild_id, channel_id, &fields) {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Unreadable record {key}: {e}");
                return None;
            }
        };
        if !sub.active {
            info!("Nothing to restore for {key}");
            return None;
        }

        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&channel_id) {
            return None;
        }
        info!("Restored {key}: notifying {:?}", sub.destination_ids);
        subscriptions.insert(channel_id, sub.clone());
        Some(sub)
    }

    /// Restore every stored subscription of a guild.
    pub async fn restore_guild(&self, guild_id: u64) -> Vec<Subscription> {
        let prefix = subscription_prefix(guild_id);
        let mut restored = Vec::new();
        for key in self.store.keys(&prefix).await {
            let Some(channel_id) = key
                .strip_prefix(&prefix)
                .and_then(|id| id.parse::<u64>().ok())
            else {
                warn!("Skipping unexpected key {key}");
                continue;
            };
            if let Some(sub) = self.restore(guild_id, channel_id).await {
                restored.push(sub);
            }
        }
        restored
    }

    /// Erase a channel's persisted record and forget any in-memory copy.
    /// Returns the in-memory copy, if one was loaded.
    pub async fn delete(&self, guild_id: u64, channel_id: u64) -> Option<Subscription> {
        let key = subscription_key(guild_id, channel_id);
        self.store.erase(&key);
        info!("🗑️ Deleted subscription record {key}");
        self.subscriptions.lock().await.remove(&channel_id)
    }
}
