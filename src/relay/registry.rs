//! Registry of notification records keyed by (destination, channel).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use crate::relay::decision::NotifyAction;
use crate::relay::messenger::Messenger;
use crate::relay::notification::DiscordNotification;
use crate::relay::subscription::DestinationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub destination: DestinationId,
    pub channel_id: u64,
}

impl PairKey {
    pub fn new(destination: DestinationId, channel_id: u64) -> Self {
        Self {
            destination,
            channel_id,
        }
    }
}

struct Entry {
    record: DiscordNotification,
    last_used: Instant,
}

/// Owns every [`DiscordNotification`]. Records are created lazily on the
/// first update of a pair and evicted once idle for `idle_ttl`.
pub struct NotificationRegistry {
    messenger: Arc<dyn Messenger>,
    cooldown: Duration,
    idle_ttl: Duration,
    records: Mutex<HashMap<PairKey, Entry>>,
}

impl NotificationRegistry {
    pub fn new(messenger: Arc<dyn Messenger>, cooldown: Duration, idle_ttl: Duration) -> Self {
        Self {
            messenger,
            cooldown,
            idle_ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Route an action to the pair's record.
    pub fn dispatch(&self, key: PairKey, action: &NotifyAction) {
        let Ok(mut records) = self.records.lock() else {
            error!("Notification registry lock poisoned");
            return;
        };
        let now = Instant::now();
        self.evict_idle(&mut records, now);

        match action {
            NotifyAction::NoOp => {}
            NotifyAction::Clear => {
                if let Some(entry) = records.get_mut(&key) {
                    entry.last_used = now;
                    entry.record.clear();
                }
            }
            NotifyAction::Update(snapshot) => {
                let entry = records.entry(key).or_insert_with(|| {
                    debug!("New notification record for {:?}", key);
                    Entry {
                        record: DiscordNotification::spawn(
                            key.destination,
                            key.channel_id,
                            self.messenger.clone(),
                            self.cooldown,
                        ),
                        last_used: now,
                    }
                });
                entry.last_used = now;
                entry.record.update(snapshot.clone());
            }
        }
    }

    /// Clear the pair's live message and forget the record.
    pub fn remove(&self, key: PairKey) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        if let Some(entry) = records.remove(&key) {
            entry.record.clear();
        }
    }

    pub fn is_notified(&self, key: PairKey) -> bool {
        self.records
            .lock()
            .map(|records| records.get(&key).is_some_and(|e| e.record.is_notified()))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_idle(&self, records: &mut HashMap<PairKey, Entry>, now: Instant) {
        let before = records.len();
        records.retain(|_, entry| {
            let status = entry.record.status();
            status.message_id.is_some()
                || status.pending
                || now.duration_since(entry.last_used) < self.idle_ttl
        });
        let evicted = before - records.len();
        if evicted > 0 {
            debug!("Evicted {} idle notification record(s)", evicted);
        }
    }
}
