//! End-to-end relay flow through the public API: SQLite persistence,
//! restart, and notification lifecycle against a recording messenger.
//!
//! The `live` module talks to the real Telegram API and needs
//! TELEGRAM_BOT_TOKEN and TELEGRAM_TEST_CHAT_ID.
//!
//! Run with: cargo test --test relay_flow
//! Live:     cargo test --features integ_test --test relay_flow

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use voxbridge::relay::{
    DestinationId, DurableStore, MessageId, Messenger, MessengerError, NotificationRegistry, NotifyAction,
    PairKey, RawChannelState, RawMember, Relay, RetryPolicy, SqliteStore, SubscriptionStore,
};

#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
}

impl Recorder {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Messenger for Recorder {
    async fn send_message(&self, chat_id: DestinationId, _text: &str) -> Result<MessageId, MessengerError> {
        self.push(format!("send {chat_id}"));
        Ok(1)
    }

    async fn edit_message_text(
        &self,
        chat_id: DestinationId,
        message_id: MessageId,
        _text: &str,
    ) -> Result<(), MessengerError> {
        self.push(format!("edit {chat_id}/{message_id}"));
        Ok(())
    }

    async fn delete_message(&self, chat_id: DestinationId, message_id: MessageId) -> Result<(), MessengerError> {
        self.push(format!("delete {chat_id}/{message_id}"));
        Ok(())
    }

    async fn pin_chat_message(&self, chat_id: DestinationId, message_id: MessageId) -> Result<(), MessengerError> {
        self.push(format!("pin {chat_id}/{message_id}"));
        Ok(())
    }
}

fn voice(members: &[(u64, &str)]) -> RawChannelState {
    RawChannelState {
        channel_id: 900,
        channel_name: Some("Lobby".to_string()),
        channel_type: Some("Voice".to_string()),
        guild_id: Some(1),
        guild_name: Some("Home".to_string()),
        members: members
            .iter()
            .map(|(id, name)| RawMember {
                user_id: *id,
                display_name: Some(name.to_string()),
                ..Default::default()
            })
            .collect(),
    }
}

fn relay(store: Arc<DurableStore>, messenger: Arc<Recorder>) -> Relay {
    Relay::new(
        SubscriptionStore::new(store),
        NotificationRegistry::new(messenger, Duration::from_millis(200), Duration::from_secs(60)),
    )
}

#[tokio::test]
async fn test_subscription_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
        let store = Arc::new(DurableStore::new(
            Arc::new(SqliteStore::open(&path).unwrap()),
            RetryPolicy::default(),
        ));
        let first = relay(store.clone(), Arc::new(Recorder::default()));
        assert!(first.subscribe(1, 900, -42).await);
        first.presence_changed(voice(&[(5, "ann")])).await;
        store.flush().await;
    }

    let store = Arc::new(DurableStore::new(
        Arc::new(SqliteStore::open(&path).unwrap()),
        RetryPolicy::default(),
    ));
    let messenger = Arc::new(Recorder::default());
    let second = relay(store, messenger.clone());
    let restored = second.restore_guild(1).await;
    assert_eq!(restored.len(), 1);
    assert!(restored[0].destination_ids.contains(&-42));
    assert!(second.is_watched(900).await);

    let action = second.presence_changed(voice(&[(5, "ann"), (6, "bob")])).await;
    assert!(matches!(action, NotifyAction::Update(_)));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(messenger.log(), vec!["send -42", "pin -42/1"]);
}

#[tokio::test]
async fn test_full_lifecycle() {
    let messenger = Arc::new(Recorder::default());
    let relay = relay(Arc::new(DurableStore::disabled()), messenger.clone());
    relay.subscribe(1, 900, -42).await;

    relay.presence_changed(voice(&[(5, "ann")])).await;
    sleep(Duration::from_millis(50)).await;
    relay.presence_changed(voice(&[(5, "ann"), (6, "bob")])).await;
    sleep(Duration::from_millis(400)).await;
    relay.presence_changed(voice(&[])).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        messenger.log(),
        vec!["send -42", "pin -42/1", "edit -42/1", "delete -42/1"]
    );
    assert!(!relay.notifications().is_notified(PairKey::new(-42, 900)));
}

#[cfg(feature = "integ_test")]
mod live {
    use super::*;
    use teloxide::Bot;
    use voxbridge::relay::TelegramMessenger;

    fn env() -> Option<(String, DestinationId)> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat = std::env::var("TELEGRAM_TEST_CHAT_ID").ok()?.parse().ok()?;
        Some((token, chat))
    }

    #[tokio::test]
    async fn test_send_edit_delete_against_telegram() {
        let Some((token, chat_id)) = env() else {
            eprintln!("Skipping test: TELEGRAM_BOT_TOKEN / TELEGRAM_TEST_CHAT_ID not set");
            return;
        };
        let messenger = TelegramMessenger::new(Bot::new(token));

        let id = messenger.send_message(chat_id, "🔊 <b>relay_flow</b>").await.unwrap();
        messenger
            .edit_message_text(chat_id, id, "🔊 <b>relay_flow</b>\nedited")
            .await
            .unwrap();
        // unchanged text is not an error
        messenger
            .edit_message_text(chat_id, id, "🔊 <b>relay_flow</b>\nedited")
            .await
            .unwrap();
        messenger.delete_message(chat_id, id).await.unwrap();
    }
}
