//! Cross-module scenarios for the relay: presence events flowing through the
//! subscription store, the decision engine and the notification records.
//!
//! Run with: cargo test relay

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use super::messenger::fake::{Call, RecordingMessenger};
use super::notification::DEFAULT_COOLDOWN;
use super::snapshot::{channel, member};
use super::*;

const HEADER: &str = "🔊 <a href=\"https://discord.com/channels/7/42\">General</a>";

fn relay_with(backend: Option<Arc<MemoryStore>>, messenger: &Arc<RecordingMessenger>) -> Relay {
    let store = match backend {
        Some(backend) => DurableStore::new(backend, RetryPolicy::default()),
        None => DurableStore::disabled(),
    };
    Relay::new(
        SubscriptionStore::new(Arc::new(store)),
        NotificationRegistry::new(messenger.clone(), DEFAULT_COOLDOWN, Duration::from_secs(3600)),
    )
}

async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

// =============================================================================
// NOTIFICATION LIFECYCLE
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_join_leave_flap_then_empty() {
        let messenger = Arc::new(RecordingMessenger::new());
        let relay = relay_with(None, &messenger);
        relay.subscribe(7, 42, -100).await;
        let start = Instant::now();

        // B joins A
        let action = relay
            .presence_changed(channel(vec![member(1, "A"), member(2, "B")]))
            .await;
        assert!(matches!(action, NotifyAction::Update(_)));
        settle().await;

        // B leaves two seconds later, inside the cooldown
        sleep(Duration::from_secs(2)).await;
        relay.presence_changed(channel(vec![member(1, "A")])).await;
        settle().await;
        assert!(messenger.edits().is_empty());

        // pending edit fires five seconds after the second event
        sleep(Duration::from_secs(6)).await;
        let edit_at = messenger
            .timed_calls()
            .into_iter()
            .find(|(_, c)| matches!(c, Call::Edit { .. }))
            .map(|(at, _)| at)
            .unwrap();
        assert!(edit_at >= start + Duration::from_secs(7));

        // A leaves
        let action = relay.presence_changed(channel(vec![])).await;
        assert_eq!(action, NotifyAction::Clear);
        settle().await;

        assert_eq!(
            messenger.calls(),
            vec![
                Call::Send {
                    chat_id: -100,
                    text: format!("{HEADER}\nA\nB"),
                },
                Call::Pin {
                    chat_id: -100,
                    message_id: 101,
                },
                Call::Edit {
                    chat_id: -100,
                    message_id: 101,
                    text: format!("{HEADER}\nA"),
                },
                Call::Delete {
                    chat_id: -100,
                    message_id: 101,
                },
            ]
        );
        assert!(!relay.notifications().is_notified(PairKey::new(-100, 42)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_mute_toggle_edits_message() {
        let messenger = Arc::new(RecordingMessenger::new());
        let relay = relay_with(None, &messenger);
        relay.subscribe(7, 42, -100).await;

        relay.presence_changed(channel(vec![member(1, "A")])).await;
        sleep(Duration::from_secs(10)).await;

        let mut muted = member(1, "A");
        muted.self_mute = Some(true);
        relay.presence_changed(channel(vec![muted])).await;
        settle().await;

        assert_eq!(
            messenger.edits(),
            vec![Call::Edit {
                chat_id: -100,
                message_id: 101,
                text: format!("{HEADER}\nA 🔇"),
            }]
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_send_heals_on_next_event() {
        let messenger = Arc::new(RecordingMessenger::new());
        let relay = relay_with(None, &messenger);
        relay.subscribe(7, 42, -100).await;

        messenger.fail_sends(true);
        relay.presence_changed(channel(vec![member(1, "A")])).await;
        settle().await;
        assert!(!relay.notifications().is_notified(PairKey::new(-100, 42)));

        messenger.fail_sends(false);
        relay
            .presence_changed(channel(vec![member(1, "A"), member(2, "B")]))
            .await;
        settle().await;
        assert!(relay.notifications().is_notified(PairKey::new(-100, 42)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_channels_do_not_interfere() {
        let messenger = Arc::new(RecordingMessenger::new());
        let relay = relay_with(None, &messenger);
        relay.subscribe(7, 42, -100).await;
        relay.subscribe(7, 43, -100).await;

        let mut other = channel(vec![member(3, "C")]);
        other.channel_id = 43;
        relay.presence_changed(channel(vec![member(1, "A")])).await;
        relay.presence_changed(other).await;
        settle().await;
        relay.presence_changed(channel(vec![])).await;
        settle().await;

        assert!(!relay.notifications().is_notified(PairKey::new(-100, 42)));
        assert!(relay.notifications().is_notified(PairKey::new(-100, 43)));
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

mod persistence {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_restart_restores_subscription() {
        let backend = Arc::new(MemoryStore::new());
        let messenger = Arc::new(RecordingMessenger::new());
        let first = relay_with(Some(backend.clone()), &messenger);
        first.subscribe(7, 42, -1).await;
        first.subscribe(7, 42, -2).await;
        first.presence_changed(channel(vec![member(1, "A")])).await;
        first.subscriptions().flush().await;

        let messenger = Arc::new(RecordingMessenger::new());
        let second = relay_with(Some(backend), &messenger);
        let restored = second.restore_guild(7).await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].destination_ids.iter().copied().collect::<Vec<_>>(), vec![-2, -1]);
        assert_eq!(
            restored[0].last_snapshot,
            Some(PresenceSnapshot::build(&channel(vec![member(1, "A")])))
        );

        // unchanged presence after restart stays quiet
        let action = second.presence_changed(channel(vec![member(1, "A")])).await;
        assert_eq!(action, NotifyAction::NoOp);

        second
            .presence_changed(channel(vec![member(1, "A"), member(2, "B")]))
            .await;
        settle().await;
        assert_eq!(messenger.count(|c| matches!(c, Call::Send { .. })), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_legacy_record_is_upgraded() {
        let backend = Arc::new(MemoryStore::new());
        let mut legacy = Fields::new();
        legacy.insert("active".into(), "true".into());
        legacy.insert("telegram_chat_id".into(), "-100".into());
        backend.hset("7:channel_subscriber:42", &legacy).await.unwrap();

        let messenger = Arc::new(RecordingMessenger::new());
        let relay = relay_with(Some(backend), &messenger);
        let restored = relay.restore_guild(7).await;
        assert_eq!(restored.len(), 1);
        assert!(restored[0].destination_ids.contains(&-100));

        relay.presence_changed(channel(vec![member(1, "A")])).await;
        settle().await;
        assert_eq!(messenger.count(|c| matches!(c, Call::Send { chat_id: -100, .. })), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_unreachable_store_never_blocks_relay() {
        let backend = Arc::new(MemoryStore::new());
        backend.set_failing(true);
        let messenger = Arc::new(RecordingMessenger::new());
        let relay = relay_with(Some(backend.clone()), &messenger);

        relay.subscribe(7, 42, -100).await;
        relay.presence_changed(channel(vec![member(1, "A")])).await;
        settle().await;
        assert!(relay.notifications().is_notified(PairKey::new(-100, 42)));

        sleep(Duration::from_secs(30 * 60)).await;
        assert!(backend.write_attempts() <= 16);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_unsubscribe_all_is_persisted_inactive() {
        let backend = Arc::new(MemoryStore::new());
        let messenger = Arc::new(RecordingMessenger::new());
        let relay = relay_with(Some(backend.clone()), &messenger);
        relay.subscribe(7, 42, -100).await;
        relay.unsubscribe(42, None).await;
        relay.subscriptions().flush().await;

        let stored = backend.hgetall("7:channel_subscriber:42").await.unwrap();
        assert_eq!(stored.get("active").map(String::as_str), Some("false"));

        let fresh = relay_with(Some(backend.clone()), &messenger);
        assert!(fresh.restore_guild(7).await.is_empty());

        // the inactive record is never loaded, but wipe still removes it
        fresh.wipe(7, 42).await;
        fresh.subscriptions().flush().await;
        assert!(backend.keys("").await.unwrap().is_empty());
    }
}
