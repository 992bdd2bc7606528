//! Command logic shared by the chat front-ends. Every function returns the
//! reply text; the caller only has to deliver it.

use tracing::{info, warn};

use crate::relay::engine::Relay;
use crate::relay::subscription::DestinationId;
use crate::relay::wordle::{StartOutcome, WordleScheduler};

/// A guild channel as resolved by the front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: u64,
    pub name: String,
}

pub const HELP_TEXT: &str = "Discord voice channel notifications.\n\n\
1. Run /discord_notification here to get this chat's id.\n\
2. In Discord run /subscribe with a voice channel and that id.\n\
3. A pinned message here will follow who is in the channel.\n\n\
/unsubscribe in Discord stops the notifications.";

pub fn ping() -> &'static str {
    "pong"
}

/// Reply to `/discord_notification` in a Telegram chat.
pub fn discord_notification(chat_id: DestinationId) -> String {
    format!(
        "Great, ready to go!\nNow subscribe to a Discord voice channel using this chat's id in the command: {}",
        chat_id
    )
}

/// Parse a Telegram chat id (negative for groups).
pub fn parse_chat_id(raw: &str) -> Option<DestinationId> {
    raw.trim().parse::<DestinationId>().ok().filter(|id| *id != 0)
}

pub async fn subscribe(
    relay: &Relay,
    guild_id: Option<u64>,
    channel: Option<&ChannelRef>,
    chat_id: Option<&str>,
) -> String {
    let Some(guild_id) = guild_id else {
        return "You can only subscribe for events in server's channels.".to_string();
    };
    let Some(channel) = channel else {
        return "You can't subscribe if you don't provide a channel for that.".to_string();
    };
    let Some(raw) = chat_id.filter(|raw| !raw.trim().is_empty()) else {
        return "You can't subscribe if you don't provide a telegram chat to notify.".to_string();
    };
    let Some(chat_id) = parse_chat_id(raw) else {
        return format!("{} is not a telegram chat id.", raw.trim());
    };

    if !relay.subscribe(guild_id, channel.id, chat_id).await {
        return format!(
            "There is an active subscriber for channel {} that notifies {}.",
            channel.name, chat_id
        );
    }
    info!("Subscribed chat {} to channel {} ({})", chat_id, channel.name, channel.id);
    format!(
        "Subscribed for events in channel {} and will notify {}.",
        channel.name, chat_id
    )
}

pub async fn unsubscribe(
    relay: &Relay,
    guild_id: Option<u64>,
    channel: Option<&ChannelRef>,
    chat_id: Option<&str>,
) -> String {
    if guild_id.is_none() {
        return "You can only unsubscribe from events in server's channels.".to_string();
    }
    let Some(channel) = channel else {
        return "You can't unsubscribe if you don't provide a channel for that.".to_string();
    };
    if !relay.is_watched(channel.id).await {
        return format!("There is no active subscriber for channel {}.", channel.name);
    }

    match chat_id.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => {
            let Some(chat_id) = parse_chat_id(raw) else {
                return format!("{} is not a telegram chat id.", raw);
            };
            if relay.unsubscribe(channel.id, Some(chat_id)).await.is_empty() {
                return format!(
                    "Telegram chat {} is not subscribed to events in {}.",
                    chat_id, channel.name
                );
            }
            format!(
                "You have unsubscribed telegram chat {} from events in {}.",
                chat_id, channel.name
            )
        }
        None => {
            relay.unsubscribe(channel.id, None).await;
            format!("You have unsubscribed from events in {}.", channel.name)
        }
    }
}

/// `/wordle <subcommand>`.
pub async fn wordle(scheduler: &WordleScheduler, guild_id: Option<u64>, subcommand: &str) -> String {
    let Some(guild_id) = guild_id else {
        return "Wordle scheduler only works in servers.".to_string();
    };

    match subcommand {
        "start" => match scheduler.start(guild_id).await {
            Ok(StartOutcome::AlreadyRunning(_)) => "Scheduler is already running!".to_string(),
            Ok(StartOutcome::Started(schedule)) => format!(
                "Starting Wordle scheduler\nNext Wordle is in {} mins, get ready!",
                scheduler.minutes_until_start(&schedule)
            ),
            Err(e) => {
                warn!("Failed to start wordle scheduler in guild {}: {}", guild_id, e);
                format!("Could not create the event: {}", e)
            }
        },
        "stop" => {
            if scheduler.stop(guild_id).await {
                "Stopped Wordle scheduler".to_string()
            } else {
                "There is no running scheduler right now".to_string()
            }
        }
        "status" => match scheduler.status(guild_id).await.filter(|s| s.running) {
            Some(schedule) => format!(
                "There is currently running Wordle scheduler.\nNext Wordle is in {} mins, get ready!",
                scheduler.minutes_until_start(&schedule)
            ),
            None => "There is no currently running Wordle scheduler.\nYou can start one with `/wordle start`"
                .to_string(),
        },
        "clearall" => match scheduler.clear_all(guild_id).await {
            Ok(_) => "All events are deleted".to_string(),
            Err(e) => format!("Could not delete events: {}", e),
        },
        "whitelist" => match scheduler.whitelist(guild_id).await {
            Ok(_) => "Completed.".to_string(),
            Err(e) => format!("Could not delete events: {}", e),
        },
        _ => "There is no such command.".to_string(),
    }
}
