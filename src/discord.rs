//! Discord gateway adapter (serenity): voice presence in, slash commands,
//! scheduled events out.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    Cache, ChannelId, ChannelType, CommandDataOptionValue, CommandInteraction, CommandOptionType,
    Context, CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateScheduledEvent, EditInteractionResponse, EventHandler,
    GuildId, Http, Interaction, Ready, ResolvedValue, ScheduledEventType, Timestamp, VoiceState,
};
use tracing::{debug, error, info, warn};

use crate::relay::commands::{self, ChannelRef};
use crate::relay::snapshot::{RawChannelState, RawMember};
use crate::relay::wordle::{GuildError, GuildEvents, WordleScheduler};
use crate::relay::Relay;

/// Build the raw state of a guild channel from the gateway cache.
pub fn channel_state(cache: &Cache, guild_id: GuildId, channel_id: ChannelId) -> Option<RawChannelState> {
    let guild = cache.guild(guild_id)?;
    let channel = guild.channels.get(&channel_id);

    let members = guild
        .voice_states
        .values()
        .filter(|vs| vs.channel_id == Some(channel_id))
        .map(|vs| {
            let member = vs.member.as_ref().or_else(|| guild.members.get(&vs.user_id));
            RawMember {
                user_id: vs.user_id.get(),
                member_id: Some(vs.user_id.get()),
                user_name: member.map(|m| m.user.name.clone()),
                display_name: member.map(|m| m.display_name().to_string()),
                self_mute: Some(vs.self_mute),
                self_deaf: Some(vs.self_deaf),
                server_mute: Some(vs.mute),
                server_deaf: Some(vs.deaf),
                streaming: vs.self_stream,
            }
        })
        .collect();

    Some(RawChannelState {
        channel_id: channel_id.get(),
        channel_name: channel.map(|c| c.name.clone()),
        channel_type: channel.map(|c| format!("{:?}", c.kind)),
        guild_id: Some(guild_id.get()),
        guild_name: Some(guild.name.clone()),
        members,
    })
}

/// Scheduled events through the Discord HTTP API.
pub struct SerenityGuildEvents {
    http: Arc<Http>,
}

impl SerenityGuildEvents {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn timestamp(at: DateTime<Utc>) -> Result<Timestamp, GuildError> {
    Timestamp::from_unix_timestamp(at.timestamp()).map_err(|e| GuildError::Api(e.to_string()))
}

#[async_trait]
impl GuildEvents for SerenityGuildEvents {
    async fn create_event(
        &self,
        guild_id: u64,
        name: &str,
        location: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), GuildError> {
        let event = CreateScheduledEvent::new(ScheduledEventType::External, name, timestamp(start)?)
            .end_time(timestamp(end)?)
            .location(location);
        GuildId::new(guild_id)
            .create_scheduled_event(&self.http, event)
            .await
            .map(|_| ())
            .map_err(|e| GuildError::Api(e.to_string()))
    }

    async fn clear_events(&self, guild_id: u64) -> Result<usize, GuildError> {
        let guild = GuildId::new(guild_id);
        let events = guild
            .scheduled_events(&self.http, false)
            .await
            .map_err(|e| GuildError::Api(e.to_string()))?;

        let mut deleted = 0;
        for event in events {
            match guild.delete_scheduled_event(&self.http, event.id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete scheduled event {}: {}", event.id, e),
            }
        }
        Ok(deleted)
    }
}

/// Slash commands registered in every guild.
pub fn command_definitions() -> Vec<CreateCommand> {
    let subcommand = |name: &str, description: &str| {
        CreateCommandOption::new(CommandOptionType::SubCommand, name, description)
    };
    let channel_option = || {
        CreateCommandOption::new(CommandOptionType::Channel, "channel", "Voice channel to watch")
            .required(true)
            .channel_types(vec![ChannelType::Voice, ChannelType::Stage])
    };

    vec![
        CreateCommand::new("ping").description("Replies with pong!"),
        CreateCommand::new("subscribe")
            .description("Notify a Telegram chat about who is in a voice channel")
            .add_option(channel_option())
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "telegram_chat_id",
                    "Telegram chat id (send /discord_notification to the bot to get it)",
                )
                .required(true),
            ),
        CreateCommand::new("unsubscribe")
            .description("Stop notifications for a voice channel")
            .add_option(channel_option())
            .add_option(CreateCommandOption::new(
                CommandOptionType::String,
                "telegram_chat_id",
                "Only stop notifying this chat",
            )),
        CreateCommand::new("wordle")
            .description("Wordle scheduler")
            .add_option(subcommand("start", "Start Wordle Scheduler"))
            .add_option(subcommand("stop", "Stop Wordle Scheduler"))
            .add_option(subcommand("status", "Show info about Wordle Scheduler"))
            .add_option(subcommand("clearall", "WARNING!!! Will clear all scheduled events"))
            .add_option(subcommand(
                "whitelist",
                "Clear all scheduled events and forget the Wordle scheduler",
            )),
    ]
}

#[derive(Debug, Default, PartialEq)]
struct CommandArgs {
    channel: Option<ChannelRef>,
    telegram_chat_id: Option<String>,
    subcommand: Option<String>,
}

fn command_args(command: &CommandInteraction) -> CommandArgs {
    let mut args = CommandArgs::default();
    for option in command.data.options() {
        match (option.name, option.value) {
            ("channel", ResolvedValue::Channel(channel)) => {
                args.channel = Some(ChannelRef {
                    id: channel.id.get(),
                    name: channel.name.clone().unwrap_or_else(|| channel.id.to_string()),
                });
            }
            ("telegram_chat_id", ResolvedValue::String(raw)) => {
                args.telegram_chat_id = Some(raw.to_string());
            }
            (name, ResolvedValue::SubCommand(_)) => args.subcommand = Some(name.to_string()),
            _ => {}
        }
    }
    // Channel options are sometimes left unresolved.
    if args.channel.is_none() {
        args.channel = command.data.options.iter().find_map(|o| match o.value {
            CommandDataOptionValue::Channel(id) if o.name == "channel" => Some(ChannelRef {
                id: id.get(),
                name: id.to_string(),
            }),
            _ => None,
        });
    }
    args
}

/// Serenity event handler.
pub struct Handler {
    relay: Option<Arc<Relay>>,
    wordle: Arc<WordleScheduler>,
}

impl Handler {
    /// `relay` is `None` when Telegram is not configured.
    pub fn new(relay: Option<Arc<Relay>>, wordle: Arc<WordleScheduler>) -> Self {
        Self { relay, wordle }
    }

    async fn refresh(&self, relay: &Relay, cache: &Cache, guild_id: GuildId, channel_id: ChannelId) {
        let Some(raw) = channel_state(cache, guild_id, channel_id) else {
            debug!("Channel {} of guild {} not in cache", channel_id, guild_id);
            return;
        };
        relay.presence_changed(raw).await;
    }

    async fn run_command(&self, ctx: &Context, command: &CommandInteraction) -> String {
        let guild_id = command.guild_id.map(|g| g.get());
        let args = command_args(command);

        match command.data.name.as_str() {
            "ping" => commands::ping().to_string(),
            "subscribe" | "unsubscribe" => {
                let Some(relay) = &self.relay else {
                    return "Telegram notifications are not configured on this bot.".to_string();
                };
                let chat_id = args.telegram_chat_id.as_deref();
                if command.data.name == "subscribe" {
                    let reply = commands::subscribe(relay, guild_id, args.channel.as_ref(), chat_id).await;
                    if let (Some(guild_id), Some(channel)) = (command.guild_id, &args.channel) {
                        self.refresh(relay, &ctx.cache, guild_id, ChannelId::new(channel.id)).await;
                    }
                    reply
                } else {
                    commands::unsubscribe(relay, guild_id, args.channel.as_ref(), chat_id).await
                }
            }
            "wordle" => {
                let subcommand = args.subcommand.as_deref().unwrap_or_default();
                commands::wordle(&self.wordle, guild_id, subcommand).await
            }
            _ => "There is no such command.".to_string(),
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🎮 Discord client ready as {}", ready.user.name);
        for guild in &ready.guilds {
            match guild.id.set_commands(&ctx.http, command_definitions()).await {
                Ok(registered) => info!("Registered {} commands in guild {}", registered.len(), guild.id),
                Err(e) => error!("Failed to register commands in guild {}: {}", guild.id, e),
            }
        }
    }

    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        for guild_id in guilds {
            info!("Found myself in guild {}, reviving stored state", guild_id);
            self.wordle.restore(guild_id.get()).await;

            let Some(relay) = &self.relay else {
                continue;
            };
            for sub in relay.restore_guild(guild_id.get()).await {
                self.refresh(relay, &ctx.cache, guild_id, ChannelId::new(sub.channel_id))
                    .await;
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(relay) = &self.relay else {
            return;
        };
        let Some(guild_id) = new.guild_id.or_else(|| old.as_ref().and_then(|o| o.guild_id)) else {
            return;
        };

        let touched: BTreeSet<ChannelId> = old
            .as_ref()
            .and_then(|o| o.channel_id)
            .into_iter()
            .chain(new.channel_id)
            .collect();
        for channel_id in touched {
            if relay.is_watched(channel_id.get()).await {
                self.refresh(relay, &ctx.cache, guild_id, channel_id).await;
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        info!(
            "⚡ /{} from {} in guild {:?}",
            command.data.name, command.user.name, command.guild_id
        );

        // Event creation can outlast the interaction deadline.
        let deferred = command.data.name == "wordle";
        if deferred {
            if let Err(e) = command.defer(&ctx.http).await {
                warn!("Failed to defer /{}: {}", command.data.name, e);
            }
        }

        let reply = self.run_command(&ctx, &command).await;
        info!("Responding with [{}]", reply.replace('\n', "\\n"));

        let result = if deferred {
            command
                .edit_response(&ctx.http, EditInteractionResponse::new().content(reply))
                .await
                .map(|_| ())
        } else {
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().content(reply)),
                )
                .await
        };
        if let Err(e) = result {
            error!("Failed to answer /{}: {}", command.data.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_definitions_cover_surface() {
        let names: Vec<String> = command_definitions()
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .filter_map(|v| v.get("name").and_then(|n| n.as_str()).map(String::from))
            .collect();
        assert_eq!(names, vec!["ping", "subscribe", "unsubscribe", "wordle"]);
    }

    #[test]
    fn test_wordle_subcommands() {
        let wordle = command_definitions()
            .into_iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .find(|v| v["name"] == "wordle")
            .unwrap();
        let subs: Vec<&str> = wordle["options"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|o| o["name"].as_str())
            .collect();
        assert_eq!(subs, vec!["start", "stop", "status", "clearall", "whitelist"]);
    }

    #[test]
    fn test_timestamp_conversion() {
        let at = DateTime::from_timestamp(1_715_374_800, 0).unwrap();
        assert_eq!(timestamp(at).unwrap().unix_timestamp(), 1_715_374_800);
    }
}
