use std::sync::Arc;
use std::time::Duration;

use serenity::all::{Client, GatewayIntents, Http};
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use voxbridge::config::Config;
use voxbridge::discord::{Handler, SerenityGuildEvents};
use voxbridge::relay::commands;
use voxbridge::relay::{
    DurableStore, NotificationRegistry, Relay, SqliteStore, SubscriptionStore, TelegramMessenger,
    WordleScheduler,
};
use voxbridge::telegram_log;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case", description = "These commands are supported:")]
enum Command {
    #[command(description = "what this bot does")]
    Start,
    #[command(description = "show this text")]
    Help,
    #[command(description = "check the bot is alive")]
    Ping,
    #[command(description = "get this chat's id for Discord /subscribe")]
    DiscordNotification,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "voxbridge.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = config.telegram_bot_token.as_deref().map(Bot::new);
    let messenger = bot.clone().map(|bot| Arc::new(TelegramMessenger::new(bot)));

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("voxbridge.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    match (config.log_chat_id, &messenger) {
        (Some(log_chat_id), Some(messenger)) => {
            let tg_layer = telegram_log::TelegramLogLayer::new(messenger.clone(), log_chat_id.0);
            registry.with(tg_layer).init();
        }
        _ => registry.init(),
    }

    info!("🚀 Starting voxbridge...");
    info!("Loaded config from {config_path}");

    let store = Arc::new(match &config.store_path {
        Some(path) => match SqliteStore::open(path) {
            Ok(sqlite) => {
                info!("💾 Persisting state to {}", path.display());
                DurableStore::new(Arc::new(sqlite), config.retry_policy)
            }
            Err(e) => {
                warn!("Failed to open store {}: {e}, running without persistence", path.display());
                DurableStore::disabled()
            }
        },
        None => {
            info!("Persistence disabled");
            DurableStore::disabled()
        }
    });

    let relay = messenger.map(|messenger| {
        Arc::new(Relay::new(
            SubscriptionStore::new(store.clone()),
            NotificationRegistry::new(messenger, config.notification_cooldown, config.notification_idle_ttl),
        ))
    });
    if relay.is_none() {
        warn!("No telegram_bot_token, voice channel notifications are disabled");
    }

    let discord = match &config.discord_token {
        Some(token) => {
            let http = Arc::new(Http::new(token));
            let wordle = Arc::new(WordleScheduler::new(
                store.clone(),
                Arc::new(SerenityGuildEvents::new(http)),
                config.wordle.clone(),
            ));
            let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
            match Client::builder(token, intents)
                .event_handler(Handler::new(relay.clone(), wordle))
                .await
            {
                Ok(mut client) => {
                    let shard_manager = client.shard_manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.start().await {
                            error!("Discord client stopped: {e}");
                        }
                    });
                    Some(shard_manager)
                }
                Err(e) => {
                    error!("Failed to create Discord client: {e}");
                    None
                }
            }
        }
        None => {
            warn!("No discord_token, presence events and Wordle scheduler are disabled");
            None
        }
    };

    match bot {
        Some(bot) => {
            let handler = Update::filter_message()
                .filter_command::<Command>()
                .endpoint(answer);
            Dispatcher::builder(bot, handler)
                .enable_ctrlc_handler()
                .build()
                .dispatch()
                .await;
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {e}");
            }
        }
    }

    info!("Shutting down");
    if let Some(shard_manager) = discord {
        shard_manager.shutdown_all().await;
    }
    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, store.flush()).await.is_err() {
        warn!("Pending store writes dropped at shutdown");
    }
}

async fn answer(bot: Bot, msg: Message, cmd: Command) -> ResponseResult<()> {
    info!("📨 /{} in chat {}", command_name(&cmd), msg.chat.id);
    let text = match cmd {
        Command::Start | Command::Help => {
            format!("{}\n\n{}", commands::HELP_TEXT, Command::descriptions())
        }
        Command::Ping => commands::ping().to_string(),
        Command::DiscordNotification => commands::discord_notification(msg.chat.id.0),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

fn command_name(cmd: &Command) -> &'static str {
    match cmd {
        Command::Start => "start",
        Command::Help => "help",
        Command::Ping => "ping",
        Command::DiscordNotification => "discord_notification",
    }
}
