use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::ChatId;

use crate::relay::store::RetryPolicy;
use crate::relay::wordle::WordleSettings;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    /// Telegram bot token. Without it the relay runs without notifications.
    telegram_bot_token: Option<String>,
    /// Discord bot token. Without it no presence events arrive.
    discord_token: Option<String>,
    /// Directory for state files (logs, store). Defaults to current directory.
    data_dir: Option<String>,
    #[serde(default = "default_true")]
    persist: bool,
    log_chat_id: Option<i64>,
    #[serde(default = "default_cooldown_secs")]
    notification_cooldown_secs: u64,
    #[serde(default = "default_idle_ttl_minutes")]
    notification_idle_ttl_minutes: u64,
    #[serde(default = "default_retry_interval_secs")]
    store_retry_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    store_max_retries: u32,
    #[serde(default)]
    wordle: WordleFile,
}

#[derive(Deserialize)]
#[serde(default)]
struct WordleFile {
    event_name: String,
    event_selector: String,
    location: String,
    start_hour: u32,
    start_min: u32,
    duration_minutes: u64,
}

impl Default for WordleFile {
    fn default() -> Self {
        let settings = WordleSettings::default();
        Self {
            event_name: settings.event_name,
            event_selector: settings.event_selector,
            location: settings.location,
            start_hour: settings.start_hour,
            start_min: settings.start_min,
            duration_minutes: settings.duration.as_secs() / 60,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_idle_ttl_minutes() -> u64 {
    60
}

fn default_retry_interval_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    15
}

pub struct Config {
    pub telegram_bot_token: Option<String>,
    pub discord_token: Option<String>,
    /// Directory for state files (logs, store).
    pub data_dir: PathBuf,
    /// SQLite store path, `None` when persistence is off.
    pub store_path: Option<PathBuf>,
    pub log_chat_id: Option<ChatId>,
    pub notification_cooldown: Duration,
    pub notification_idle_ttl: Duration,
    pub retry_policy: RetryPolicy,
    pub wordle: WordleSettings,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        let telegram_bot_token = file.telegram_bot_token.filter(|t| !t.trim().is_empty());
        if let Some(token) = &telegram_bot_token {
            // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
            let token_parts: Vec<&str> = token.split(':').collect();
            if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
                return Err(ConfigError::Validation(
                    "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
                ));
            }
        }
        let discord_token = file.discord_token.filter(|t| !t.trim().is_empty());

        if file.notification_cooldown_secs == 0 {
            return Err(ConfigError::Validation("notification_cooldown_secs must be positive".into()));
        }

        let wordle = file.wordle;
        if wordle.start_hour >= 24 {
            return Err(ConfigError::Validation("wordle.start_hour must be below 24".into()));
        }
        if wordle.start_min >= 60 {
            return Err(ConfigError::Validation("wordle.start_min must be below 60".into()));
        }
        if !(1..=24 * 60).contains(&wordle.duration_minutes) {
            return Err(ConfigError::Validation(
                "wordle.duration_minutes must be between 1 and 1440".into(),
            ));
        }
        if wordle.event_name.trim().is_empty() {
            return Err(ConfigError::Validation("wordle.event_name is required".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let store_path = file.persist.then(|| data_dir.join("store.db"));

        Ok(Self {
            telegram_bot_token,
            discord_token,
            store_path,
            data_dir,
            log_chat_id: file.log_chat_id.map(ChatId),
            notification_cooldown: Duration::from_secs(file.notification_cooldown_secs),
            notification_idle_ttl: Duration::from_secs(file.notification_idle_ttl_minutes * 60),
            retry_policy: RetryPolicy {
                interval: Duration::from_secs(file.store_retry_interval_secs),
                max_retries: file.store_max_retries,
            },
            wordle: WordleSettings {
                event_name: wordle.event_name,
                event_selector: wordle.event_selector,
                location: wordle.location,
                start_hour: wordle.start_hour,
                start_min: wordle.start_min,
                duration: Duration::from_secs(wordle.duration_minutes * 60),
            },
        })
    }
}
