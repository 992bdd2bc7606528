pub mod config;
pub mod discord;
pub mod relay;
pub mod telegram_log;
