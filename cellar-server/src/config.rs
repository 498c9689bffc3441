use anyhow::{Context, Result};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use cellar_core::{ChannelId, MemberId};

#[derive(Clone)]
pub struct Config {
    pub discord_bot_token: String,
    pub discord_api_base: String,
    /// The bot's own user id; its reactions are ignored.
    pub bot_user_id: MemberId,
    /// Channels reactions are accepted from. Empty accepts any channel.
    pub market_channel_ids: HashSet<ChannelId>,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Optional bearer token for the write endpoints.
    /// If not set, those endpoints are disabled (return 503).
    pub api_token: Option<String>,
    /// Delete the previous status message when posting a new one.
    pub replace_status_messages: bool,
    pub reminder_delay: chrono::Duration,
    pub retention_hours: i64,
    pub retention_interval: Duration,
    pub misfire_grace: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let discord_bot_token = env::var("DISCORD_BOT_TOKEN")
            .context("DISCORD_BOT_TOKEN environment variable is required")?;

        let discord_api_base = env::var("DISCORD_API_BASE")
            .unwrap_or_else(|_| "https://discord.com/api/v10".to_string());

        let bot_user_id = env::var("BOT_USER_ID")
            .context("BOT_USER_ID environment variable is required")?
            .parse::<u64>()
            .context("BOT_USER_ID must be a valid number")?;

        let market_channel_ids =
            parse_channel_ids(&env::var("MARKET_CHANNEL_IDS").unwrap_or_default())
                .context("MARKET_CHANNEL_IDS must be a comma-separated list of numbers")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let api_token = parse_api_token(env::var("API_TOKEN").ok());

        let replace_status_messages: bool = env_setting("REPLACE_STATUS_MESSAGES", true)?;

        let reminder_delay_hours: i64 = env_setting("REMINDER_DELAY_HOURS", 24)?;
        let retention_hours: i64 = env_setting("RETENTION_HOURS", 168)?;
        let retention_interval_minutes: u64 = env_setting("RETENTION_INTERVAL_MINUTES", 60)?;
        let misfire_grace_seconds: u64 = env_setting("MISFIRE_GRACE_SECONDS", 60)?;
        let cache_ttl_seconds: u64 = env_setting("CACHE_TTL_SECONDS", 300)?;
        let cache_capacity: usize = env_setting("CACHE_CAPACITY", 256)?;

        Ok(Config {
            discord_bot_token,
            discord_api_base,
            bot_user_id: MemberId(bot_user_id),
            market_channel_ids,
            port,
            state_dir,
            api_token,
            replace_status_messages,
            reminder_delay: chrono::Duration::hours(reminder_delay_hours),
            retention_hours,
            retention_interval: Duration::from_secs(retention_interval_minutes.max(1) * 60),
            misfire_grace: Duration::from_secs(misfire_grace_seconds),
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
            cache_capacity,
        })
    }
}

/// Read an optional variable, falling back to `default` when unset.
fn env_setting<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_setting(name, env::var(name).ok(), default)
}

/// Parse an optional setting. Unset falls back to `default`; a value that
/// does not parse is an error rather than a silent default.
pub fn parse_setting<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value '{}'", name, value.trim())),
        None => Ok(default),
    }
}

/// Parse API_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace.
/// This prevents an empty token from allowing unauthenticated access.
pub fn parse_api_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Parse a comma-separated list of channel ids. Blank entries are skipped.
pub fn parse_channel_ids(value: &str) -> Result<HashSet<ChannelId>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(ChannelId)
                .with_context(|| format!("invalid channel id '{}'", s))
        })
        .collect()
}
