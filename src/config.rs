//! Gateway configuration module
//!
//! Handles loading configuration from environment variables. Everything is
//! resolved once at startup into fully-populated structs; nothing is
//! re-derived at runtime.

use crate::error::GatewayError;
use crate::protocol::PresenceUpdate;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use twilight_model::gateway::Intents;

/// Smallest large-guild threshold accepted by the gateway
pub const MIN_LARGE_THRESHOLD: u64 = 50;
/// Largest large-guild threshold accepted by the gateway
pub const MAX_LARGE_THRESHOLD: u64 = 250;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Shard and spawn behaviour
    pub shard: ShardOptions,
}

/// Total shard count source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalShards {
    /// Use the gateway's recommended count
    Auto,
    Fixed(u32),
}

/// Which slice of the shard space this process owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardingOptions {
    pub total: TotalShards,
    /// Shards to spawn; defaults to the total
    pub shards: Option<u32>,
    /// First shard id to spawn; defaults to 0
    pub offset: Option<u32>,
}

impl Default for ShardingOptions {
    fn default() -> Self {
        Self {
            total: TotalShards::Auto,
            shards: None,
            offset: None,
        }
    }
}

/// Options shared by the pool and every shard it creates.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub intents: Intents,
    pub large_threshold: u64,
    /// Presence sent with identify
    pub presence: Option<PresenceUpdate>,
    pub sharding: ShardingOptions,
    /// Pause between failed connection attempts
    pub spawn_attempt_delay: Duration,
    /// Attempt ceiling for `spawn` (restart is unbounded)
    pub spawn_max_attempts: u32,
    /// How long a single attempt may take to reach a live session
    pub spawn_timeout: Duration,
    /// How long to wait for the initial guild backlog
    pub guilds_ready_timeout: Duration,
    /// Pause before reconnecting after an invalid session
    pub invalid_session_delay: Duration,
    /// Pause between concurrency buckets
    pub bucket_cooldown: Duration,
    pub disable_bucket_ratelimits: bool,
    /// Overrides the URL returned by gateway metadata
    pub custom_socket_url: Option<String>,
    pub version: u8,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            intents: default_intents(),
            large_threshold: MIN_LARGE_THRESHOLD,
            presence: None,
            sharding: ShardingOptions::default(),
            spawn_attempt_delay: Duration::from_millis(2500),
            spawn_max_attempts: 10,
            spawn_timeout: Duration::from_secs(30),
            guilds_ready_timeout: Duration::from_secs(15),
            invalid_session_delay: Duration::from_millis(2500),
            bucket_cooldown: Duration::from_secs(5),
            disable_bucket_ratelimits: false,
            custom_socket_url: None,
            version: 10,
        }
    }
}

impl ShardOptions {
    /// Check invariants `Default` and `from_env` cannot express in types.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !(MIN_LARGE_THRESHOLD..=MAX_LARGE_THRESHOLD).contains(&self.large_threshold) {
            return Err(GatewayError::Config(format!(
                "LARGE_THRESHOLD must be between {MIN_LARGE_THRESHOLD} and {MAX_LARGE_THRESHOLD}, got {}",
                self.large_threshold
            )));
        }
        if self.spawn_max_attempts == 0 {
            return Err(GatewayError::Config(
                "SPAWN_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.spawn_timeout.is_zero() {
            return Err(GatewayError::Config(
                "SPAWN_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Every non-privileged intent.
pub fn default_intents() -> Intents {
    Intents::all() - privileged_intents()
}

fn privileged_intents() -> Intents {
    Intents::GUILD_MEMBERS | Intents::GUILD_PRESENCES | Intents::MESSAGE_CONTENT
}

/// Parse an intents setting: a raw bitfield, `all`, or `default`.
pub fn parse_intents(value: &str) -> Result<Intents, GatewayError> {
    match value.trim() {
        "all" => Ok(Intents::all()),
        "default" | "" => Ok(default_intents()),
        raw => raw
            .parse::<u64>()
            .map(Intents::from_bits_truncate)
            .map_err(|e| GatewayError::Config(format!("INTENTS must be a number, \"all\" or \"default\": {e}"))),
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| GatewayError::Config(
                "DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string(),
            ))?;

        let nats_url = env::var("NATS_URL").ok();

        let http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT")) // Backwards compat
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let shard = shard_options_from(|key| env::var(key).ok())?;

        Ok(Self {
            discord_token,
            nats_url,
            http_port,
            log_level,
            shard,
        })
    }
}

/// Build [`ShardOptions`] from a key lookup, falling back to defaults.
pub fn shard_options_from<F>(lookup: F) -> Result<ShardOptions, GatewayError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ShardOptions::default();

    let total = match lookup("TOTAL_SHARDS").as_deref().map(str::trim) {
        None | Some("") | Some("auto") => TotalShards::Auto,
        Some(raw) => TotalShards::Fixed(parse_value("TOTAL_SHARDS", raw)?),
    };

    let options = ShardOptions {
        intents: match lookup("INTENTS") {
            Some(raw) => parse_intents(&raw)?,
            None => defaults.intents,
        },
        large_threshold: parse_or("LARGE_THRESHOLD", &lookup, defaults.large_threshold)?,
        presence: None,
        sharding: ShardingOptions {
            total,
            shards: parse_opt("SHARD_COUNT", &lookup)?,
            offset: parse_opt("SHARD_OFFSET", &lookup)?,
        },
        spawn_attempt_delay: millis_or("SPAWN_ATTEMPT_DELAY_MS", &lookup, defaults.spawn_attempt_delay)?,
        spawn_max_attempts: parse_or("SPAWN_MAX_ATTEMPTS", &lookup, defaults.spawn_max_attempts)?,
        spawn_timeout: millis_or("SPAWN_TIMEOUT_MS", &lookup, defaults.spawn_timeout)?,
        guilds_ready_timeout: millis_or("GUILDS_READY_TIMEOUT_MS", &lookup, defaults.guilds_ready_timeout)?,
        invalid_session_delay: millis_or("INVALID_SESSION_DELAY_MS", &lookup, defaults.invalid_session_delay)?,
        bucket_cooldown: millis_or("BUCKET_COOLDOWN_MS", &lookup, defaults.bucket_cooldown)?,
        disable_bucket_ratelimits: parse_or("DISABLE_BUCKET_RATELIMITS", &lookup, false)?,
        custom_socket_url: lookup("GATEWAY_SOCKET_URL").filter(|url| !url.trim().is_empty()),
        version: parse_or("GATEWAY_VERSION", &lookup, defaults.version)?,
    };

    options.validate()?;
    Ok(options)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, GatewayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| GatewayError::Config(format!("{key} is invalid: {e}")))
}

fn parse_opt<T, F>(key: &str, lookup: &F) -> Result<Option<T>, GatewayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|raw| parse_value(key, &raw)).transpose()
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T, GatewayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(key, lookup)?.unwrap_or(default))
}

fn millis_or<F>(key: &str, lookup: &F, default: Duration) -> Result<Duration, GatewayError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt::<u64, _>(key, lookup)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}
