//! Domain error types for the shard gateway
//!
//! Structured thiserror types for navigable diagnostics and exhaustive handling.
//!
//! anyhow stays in main.rs at the process boundary.
//! All library code returns Result<T, GatewayError>.

use thiserror::Error;

/// Boxed source error carried across task boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// Callers can pattern-match on the variant to understand the failure
/// mode without parsing error message strings.
///
/// Example log output:
/// ```text
/// GatewayError::MaxSpawnAttempts { shard_id: 3, attempts: 10 }
/// → "shard 3 failed to spawn after 10 attempts"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A spawn or restart is already in flight for this shard
    #[error("shard {shard_id} is already connecting to the gateway")]
    AlreadyConnecting { shard_id: u32 },

    /// A kill interrupted an in-flight spawn or restart
    #[error("shard {shard_id} connection attempts interrupted by kill")]
    InterruptedByKill { shard_id: u32 },

    /// Spawn retries exhausted
    #[error("shard {shard_id} failed to spawn after {attempts} attempts")]
    MaxSpawnAttempts { shard_id: u32, attempts: u32 },

    /// A single connection attempt did not reach a live session in time
    #[error("shard {shard_id} timed out after {timeout_ms}ms while connecting")]
    ConnectTimeout { shard_id: u32, timeout_ms: u64 },

    /// The socket closed before the session became live
    #[error("shard {shard_id} socket closed during init with code {code}: \"{reason}\"")]
    ClosedDuringInit {
        shard_id: u32,
        code: u16,
        reason: String,
    },

    /// Tried to transmit while no socket is open
    #[error("shard {shard_id} cannot send data when the socket is not open")]
    SendWithoutOpenSocket { shard_id: u32 },

    /// Queued send rejected because the shard was closed
    #[error("shard {shard_id} send queue force flushed")]
    QueueForceFlushed { shard_id: u32 },

    /// Lifecycle call made from a state that does not allow it
    #[error("shard {shard_id} cannot {operation} while {state}")]
    InvalidShardState {
        shard_id: u32,
        operation: &'static str,
        state: &'static str,
    },

    /// Socket transport failure (connect, send or receive)
    #[error("socket transport failed")]
    Transport(#[source] BoxError),

    /// Sharding parameters do not describe a valid spawn range
    #[error("invalid shard configuration: {total} total shards, {shards} to spawn with an offset of {offset}")]
    InvalidShardConfig { total: u32, shards: u32, offset: u32 },

    /// Not enough session starts left to spawn the requested shards
    #[error("session start limit reached: tried to spawn {requested} shards when only {remaining} more are allowed, resets in {reset_after_ms}ms")]
    SessionStartLimit {
        requested: u32,
        remaining: u32,
        reset_after_ms: u64,
    },

    /// Gateway metadata returned by the REST layer is unusable
    #[error("invalid gateway metadata: {0}")]
    InvalidGatewayInfo(String),

    /// Custom guild member request nonce exceeds the byte ceiling
    #[error("nonce is {len} bytes, greater than the allowed {max} bytes")]
    NonceTooLong { len: usize, max: usize },

    /// Another member request is already waiting on this nonce
    #[error("a guild member request with nonce {nonce:?} is already in flight")]
    NonceInUse { nonce: String },

    /// The chunk listener of a member request was closed before the last chunk
    #[error("member request listener for nonce {nonce:?} closed before the last chunk")]
    MemberListenerClosed { nonce: String },

    /// Guild member request with both a query and user ids
    #[error("guild member request cannot have both a query and user ids")]
    InvalidMemberRequest,

    /// No local shard owns the guild
    #[error("no local shard for guild {guild_id} (computed shard {shard_id})")]
    NoShardForGuild { guild_id: u64, shard_id: u32 },

    /// Operation requires a prior connect()
    #[error("gateway is not connected")]
    NotConnected,

    /// connect() called while every local shard is running
    #[error("shards are already connected")]
    AlreadyConnected,

    /// REST collaborator failed
    #[error("gateway metadata request failed")]
    Rest(#[source] BoxError),

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: BoxError,
    },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] BoxError),

    /// Payload serialization failed
    #[error("payload serialization failed on shard {shard_id}")]
    SerializationFailed {
        shard_id: u32,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::AlreadyConnecting { .. } => "already_connecting",
            Self::InterruptedByKill { .. } => "interrupted_by_kill",
            Self::MaxSpawnAttempts { .. } => "max_spawn_attempts",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::ClosedDuringInit { .. } => "closed_during_init",
            Self::SendWithoutOpenSocket { .. } => "send_without_socket",
            Self::QueueForceFlushed { .. } => "queue_force_flushed",
            Self::InvalidShardState { .. } => "invalid_shard_state",
            Self::Transport(_) => "transport",
            Self::InvalidShardConfig { .. } => "invalid_shard_config",
            Self::SessionStartLimit { .. } => "session_start_limit",
            Self::InvalidGatewayInfo(_) => "invalid_gateway_info",
            Self::NonceTooLong { .. } => "nonce_too_long",
            Self::NonceInUse { .. } => "nonce_in_use",
            Self::MemberListenerClosed { .. } => "member_listener_closed",
            Self::InvalidMemberRequest => "invalid_member_request",
            Self::NoShardForGuild { .. } => "no_shard",
            Self::NotConnected => "not_connected",
            Self::AlreadyConnected => "already_connected",
            Self::Rest(_) => "rest",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::SerializationFailed { .. } => "serialization",
            Self::Config(_) => "config",
        }
    }

    /// True when the error stems from a deliberate kill rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::InterruptedByKill { .. })
    }

    /// True for send rejections caused by a forced queue flush.
    pub fn is_force_flush(&self) -> bool {
        matches!(self, Self::QueueForceFlushed { .. })
    }

    pub(crate) fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(source))
    }

    pub(crate) fn rest(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Rest(Box::new(source))
    }
}
