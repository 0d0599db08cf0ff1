//! Gateway wire payloads
//!
//! Control-frame opcodes plus the outbound command shapes sent by shards and
//! the pool. Dispatch bodies stay as raw JSON; only the fields the state
//! machine needs (READY guilds, member chunk bookkeeping) are typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use twilight_model::gateway::presence::Status;
use twilight_model::gateway::Intents;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};
use twilight_model::id::Id;

/// Byte ceiling for guild member request nonces.
pub const MAX_MEMBER_NONCE_LENGTH: usize = 32;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

/// Any frame received from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// Hello body
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// Subset of the READY dispatch the state machine relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UnavailableGuild {
    pub id: Id<GuildMarker>,
}

/// GUILD_CREATE / GUILD_DELETE fields used for guild bookkeeping.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GuildRef {
    pub id: Id<GuildMarker>,
    #[serde(default)]
    pub unavailable: Option<bool>,
}

/// Outbound frame envelope
#[derive(Debug, Clone, Serialize)]
pub struct Command<T> {
    pub op: u8,
    pub d: T,
}

impl<T: Serialize> Command<T> {
    pub fn new(op: OpCode, d: T) -> Self {
        Self { op: op as u8, d }
    }
}

/// Presence data used in identify and presence updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub since: Option<u64>,
    #[serde(default)]
    pub activities: Vec<Value>,
    pub status: Status,
    #[serde(default)]
    pub afk: bool,
}

impl Default for PresenceUpdate {
    fn default() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: Status::Online,
            afk: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl IdentifyProperties {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify body sent on a fresh session.
#[derive(Debug, Clone, Serialize)]
pub struct Identify<'a> {
    pub token: &'a str,
    pub intents: u64,
    pub large_threshold: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<&'a PresenceUpdate>,
    pub properties: IdentifyProperties,
    pub shard: [u32; 2],
}

impl<'a> Identify<'a> {
    pub fn new(
        token: &'a str,
        intents: Intents,
        large_threshold: u64,
        presence: Option<&'a PresenceUpdate>,
        shard: [u32; 2],
    ) -> Self {
        Self {
            token,
            intents: intents.bits(),
            large_threshold,
            presence,
            properties: IdentifyProperties::current(),
            shard,
        }
    }
}

/// Resume body
#[derive(Debug, Clone, Serialize)]
pub struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

/// Voice state update body
#[derive(Debug, Clone, Serialize)]
pub struct VoiceStateUpdate {
    pub guild_id: Id<GuildMarker>,
    pub channel_id: Option<Id<ChannelMarker>>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Request guild members body
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembers {
    pub guild_id: Id<GuildMarker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u64,
    pub presences: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<Id<UserMarker>>>,
    pub nonce: String,
}

/// GUILD_MEMBERS_CHUNK body, members and presences kept raw.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberChunk {
    pub guild_id: Id<GuildMarker>,
    #[serde(default)]
    pub nonce: Option<String>,
    pub chunk_index: u32,
    #[serde(default = "default_chunk_count")]
    pub chunk_count: u32,
    #[serde(default)]
    pub members: Vec<Value>,
    #[serde(default)]
    pub presences: Option<Vec<Value>>,
    #[serde(default)]
    pub not_found: Option<Vec<Id<UserMarker>>>,
}

fn default_chunk_count() -> u32 {
    1
}

/// Heartbeat frame, carrying the last sequence seen (or null).
pub fn heartbeat(sequence: Option<u64>) -> Command<Option<u64>> {
    Command::new(OpCode::Heartbeat, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trips_through_u8() {
        for op in [0u8, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11] {
            let code = OpCode::from_u8(op).expect("known opcode");
            assert_eq!(code as u8, op);
        }
        assert!(OpCode::from_u8(5).is_none());
        assert!(OpCode::from_u8(42).is_none());
    }

    #[test]
    fn inbound_payload_tolerates_missing_fields() {
        let payload: InboundPayload = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(payload.op, 11);
        assert!(payload.d.is_null());
        assert!(payload.s.is_none());
        assert!(payload.t.is_none());
    }

    #[test]
    fn heartbeat_serializes_null_sequence() {
        let json = serde_json::to_string(&heartbeat(None)).unwrap();
        assert_eq!(json, r#"{"op":1,"d":null}"#);
        let json = serde_json::to_string(&heartbeat(Some(42))).unwrap();
        assert_eq!(json, r#"{"op":1,"d":42}"#);
    }

    #[test]
    fn member_chunk_defaults_chunk_count() {
        let chunk: MemberChunk = serde_json::from_str(
            r#"{"guild_id":"81384788765712384","chunk_index":0,"members":[]}"#,
        )
        .unwrap();
        assert_eq!(chunk.chunk_count, 1);
        assert!(chunk.nonce.is_none());
    }
}
