//! Event serialization for message broker
//!
//! Wraps raw dispatches in an envelope for NATS publishing.

use super::Dispatch;
use serde::Serialize;
use uuid::Uuid;

/// Broker envelope for a dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEnvelope {
    pub event_id: String,
    /// Dispatch name, e.g. `GUILD_CREATE`
    pub event_type: String,
    pub shard_id: u32,
    /// Unix milliseconds at envelope creation
    pub timestamp: u64,
    pub sequence: Option<u64>,
    pub guild_id: Option<String>,
    pub data: serde_json::Value,
}

impl DispatchEnvelope {
    pub fn from_dispatch(dispatch: &Dispatch) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: dispatch.kind.clone(),
            shard_id: dispatch.shard_id,
            timestamp,
            sequence: dispatch.sequence,
            guild_id: guild_id_of(dispatch),
            data: dispatch.data.clone(),
        }
    }
}

/// Guild a dispatch belongs to, if any.
///
/// Guild lifecycle dispatches carry the guild as their own `id`.
fn guild_id_of(dispatch: &Dispatch) -> Option<String> {
    let field = match dispatch.kind.as_str() {
        "GUILD_CREATE" | "GUILD_UPDATE" | "GUILD_DELETE" => "id",
        _ => "guild_id",
    };

    dispatch
        .data
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatch(kind: &str, data: serde_json::Value) -> Dispatch {
        Dispatch {
            shard_id: 3,
            kind: kind.to_string(),
            sequence: Some(12),
            data,
        }
    }

    #[test]
    fn guild_lifecycle_uses_own_id() {
        let envelope = DispatchEnvelope::from_dispatch(&dispatch(
            "GUILD_CREATE",
            json!({"id": "123456789012345678", "name": "Test Guild"}),
        ));

        assert_eq!(envelope.guild_id.as_deref(), Some("123456789012345678"));
        assert_eq!(envelope.event_type, "GUILD_CREATE");
        assert_eq!(envelope.shard_id, 3);
        assert_eq!(envelope.sequence, Some(12));
    }

    #[test]
    fn member_events_use_guild_id_field() {
        let envelope = DispatchEnvelope::from_dispatch(&dispatch(
            "GUILD_MEMBER_ADD",
            json!({"guild_id": "42", "user": {"id": "7"}}),
        ));
        assert_eq!(envelope.guild_id.as_deref(), Some("42"));
    }

    #[test]
    fn dispatch_without_guild_has_none() {
        let envelope = DispatchEnvelope::from_dispatch(&dispatch("USER_UPDATE", json!({"id": "7"})));
        assert!(envelope.guild_id.is_none());
    }

    #[test]
    fn envelope_serializes_all_fields() {
        let envelope = DispatchEnvelope::from_dispatch(&dispatch("TYPING_START", json!({})));
        let value = serde_json::to_value(&envelope).unwrap();

        for field in ["event_id", "event_type", "shard_id", "timestamp", "sequence", "guild_id", "data"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert!(Uuid::parse_str(&envelope.event_id).is_ok());
    }
}
