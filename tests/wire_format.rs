//! Wire format conformance tests
//!
//! Outbound command JSON must match what the gateway expects byte for byte
//! in shape: opcode envelope, field names, omitted optionals. The broker
//! envelope shape is pinned here too since downstream consumers parse it.

use arrakis_shard_gateway::events::{Dispatch, DispatchEnvelope};
use arrakis_shard_gateway::protocol::{
    heartbeat, Command, Identify, OpCode, PresenceUpdate, RequestGuildMembers, Resume, VoiceStateUpdate,
};
use serde_json::{json, Value};
use twilight_model::gateway::presence::Status;
use twilight_model::gateway::Intents;
use twilight_model::id::Id;

fn to_value<T: serde::Serialize>(command: &Command<T>) -> Value {
    serde_json::to_value(command).unwrap()
}

/// Required envelope fields for every published dispatch.
const REQUIRED_ENVELOPE_FIELDS: &[&str] = &[
    "event_id",
    "event_type",
    "shard_id",
    "timestamp",
    "sequence",
    "guild_id",
    "data",
];

#[test]
fn identify_shape() {
    let presence = PresenceUpdate {
        status: Status::Idle,
        ..Default::default()
    };
    let identify = Identify::new("token", Intents::GUILDS | Intents::GUILD_MESSAGES, 250, Some(&presence), [3, 8]);
    let value = to_value(&Command::new(OpCode::Identify, identify));

    assert_eq!(value["op"], 2);
    assert_eq!(value["d"]["token"], "token");
    assert_eq!(value["d"]["intents"], 513);
    assert_eq!(value["d"]["large_threshold"], 250);
    assert_eq!(value["d"]["shard"], json!([3, 8]));
    assert_eq!(value["d"]["presence"]["status"], "idle");
    assert_eq!(value["d"]["presence"]["since"], Value::Null);

    let properties = value["d"]["properties"].as_object().unwrap();
    for key in ["os", "browser", "device"] {
        assert!(properties.contains_key(key), "identify properties missing '{key}'");
    }
}

#[test]
fn identify_without_presence_omits_field() {
    let identify = Identify::new("token", Intents::GUILDS, 50, None, [0, 1]);
    let value = to_value(&Command::new(OpCode::Identify, identify));

    assert!(value["d"].get("presence").is_none());
}

#[test]
fn resume_shape() {
    let resume = Resume {
        token: "token",
        session_id: "abc",
        seq: 42,
    };
    let value = to_value(&Command::new(OpCode::Resume, resume));

    assert_eq!(value, json!({"op": 6, "d": {"token": "token", "session_id": "abc", "seq": 42}}));
}

#[test]
fn heartbeat_shape() {
    assert_eq!(to_value(&heartbeat(None)), json!({"op": 1, "d": null}));
    assert_eq!(to_value(&heartbeat(Some(7))), json!({"op": 1, "d": 7}));
}

#[test]
fn request_guild_members_shape() {
    let request = RequestGuildMembers {
        guild_id: Id::new(81_384_788_765_712_384),
        query: Some(String::new()),
        limit: 0,
        presences: false,
        user_ids: None,
        nonce: "1".to_string(),
    };
    let value = to_value(&Command::new(OpCode::RequestGuildMembers, request));

    assert_eq!(
        value,
        json!({
            "op": 8,
            "d": {
                "guild_id": "81384788765712384",
                "query": "",
                "limit": 0,
                "presences": false,
                "nonce": "1"
            }
        })
    );
}

#[test]
fn request_guild_members_by_user_ids_omits_query() {
    let request = RequestGuildMembers {
        guild_id: Id::new(1),
        query: None,
        limit: 0,
        presences: true,
        user_ids: Some(vec![Id::new(2), Id::new(3)]),
        nonce: "n".to_string(),
    };
    let value = to_value(&Command::new(OpCode::RequestGuildMembers, request));

    assert!(value["d"].get("query").is_none());
    assert_eq!(value["d"]["user_ids"], json!(["2", "3"]));
}

#[test]
fn voice_state_update_shape() {
    let leave = VoiceStateUpdate {
        guild_id: Id::new(1),
        channel_id: None,
        self_mute: false,
        self_deaf: true,
    };
    let value = to_value(&Command::new(OpCode::VoiceStateUpdate, leave));

    assert_eq!(
        value,
        json!({"op": 4, "d": {"guild_id": "1", "channel_id": null, "self_mute": false, "self_deaf": true}})
    );
}

#[test]
fn presence_update_shape() {
    let value = to_value(&Command::new(OpCode::PresenceUpdate, PresenceUpdate::default()));

    assert_eq!(
        value,
        json!({"op": 3, "d": {"since": null, "activities": [], "status": "online", "afk": false}})
    );
}

#[test]
fn dispatch_envelope_has_required_fields() {
    let dispatch = Dispatch {
        shard_id: 2,
        kind: "MESSAGE_CREATE".to_string(),
        sequence: Some(9),
        data: json!({"guild_id": "123456789012345678", "content": "hi"}),
    };
    let value = serde_json::to_value(DispatchEnvelope::from_dispatch(&dispatch)).unwrap();
    let obj = value.as_object().unwrap();

    for field in REQUIRED_ENVELOPE_FIELDS {
        assert!(obj.contains_key(*field), "envelope missing required field '{field}'");
    }
    assert_eq!(value["guild_id"], "123456789012345678");
    uuid::Uuid::parse_str(value["event_id"].as_str().unwrap()).unwrap();
}
