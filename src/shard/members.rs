//! Guild member chunk accumulation

use crate::protocol::MemberChunk;
use serde_json::Value;
use twilight_model::id::marker::{GuildMarker, UserMarker};
use twilight_model::id::Id;

/// Options for a guild member request
#[derive(Debug, Clone, Default)]
pub struct MemberRequest {
    /// Username prefix; empty matches everyone
    pub query: Option<String>,
    /// Maximum members to return; 0 means no limit
    pub limit: u64,
    pub user_ids: Option<Vec<Id<UserMarker>>>,
    /// Custom correlation nonce, at most 32 bytes
    pub nonce: Option<String>,
}

/// Everything returned across the chunks of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GuildMembers {
    pub guild_id: Id<GuildMarker>,
    pub nonce: String,
    pub members: Vec<Value>,
    pub presences: Vec<Value>,
    pub not_found: Vec<Id<UserMarker>>,
}

pub(crate) struct MemberAccumulator {
    members: GuildMembers,
}

impl MemberAccumulator {
    pub(crate) fn new(guild_id: Id<GuildMarker>, nonce: String) -> Self {
        Self {
            members: GuildMembers {
                guild_id,
                nonce,
                members: Vec::new(),
                presences: Vec::new(),
                not_found: Vec::new(),
            },
        }
    }

    /// Fold a chunk in. Returns true once the final chunk has arrived.
    ///
    /// Chunks for another guild are ignored.
    pub(crate) fn push(&mut self, chunk: MemberChunk) -> bool {
        if chunk.guild_id != self.members.guild_id {
            return false;
        }

        self.members.members.extend(chunk.members);
        if let Some(presences) = chunk.presences {
            self.members.presences.extend(presences);
        }
        if let Some(not_found) = chunk.not_found {
            self.members.not_found.extend(not_found);
        }

        chunk.chunk_index + 1 >= chunk.chunk_count
    }

    pub(crate) fn finish(self) -> GuildMembers {
        self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(guild: u64, index: u32, count: u32, members: Vec<Value>) -> MemberChunk {
        MemberChunk {
            guild_id: Id::new(guild),
            nonce: Some("1".to_string()),
            chunk_index: index,
            chunk_count: count,
            members,
            presences: None,
            not_found: None,
        }
    }

    #[test]
    fn completes_on_last_chunk_with_everything_accumulated() {
        let mut acc = MemberAccumulator::new(Id::new(10), "1".to_string());

        assert!(!acc.push(chunk(10, 0, 2, vec![json!({"user": {"id": "1"}})])));

        let mut last = chunk(10, 1, 2, vec![json!({"user": {"id": "2"}})]);
        last.not_found = Some(vec![Id::new(3)]);
        last.presences = Some(vec![json!({"status": "online"})]);
        assert!(acc.push(last));

        let members = acc.finish();
        assert_eq!(members.members.len(), 2);
        assert_eq!(members.presences.len(), 1);
        assert_eq!(members.not_found, vec![Id::new(3)]);
    }

    #[test]
    fn other_guild_chunks_are_ignored() {
        let mut acc = MemberAccumulator::new(Id::new(10), "1".to_string());
        assert!(!acc.push(chunk(11, 0, 1, vec![json!({})])));
        assert!(acc.finish().members.is_empty());
    }

    #[test]
    fn single_chunk_completes_immediately() {
        let mut acc = MemberAccumulator::new(Id::new(10), "1".to_string());
        assert!(acc.push(chunk(10, 0, 1, Vec::new())));
    }
}
