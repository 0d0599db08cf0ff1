//! Shard management module
//!
//! A [`ShardPool`] owns every local [`Shard`]; each shard runs one gateway
//! session through its lifecycle (identify, heartbeat, guild sync, resume).

mod bucket;
mod guild_sync;
mod heartbeat;
mod members;
mod pool;
mod queue;
mod session;
mod state;
mod timer;

pub use bucket::{shard_for_guild, spawn_buckets, ShardingPlan};
pub use members::{GuildMembers, MemberRequest};
pub use pool::{ConnectSummary, ShardPool, ShardSelector};
pub use session::{is_recoverable_close, Shard};
pub use state::ShardStatus;
