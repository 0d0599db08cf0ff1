//! Arrakis Shard Gateway - sharded Discord gateway client
//!
//! This crate:
//! - Runs one session state machine per shard (identify, heartbeat, resume)
//! - Spawns shards in buckets under the gateway's max-concurrency limit
//! - Routes guild-scoped commands to the owning shard
//! - Relays dispatches to NATS JetStream and exposes health/metrics endpoints

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod protocol;
pub mod rest;
pub mod shard;
pub mod transport;

pub use config::{GatewayConfig, ShardOptions, ShardingOptions, TotalShards};
pub use error::GatewayError;
pub use events::{Dispatch, DispatchSink, EventBus, GatewayEvent};
pub use rest::{GatewayInfo, GatewayInfoSource, SessionStartLimit, TwilightRest};
pub use shard::{ConnectSummary, MemberRequest, Shard, ShardPool, ShardSelector, ShardStatus};
pub use transport::{Transport, TungsteniteTransport};
