//! Sharding plan and spawn buckets

use crate::config::{ShardingOptions, TotalShards};
use crate::error::GatewayError;
use std::ops::Range;

/// Resolved sharding parameters for one `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardingPlan {
    /// Shard count across every process
    pub total: u32,
    /// Shards spawned by this process
    pub shards: u32,
    /// First shard id spawned by this process
    pub offset: u32,
}

impl ShardingPlan {
    /// Resolve options against the gateway's recommended shard count.
    pub fn resolve(options: &ShardingOptions, recommended: u32) -> Result<Self, GatewayError> {
        let total = match options.total {
            TotalShards::Auto => recommended,
            TotalShards::Fixed(total) => total,
        };
        let plan = Self {
            total,
            shards: options.shards.unwrap_or(total),
            offset: options.offset.unwrap_or(0),
        };

        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let fits = self
            .offset
            .checked_add(self.shards)
            .is_some_and(|end| end <= self.total);

        if self.shards == 0 || self.offset >= self.total || !fits {
            return Err(GatewayError::InvalidShardConfig {
                total: self.total,
                shards: self.shards,
                offset: self.offset,
            });
        }
        Ok(())
    }

    /// Shard ids owned by this process
    pub fn local_range(&self) -> Range<u32> {
        self.offset..self.offset + self.shards
    }

    pub fn is_local(&self, shard_id: u32) -> bool {
        self.local_range().contains(&shard_id)
    }
}

/// Group local shard ids by rate-limit key (`id % max_concurrency`).
///
/// Keys are assigned over the whole `0..total` space so that a process
/// owning only part of it still lines up with the gateway's buckets. The
/// result is indexed by key; keys owning no local shard are empty.
pub fn spawn_buckets(plan: &ShardingPlan, max_concurrency: u32) -> Vec<Vec<u32>> {
    let max_concurrency = max_concurrency.max(1);
    let mut buckets = vec![Vec::new(); max_concurrency.min(plan.total) as usize];

    for shard_id in 0..plan.total {
        let key = (shard_id % max_concurrency) as usize;
        if plan.is_local(shard_id) {
            buckets[key].push(shard_id);
        }
    }

    buckets
}

/// Shard owning a guild: `(guild_id >> 22) % total`.
pub fn shard_for_guild(guild_id: u64, total: u32) -> u32 {
    ((guild_id >> 22) % u64::from(total.max(1))) as u32
}
