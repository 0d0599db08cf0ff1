//! Shard pool implementation
//!
//! The pool resolves the sharding plan from gateway metadata, creates one
//! [`Shard`] per local shard id, brings them up bucket by bucket under the
//! gateway's max-concurrency limit, and routes guild-scoped commands to the
//! owning shard.

use super::bucket::{shard_for_guild, spawn_buckets, ShardingPlan};
use super::members::{GuildMembers, MemberAccumulator, MemberRequest};
use super::session::Shard;
use super::state::ShardStatus;
use crate::config::ShardOptions;
use crate::error::GatewayError;
use crate::events::{Dispatch, EventBus, GatewayEvent};
use crate::metrics as telemetry;
use crate::protocol::{
    Command, OpCode, PresenceUpdate, RequestGuildMembers, VoiceStateUpdate, MAX_MEMBER_NONCE_LENGTH,
};
use crate::rest::{socket_url, GatewayInfo, GatewayInfoSource};
use crate::transport::Transport;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use twilight_model::gateway::Intents;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};
use twilight_model::id::Id;

/// Which shards a cross-shard command targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardSelector {
    All,
    One(u32),
    Many(Vec<u32>),
}

/// Outcome of every spawn in a `connect`
#[derive(Debug)]
pub struct ConnectSummary {
    pub results: Vec<(u32, Result<Arc<Dispatch>, GatewayError>)>,
    pub success: usize,
    pub failed: usize,
}

/// Shard pool managing every local shard
pub struct ShardPool {
    token: String,
    options: Arc<ShardOptions>,
    rest: Arc<dyn GatewayInfoSource>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    shards: RwLock<BTreeMap<u32, Shard>>,
    plan: RwLock<Option<ShardingPlan>>,
    gateway_info: RwLock<Option<GatewayInfo>>,
    nonce: AtomicU64,
}

impl ShardPool {
    /// Create a pool. No network activity happens until [`connect`](Self::connect).
    ///
    /// Fails when `options` do not validate.
    pub fn new(
        token: String,
        options: ShardOptions,
        rest: Arc<dyn GatewayInfoSource>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, GatewayError> {
        options.validate()?;

        Ok(Self {
            token,
            options: Arc::new(options),
            rest,
            transport,
            bus: EventBus::new(),
            shards: RwLock::new(BTreeMap::new()),
            plan: RwLock::new(None),
            gateway_info: RwLock::new(None),
            nonce: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn options(&self) -> &ShardOptions {
        &self.options
    }

    pub fn shard(&self, shard_id: u32) -> Option<Shard> {
        self.shards.read().get(&shard_id).cloned()
    }

    pub fn shards(&self) -> Vec<Shard> {
        self.shards.read().values().cloned().collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Shards with a live session
    pub fn live_shard_count(&self) -> usize {
        self.shards
            .read()
            .values()
            .filter(|shard| shard.status().is_live())
            .count()
    }

    /// True when there are shards and every one of them is live.
    pub fn shards_running(&self) -> bool {
        let shards = self.shards.read();
        !shards.is_empty() && shards.values().all(|shard| shard.status().is_live())
    }

    pub fn total_guilds(&self) -> usize {
        self.shards.read().values().map(Shard::guild_count).sum()
    }

    pub fn plan(&self) -> Option<ShardingPlan> {
        *self.plan.read()
    }

    /// Metadata used by the last `connect`
    pub fn gateway_info(&self) -> Option<GatewayInfo> {
        self.gateway_info.read().clone()
    }

    pub fn current_user(&self) -> Option<Value> {
        self.bus.current_user()
    }

    /// Resolve the sharding plan, create the local shards and spawn them
    /// bucket by bucket.
    ///
    /// Individual spawn failures do not fail the call; they are reported in
    /// the summary. Configuration and session budget problems fail it before
    /// any shard is created.
    pub async fn connect(&self, prefetched: Option<GatewayInfo>) -> Result<ConnectSummary, GatewayError> {
        if self.shards_running() {
            return Err(GatewayError::AlreadyConnected);
        }

        debug!("Starting connection process");

        let info = match prefetched {
            Some(info) => info,
            None => self.rest.gateway_info().await?,
        };
        info.validate(self.options.custom_socket_url.is_some())?;
        debug!(
            url = %info.url,
            recommended_shards = info.shards,
            remaining = info.session_start_limit.remaining,
            max_concurrency = info.session_start_limit.max_concurrency,
            "Got gateway information"
        );

        let plan = ShardingPlan::resolve(&self.options.sharding, info.shards)?;
        let limit = info.session_start_limit;
        if plan.shards > limit.remaining {
            let err = GatewayError::SessionStartLimit {
                requested: plan.shards,
                remaining: limit.remaining,
                reset_after_ms: limit.reset_after,
            };
            error!(error = %err, "Unable to connect shards");
            return Err(err);
        }

        let base = self.options.custom_socket_url.as_deref().unwrap_or(&info.url);
        let url = socket_url(base, self.options.version)?;

        // Connecting again from scratch replaces the previous shards
        self.kill_all(1000, "Reconnecting from scratch");

        let shards: BTreeMap<u32, Shard> = plan
            .local_range()
            .map(|shard_id| {
                let shard = Shard::new(
                    shard_id,
                    plan.total,
                    url.clone(),
                    self.token.clone(),
                    Arc::clone(&self.options),
                    Arc::clone(&self.transport),
                    self.bus.clone(),
                );
                (shard_id, shard)
            })
            .collect();

        info!(
            total = plan.total,
            shards = plan.shards,
            offset = plan.offset,
            "Created shards"
        );

        *self.shards.write() = shards.clone();
        *self.plan.write() = Some(plan);
        *self.gateway_info.write() = Some(info);

        let buckets: Vec<(usize, Vec<Shard>)> = spawn_buckets(&plan, limit.max_concurrency)
            .into_iter()
            .enumerate()
            .map(|(key, ids)| {
                // Ids without a local shard are skipped
                let members: Vec<Shard> = ids.iter().filter_map(|id| shards.get(id).cloned()).collect();
                (key, members)
            })
            .filter(|(_, members)| !members.is_empty())
            .collect();

        let mut results = Vec::with_capacity(shards.len());
        let bucket_count = buckets.len();

        for (position, (key, members)) in buckets.into_iter().enumerate() {
            debug!(key, shards = members.len(), "Starting spawn process for rate limit key");

            let settled = join_all(members.iter().map(|shard| async move {
                (shard.id(), shard.spawn().await)
            }))
            .await;

            for (shard_id, result) in settled {
                match &result {
                    Ok(ready) => {
                        telemetry::record_spawn(shard_id, true);
                        self.bus.emit(GatewayEvent::ShardSpawned {
                            shard_id,
                            payload: Arc::clone(ready),
                        });
                    }
                    Err(e) => {
                        telemetry::record_spawn(shard_id, false);
                        error!(shard_id, error = %e, "Shard failed to spawn");
                    }
                }
                results.push((shard_id, result));
            }

            debug!(key, "Finished spawn process for rate limit key");

            if position + 1 < bucket_count && !self.options.disable_bucket_ratelimits {
                tokio::time::sleep(self.options.bucket_cooldown).await;
            }
        }

        let success = results.iter().filter(|(_, r)| r.is_ok()).count();
        let failed = results.len() - success;

        self.bus.emit(GatewayEvent::ShardsReady { success, failed });
        if failed == 0 {
            info!(success, "Finished connection process");
        } else {
            warn!(success, failed, "Finished connection process with failed shards");
        }

        Ok(ConnectSummary {
            results,
            success,
            failed,
        })
    }

    /// Shard id owning a guild under the current plan.
    pub fn shard_id_for_guild(&self, guild_id: Id<GuildMarker>) -> Result<u32, GatewayError> {
        let plan = self.plan().ok_or(GatewayError::NotConnected)?;
        Ok(shard_for_guild(guild_id.get(), plan.total))
    }

    /// Local shard owning a guild, if this process runs it.
    pub fn guild_shard(&self, guild_id: Id<GuildMarker>) -> Result<Option<Shard>, GatewayError> {
        let shard_id = self.shard_id_for_guild(guild_id)?;
        Ok(self.shard(shard_id))
    }

    /// Like [`guild_shard`](Self::guild_shard), but a missing local shard is an error.
    pub fn ensure_guild_shard(&self, guild_id: Id<GuildMarker>) -> Result<Shard, GatewayError> {
        let shard_id = self.shard_id_for_guild(guild_id)?;
        self.shard(shard_id).ok_or(GatewayError::NoShardForGuild {
            guild_id: guild_id.get(),
            shard_id,
        })
    }

    /// Request guild members and wait for every response chunk.
    pub async fn request_guild_members(
        &self,
        guild_id: Id<GuildMarker>,
        request: MemberRequest,
    ) -> Result<GuildMembers, GatewayError> {
        if request.query.is_some() && request.user_ids.is_some() {
            return Err(GatewayError::InvalidMemberRequest);
        }

        if let Some(nonce) = request.nonce.as_ref().filter(|n| n.len() > MAX_MEMBER_NONCE_LENGTH) {
            return Err(GatewayError::NonceTooLong {
                len: nonce.len(),
                max: MAX_MEMBER_NONCE_LENGTH,
            });
        }

        let shard = self.ensure_guild_shard(guild_id)?;

        // Registered before sending so no chunk can slip past
        let (nonce, mut listener) = match request.nonce {
            Some(nonce) => {
                let listener = self.bus.listen_member_chunks(&nonce)?;
                (nonce, listener)
            }
            None => loop {
                let nonce = self.next_nonce();
                match self.bus.listen_member_chunks(&nonce) {
                    Ok(listener) => break (nonce, listener),
                    Err(GatewayError::NonceInUse { .. }) => continue,
                    Err(e) => return Err(e),
                }
            },
        };

        let query = match (&request.query, &request.user_ids) {
            (None, None) => Some(String::new()),
            (query, _) => query.clone(),
        };
        let command = Command::new(
            OpCode::RequestGuildMembers,
            RequestGuildMembers {
                guild_id,
                query,
                limit: request.limit,
                presences: self.options.intents.contains(Intents::GUILD_PRESENCES),
                user_ids: request.user_ids,
                nonce: nonce.clone(),
            },
        );
        shard.send(&command).await?;
        debug!(shard_id = shard.id(), guild_id = %guild_id, nonce, "Requested guild members");

        let mut accumulator = MemberAccumulator::new(guild_id, nonce.clone());
        while let Some(chunk) = listener.recv().await {
            if accumulator.push(chunk) {
                return Ok(accumulator.finish());
            }
        }

        Err(GatewayError::MemberListenerClosed { nonce })
    }

    /// Join, move or leave a voice channel in a guild.
    pub async fn update_voice_state(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Option<Id<ChannelMarker>>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), GatewayError> {
        let shard = self.ensure_guild_shard(guild_id)?;
        let command = Command::new(
            OpCode::VoiceStateUpdate,
            VoiceStateUpdate {
                guild_id,
                channel_id,
                self_mute,
                self_deaf,
            },
        );
        shard.send(&command).await
    }

    /// Send a presence update to every live shard the selector matches.
    ///
    /// Waits for every send to settle; returns how many shards accepted it,
    /// or the first failure.
    pub async fn update_presence(
        &self,
        presence: &PresenceUpdate,
        selector: ShardSelector,
    ) -> Result<usize, GatewayError> {
        let targets: Vec<Shard> = {
            let shards = self.shards.read();
            match &selector {
                ShardSelector::All => shards.values().cloned().collect(),
                ShardSelector::One(id) => shards.get(id).cloned().into_iter().collect(),
                ShardSelector::Many(ids) => ids.iter().filter_map(|id| shards.get(id).cloned()).collect(),
            }
        };
        let targets: Vec<Shard> = targets
            .into_iter()
            .filter(|shard| shard.status().is_live())
            .collect();

        let command = Command::new(OpCode::PresenceUpdate, presence);
        let results = join_all(targets.iter().map(|shard| shard.send(&command))).await;

        let sent = results.iter().filter(|r| r.is_ok()).count();
        debug!(sent, targets = results.len(), ?selector, "Updated presence");

        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    /// Kill every local shard.
    pub fn kill_all(&self, code: u16, reason: &str) {
        for shard in self.shards.read().values() {
            if shard.status() != ShardStatus::Idle || shard.is_connecting() {
                shard.kill(code, reason);
            }
        }
    }

    /// Next counter nonce not held by a pending member request
    fn next_nonce(&self) -> String {
        loop {
            let nonce = (self.nonce.fetch_add(1, Ordering::Relaxed) + 1).to_string();
            if !self.bus.has_member_listener(&nonce) {
                return nonce;
            }
        }
    }
}
