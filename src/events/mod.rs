//! Event handling module
//!
//! Every dispatch a shard receives flows through the [`EventBus`]: first the
//! raw feed and the registered [`DispatchSink`], then the bus's own
//! bookkeeping (current user, member chunk listeners), then the typed
//! [`GatewayEvent`] feed callers subscribe to.

pub mod serialize;

pub use serialize::DispatchEnvelope;

use crate::error::GatewayError;
use crate::protocol::MemberChunk;
use crate::shard::ShardStatus;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 1024;

/// A dispatch payload received by a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub shard_id: u32,
    /// Dispatch name, e.g. `GUILD_CREATE`
    pub kind: String,
    pub sequence: Option<u64>,
    pub data: Value,
}

/// Events observable by callers of the pool.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A shard entered a new lifecycle state
    ShardStateChanged { shard_id: u32, status: ShardStatus },
    /// A shard spawned; carries its READY dispatch
    ShardSpawned { shard_id: u32, payload: Arc<Dispatch> },
    /// A payload was written to a shard's socket
    PayloadSent { shard_id: u32, payload: String },
    /// Any dispatch, after the sink has seen it
    Dispatch(Arc<Dispatch>),
    /// Every spawn in a `connect` settled
    ShardsReady { success: usize, failed: usize },
}

/// Synchronous consumer of every raw dispatch, in receipt order.
///
/// Called on the shard's reader task; implementations must not block.
pub trait DispatchSink: Send + Sync {
    fn handle(&self, dispatch: &Dispatch);
}

/// Shared event fan-out for a pool and its shards
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    events: broadcast::Sender<GatewayEvent>,
    raw: broadcast::Sender<Arc<Dispatch>>,
    sink: RwLock<Option<Arc<dyn DispatchSink>>>,
    chunk_listeners: DashMap<String, ChunkRegistration>,
    registrations: AtomicU64,
    current_user: RwLock<Option<Value>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (raw, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(BusInner {
                events,
                raw,
                sink: RwLock::new(None),
                chunk_listeners: DashMap::new(),
                registrations: AtomicU64::new(0),
                current_user: RwLock::new(None),
            }),
        }
    }

    /// Subscribe to typed events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to the raw dispatch feed
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Arc<Dispatch>> {
        self.inner.raw.subscribe()
    }

    /// Install the dispatch sink, replacing any previous one.
    pub fn set_sink(&self, sink: Arc<dyn DispatchSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    /// The bot user from the latest READY, updated by USER_UPDATE.
    pub fn current_user(&self) -> Option<Value> {
        self.inner.current_user.read().clone()
    }

    pub(crate) fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Deliver a dispatch: raw feed, sink, bookkeeping, then typed feed.
    pub(crate) fn dispatch(&self, dispatch: Arc<Dispatch>) {
        let _ = self.inner.raw.send(Arc::clone(&dispatch));

        let sink = self.inner.sink.read().clone();
        if let Some(sink) = sink {
            sink.handle(&dispatch);
        }

        match dispatch.kind.as_str() {
            "READY" => {
                if let Some(user) = dispatch.data.get("user") {
                    *self.inner.current_user.write() = Some(user.clone());
                }
            }
            "USER_UPDATE" => self.update_current_user(&dispatch.data),
            "GUILD_MEMBERS_CHUNK" => self.route_member_chunk(&dispatch),
            _ => {}
        }

        self.emit(GatewayEvent::Dispatch(dispatch));
    }

    fn update_current_user(&self, user: &Value) {
        let mut current = self.inner.current_user.write();
        let same_user = current
            .as_ref()
            .is_some_and(|existing| existing.get("id").is_some() && existing.get("id") == user.get("id"));

        if same_user {
            *current = Some(user.clone());
        }
    }

    fn route_member_chunk(&self, dispatch: &Dispatch) {
        let Some(nonce) = dispatch.data.get("nonce").and_then(Value::as_str) else {
            return;
        };
        let Some(listener) = self.inner.chunk_listeners.get(nonce) else {
            return;
        };

        match serde_json::from_value::<MemberChunk>(dispatch.data.clone()) {
            Ok(chunk) => {
                let _ = listener.tx.send(chunk);
            }
            Err(e) => warn!(
                shard_id = dispatch.shard_id,
                nonce,
                error = %e,
                "Ignoring malformed GUILD_MEMBERS_CHUNK"
            ),
        }
    }

    /// Register a transient listener for member chunks carrying `nonce`.
    ///
    /// Fails with [`GatewayError::NonceInUse`] while another listener holds
    /// the nonce. The listener is removed when the returned guard drops.
    pub(crate) fn listen_member_chunks(&self, nonce: &str) -> Result<ChunkListener, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.registrations.fetch_add(1, Ordering::Relaxed);

        match self.inner.chunk_listeners.entry(nonce.to_string()) {
            Entry::Occupied(_) => {
                return Err(GatewayError::NonceInUse {
                    nonce: nonce.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(ChunkRegistration { id, tx });
            }
        }
        debug!(nonce, "Registered member chunk listener");

        Ok(ChunkListener {
            bus: self.clone(),
            nonce: nonce.to_string(),
            id,
            rx,
        })
    }

    pub(crate) fn has_member_listener(&self, nonce: &str) -> bool {
        self.inner.chunk_listeners.contains_key(nonce)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

struct ChunkRegistration {
    id: u64,
    tx: mpsc::UnboundedSender<MemberChunk>,
}

/// Receives member chunks for one nonce
pub(crate) struct ChunkListener {
    bus: EventBus,
    nonce: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<MemberChunk>,
}

impl ChunkListener {
    pub(crate) async fn recv(&mut self) -> Option<MemberChunk> {
        self.rx.recv().await
    }
}

impl Drop for ChunkListener {
    fn drop(&mut self) {
        self.bus
            .inner
            .chunk_listeners
            .remove_if(&self.nonce, |_, registration| registration.id == self.id);
    }
}
