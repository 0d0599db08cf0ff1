//! In-memory gateway used by the integration tests
//!
//! [`MockGateway`] implements [`Transport`]: every connect spins up a small
//! server task that sends Hello and answers identify, resume, heartbeat and
//! member requests the way the real gateway does. Everything the shards
//! write is recorded with the (paused) clock time it was written at.

#![allow(dead_code)]

use arrakis_shard_gateway::error::GatewayError;
use arrakis_shard_gateway::rest::{GatewayInfo, GatewayInfoSource, SessionStartLimit};
use arrakis_shard_gateway::transport::{CloseFrame, Connection, Frame, SocketReader, SocketWriter, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How the mock server answers
#[derive(Debug, Clone)]
pub struct Behavior {
    pub heartbeat_interval: u64,
    pub ack_heartbeats: bool,
    /// Answer identify with READY and resume with RESUMED
    pub answer_handshake: bool,
    /// Guilds announced as unavailable in READY
    pub guilds: Vec<u64>,
    /// Follow READY with a GUILD_CREATE per guild
    pub send_guild_creates: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            heartbeat_interval: 41_250,
            ack_heartbeats: true,
            answer_handshake: true,
            guilds: Vec::new(),
            send_guild_creates: true,
        }
    }
}

/// A payload written by a shard
#[derive(Debug, Clone)]
pub struct Sent {
    pub conn: usize,
    pub at: Instant,
    pub op: u64,
    pub payload: Value,
}

#[derive(Default)]
struct Inner {
    behavior: Behavior,
    fail_next: usize,
    fail_all: bool,
    attempts: usize,
    connects: Vec<Instant>,
    sent: Vec<Sent>,
    closes: Vec<(usize, Option<u16>)>,
    to_client: Vec<mpsc::UnboundedSender<Frame>>,
}

#[derive(Clone, Default)]
pub struct MockGateway {
    inner: Arc<Mutex<Inner>>,
}

impl MockGateway {
    pub fn new(behavior: Behavior) -> Self {
        let gateway = Self::default();
        gateway.inner.lock().behavior = behavior;
        gateway
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn fail_next(&self, count: usize) {
        self.inner.lock().fail_next = count;
    }

    pub fn fail_all(&self, fail: bool) {
        self.inner.lock().fail_all = fail;
    }

    /// Connect calls, successful or not
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    /// Successful connects
    pub fn connects(&self) -> usize {
        self.inner.lock().connects.len()
    }

    pub fn connected_at(&self, conn: usize) -> Instant {
        self.inner.lock().connects[conn]
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.inner.lock().sent.clone()
    }

    pub fn sent_on(&self, conn: usize) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.conn == conn).collect()
    }

    /// Ops written on a connection, heartbeats excluded
    pub fn ops_on(&self, conn: usize) -> Vec<u64> {
        self.sent_on(conn)
            .into_iter()
            .map(|s| s.op)
            .filter(|op| *op != 1)
            .collect()
    }

    pub fn closes(&self) -> Vec<(usize, Option<u16>)> {
        self.inner.lock().closes.clone()
    }

    /// Push a raw payload to the shard on a connection.
    pub fn push(&self, conn: usize, payload: Value) {
        let inner = self.inner.lock();
        let _ = inner.to_client[conn].send(Frame::Text(payload.to_string()));
    }

    /// Close a connection from the server side.
    pub fn close(&self, conn: usize, code: u16) {
        let inner = self.inner.lock();
        let _ = inner.to_client[conn].send(Frame::Close(Some(CloseFrame {
            code,
            reason: "mock close".to_string(),
        })));
    }
}

#[async_trait]
impl Transport for MockGateway {
    async fn connect(&self, _url: &str) -> Result<Connection, GatewayError> {
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();

        let (conn, behavior) = {
            let mut inner = self.inner.lock();
            inner.attempts += 1;
            if inner.fail_all || inner.fail_next > 0 {
                inner.fail_next = inner.fail_next.saturating_sub(1);
                return Err(GatewayError::Transport(Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "mock gateway refused the connection",
                ))));
            }

            let conn = inner.connects.len();
            inner.connects.push(Instant::now());
            inner.to_client.push(to_client.clone());
            (conn, inner.behavior.clone())
        };

        tokio::spawn(serve(behavior, from_client, to_client));

        Ok(Connection {
            writer: Box::new(MockWriter {
                conn,
                gateway: self.clone(),
                to_server,
            }),
            reader: Box::new(MockReader { from_server }),
        })
    }
}

struct MockWriter {
    conn: usize,
    gateway: MockGateway,
    to_server: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl SocketWriter for MockWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        match &frame {
            Frame::Text(text) => {
                let payload: Value = serde_json::from_str(text).unwrap_or(Value::Null);
                self.gateway.inner.lock().sent.push(Sent {
                    conn: self.conn,
                    at: Instant::now(),
                    op: payload["op"].as_u64().unwrap_or(u64::MAX),
                    payload,
                });
            }
            Frame::Close(close) => {
                let code = close.as_ref().map(|c| c.code);
                self.gateway.inner.lock().closes.push((self.conn, code));
            }
        }

        let _ = self.to_server.send(frame);
        Ok(())
    }
}

struct MockReader {
    from_server: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl SocketReader for MockReader {
    async fn next_frame(&mut self) -> Option<Result<Frame, GatewayError>> {
        self.from_server.recv().await.map(Ok)
    }
}

fn dispatch(kind: &str, seq: u64, data: Value) -> Value {
    json!({"op": 0, "t": kind, "s": seq, "d": data})
}

async fn serve(behavior: Behavior, mut from_client: mpsc::UnboundedReceiver<Frame>, to_client: mpsc::UnboundedSender<Frame>) {
    let push = |payload: Value| {
        let _ = to_client.send(Frame::Text(payload.to_string()));
    };
    let mut seq = 0u64;

    push(json!({"op": 10, "d": {"heartbeat_interval": behavior.heartbeat_interval}}));

    while let Some(frame) = from_client.recv().await {
        let Frame::Text(text) = frame else {
            return;
        };
        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        match payload["op"].as_u64() {
            Some(1) if behavior.ack_heartbeats => push(json!({"op": 11})),
            Some(2) if behavior.answer_handshake => {
                let shard_id = payload["d"]["shard"][0].as_u64().unwrap_or(0);
                let guilds: Vec<Value> = behavior
                    .guilds
                    .iter()
                    .map(|id| json!({"id": id.to_string(), "unavailable": true}))
                    .collect();

                seq += 1;
                push(dispatch(
                    "READY",
                    seq,
                    json!({
                        "session_id": format!("session-{shard_id}"),
                        "user": {"id": "100", "username": "arrakis"},
                        "guilds": guilds,
                    }),
                ));

                if behavior.send_guild_creates {
                    for id in &behavior.guilds {
                        seq += 1;
                        push(dispatch("GUILD_CREATE", seq, json!({"id": id.to_string(), "name": "guild"})));
                    }
                }
            }
            Some(6) if behavior.answer_handshake => {
                seq = payload["d"]["seq"].as_u64().unwrap_or(0) + 1;
                push(dispatch("RESUMED", seq, Value::Null));
            }
            Some(8) => {
                let request = &payload["d"];
                for index in 0..2u64 {
                    seq += 1;
                    push(dispatch(
                        "GUILD_MEMBERS_CHUNK",
                        seq,
                        json!({
                            "guild_id": request["guild_id"],
                            "nonce": request["nonce"],
                            "chunk_index": index,
                            "chunk_count": 2,
                            "members": [{"user": {"id": (index + 1).to_string()}}],
                        }),
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Fixed gateway metadata
pub struct StubRest {
    pub info: GatewayInfo,
}

impl StubRest {
    pub fn new(shards: u32, max_concurrency: u32, remaining: u32) -> Arc<Self> {
        Arc::new(Self {
            info: GatewayInfo {
                url: "wss://gateway.test".to_string(),
                shards,
                session_start_limit: SessionStartLimit {
                    total: 1000,
                    remaining,
                    reset_after: 60_000,
                    max_concurrency,
                },
            },
        })
    }
}

#[async_trait]
impl GatewayInfoSource for StubRest {
    async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError> {
        Ok(self.info.clone())
    }
}

/// Poll `condition` on the paused clock until it holds or `limit` elapses.
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
