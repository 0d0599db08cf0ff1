//! Shard session state machine
//!
//! A [`Shard`] owns one gateway session. Each open socket gets a reader task
//! (frames handled one at a time, in arrival order) and a writer task fed by
//! an ordered channel. All mutable session state sits behind one mutex that
//! is never held across an await; tasks stamped with an older socket epoch
//! find their epoch stale and do nothing.

use super::guild_sync::GuildSync;
use super::heartbeat::{Heartbeat, Tick};
use super::queue::{SendAck, SendQueue};
use super::state::ShardStatus;
use super::timer::Timer;
use crate::config::ShardOptions;
use crate::error::GatewayError;
use crate::events::{Dispatch, EventBus, GatewayEvent};
use crate::metrics as telemetry;
use crate::protocol::{self, Command, GuildRef, Hello, Identify, InboundPayload, OpCode, Ready, Resume};
use crate::transport::{CloseFrame, Connection, Frame, SocketReader, SocketWriter, Transport, ABNORMAL_CLOSURE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use twilight_model::gateway::{CloseCode, Intents};
use twilight_model::id::marker::GuildMarker;
use twilight_model::id::Id;

const NORMAL_CLOSE: u16 = 1000;
const RESUMABLE_CLOSE: u16 = 4000;
const ZOMBIE_CLOSE: u16 = 4009;

/// Operation name and the states it may start from
type Operation = (&'static str, fn(ShardStatus) -> bool);

const SPAWN: Operation = ("spawn", ShardStatus::is_detached);
const RESTART: Operation = ("restart", |s: ShardStatus| s.is_detached() || s.is_live());

/// Whether a gateway close code allows reconnecting. Unknown codes do.
pub fn is_recoverable_close(code: u16) -> bool {
    CloseCode::try_from(code).map_or(true, CloseCode::can_reconnect)
}

/// Handle to one gateway session. Cheap to clone.
#[derive(Clone)]
pub struct Shard {
    inner: Arc<ShardInner>,
}

struct ShardInner {
    id: u32,
    total: u32,
    url: String,
    token: String,
    options: Arc<ShardOptions>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    flights: AtomicU64,
    state: Mutex<SessionState>,
}

struct SessionState {
    status: ShardStatus,
    sequence: Option<u64>,
    session_id: Option<String>,
    guilds: HashSet<Id<GuildMarker>>,
    queue: SendQueue,
    heartbeat: Heartbeat,
    guild_sync: GuildSync,
    /// Delayed reconnect after an invalid session
    reconnect_timer: Timer,
    socket: Option<Socket>,
    epoch: u64,
    flight: Option<Flight>,
    init: Option<InitWaiter>,
    ready: Option<Arc<Dispatch>>,
    last_close: Option<CloseFrame>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: ShardStatus::Idle,
            sequence: None,
            session_id: None,
            guilds: HashSet::new(),
            queue: SendQueue::default(),
            heartbeat: Heartbeat::default(),
            guild_sync: GuildSync::default(),
            reconnect_timer: Timer::default(),
            socket: None,
            epoch: 0,
            flight: None,
            init: None,
            ready: None,
            last_close: None,
        }
    }

    fn can_resume(&self) -> bool {
        self.sequence.is_some() && self.session_id.is_some()
    }
}

struct Socket {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
}

enum Outgoing {
    Payload {
        text: String,
        op: u8,
        ack: Option<SendAck>,
    },
    Close(CloseFrame),
}

/// In-flight spawn or restart
struct Flight {
    id: u64,
    token: CancellationToken,
}

/// Resolves when a connection attempt goes live (with READY, if one was
/// received) or its socket closes first.
type InitWaiter = oneshot::Sender<Result<Option<Arc<Dispatch>>, GatewayError>>;

/// Releases the single-flight slot when the spawn/restart future ends.
struct FlightGuard {
    shard: Shard,
    id: u64,
    token: CancellationToken,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut state = self.shard.inner.state.lock();
        if state.flight.as_ref().is_some_and(|f| f.id == self.id) {
            state.flight = None;
        }
    }
}

impl Shard {
    pub fn new(
        id: u32,
        total: u32,
        url: String,
        token: String,
        options: Arc<ShardOptions>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> Self {
        debug!(shard_id = id, total, "Initialized shard");

        Self {
            inner: Arc::new(ShardInner {
                id,
                total,
                url,
                token,
                options,
                transport,
                bus,
                flights: AtomicU64::new(0),
                state: Mutex::new(SessionState::new()),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn total(&self) -> u32 {
        self.inner.total
    }

    pub fn status(&self) -> ShardStatus {
        self.inner.state.lock().status
    }

    /// True when both a session id and a sequence are stored.
    pub fn can_resume(&self) -> bool {
        self.inner.state.lock().can_resume()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.inner.state.lock().sequence
    }

    /// Latest heartbeat round trip; zero until the first ACK.
    pub fn ping(&self) -> Duration {
        self.inner.state.lock().heartbeat.ping()
    }

    pub fn guilds(&self) -> HashSet<Id<GuildMarker>> {
        self.inner.state.lock().guilds.clone()
    }

    pub fn guild_count(&self) -> usize {
        self.inner.state.lock().guilds.len()
    }

    /// Sends waiting for the session to go live
    pub fn queued_sends(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True while a spawn or restart is in flight.
    pub fn is_connecting(&self) -> bool {
        self.inner.state.lock().flight.is_some()
    }

    /// Open a fresh session, retrying up to the configured attempt ceiling.
    ///
    /// Resolves with the READY dispatch once the session is live; it does not
    /// wait for the guild backlog.
    pub async fn spawn(&self) -> Result<Arc<Dispatch>, GatewayError> {
        let flight = self.begin_flight(SPAWN)?;
        self.spawn_with(flight).await
    }

    async fn spawn_with(&self, flight: FlightGuard) -> Result<Arc<Dispatch>, GatewayError> {
        let shard_id = self.inner.id;
        let max_attempts = self.inner.options.spawn_max_attempts;

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                _ = flight.token.cancelled() => return Err(self.interrupted("Spawning")),
                result = self.attempt(false, flight.id) => result,
            };

            match result {
                Ok(Some(ready)) => {
                    if attempt == 1 {
                        debug!(shard_id, "Spawned after 1 attempt");
                    } else {
                        warn!(shard_id, attempt, "Spawned after {attempt} attempts");
                    }
                    return Ok(ready);
                }
                Ok(None) => {
                    error!(shard_id, attempt, max_attempts, "Spawn attempt went live without a READY dispatch");
                }
                Err(e) => {
                    telemetry::record_error(shard_id, e.error_type_label());
                    error!(shard_id, attempt, max_attempts, error = %e, "Spawn attempt failed");
                }
            }

            if attempt < max_attempts {
                self.pause(&flight.token, "Spawning").await?;
            }
        }

        self.enter_if_current(flight.id, ShardStatus::Idle);
        Err(GatewayError::MaxSpawnAttempts {
            shard_id,
            attempts: max_attempts,
        })
    }

    /// Resume the session (or identify when it cannot be resumed), retrying
    /// until it succeeds or the shard is killed.
    pub async fn restart(&self) -> Result<(), GatewayError> {
        let flight = self.begin_flight(RESTART)?;
        self.restart_with(flight).await
    }

    async fn restart_with(&self, flight: FlightGuard) -> Result<(), GatewayError> {
        let shard_id = self.inner.id;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = flight.token.cancelled() => return Err(self.interrupted("Restarting")),
                result = self.attempt(true, flight.id) => result,
            };

            match result {
                Ok(_) => {
                    if attempt == 1 {
                        debug!(shard_id, "Restarted after 1 attempt");
                    } else {
                        warn!(shard_id, attempt, "Restarted after {attempt} attempts");
                    }
                    return Ok(());
                }
                Err(e) => {
                    telemetry::record_error(shard_id, e.error_type_label());
                    error!(shard_id, attempt, error = %e, "Restart attempt failed");
                }
            }

            self.pause(&flight.token, "Restarting").await?;
        }
    }

    /// Close the socket, reject queued sends, stop every timer and return to
    /// IDLE. An in-flight spawn or restart fails with an interrupted error.
    pub fn kill(&self, code: u16, reason: &str) {
        let mut state = self.inner.state.lock();
        self.close_locked(&mut state, false, code, reason);
        self.enter_locked(&mut state, ShardStatus::Idle);
        cancel_flight(&mut state);

        warn!(shard_id = self.inner.id, code, reason, "Shard killed");
    }

    /// Send a command. Transmitted immediately while the session is live,
    /// queued until it is otherwise.
    pub async fn send<T: Serialize>(&self, command: &Command<T>) -> Result<(), GatewayError> {
        let shard_id = self.inner.id;
        let text = serde_json::to_string(command)
            .map_err(|source| GatewayError::SerializationFailed { shard_id, source })?;

        let done = {
            let mut state = self.inner.state.lock();
            if state.status.is_live() {
                let (ack, done) = oneshot::channel();
                push_outgoing(state.socket.as_ref(), shard_id, text, command.op, Some(ack))?;
                done
            } else {
                debug!(shard_id, op = command.op, status = %state.status, "Queueing send until the session is live");
                state.queue.push(text, command.op)
            }
        };

        done.await
            .unwrap_or(Err(GatewayError::SendWithoutOpenSocket { shard_id }))
    }

    fn begin_flight(&self, operation: Operation) -> Result<FlightGuard, GatewayError> {
        let mut state = self.inner.state.lock();
        self.claim_flight_locked(&mut state, operation)
    }

    /// Take the single-flight slot while the state lock is held.
    fn claim_flight_locked(&self, state: &mut SessionState, operation: Operation) -> Result<FlightGuard, GatewayError> {
        let (operation, allowed) = operation;
        let shard_id = self.inner.id;

        if state.flight.is_some() {
            return Err(GatewayError::AlreadyConnecting { shard_id });
        }
        if !allowed(state.status) {
            return Err(GatewayError::InvalidShardState {
                shard_id,
                operation,
                state: state.status.as_str(),
            });
        }

        let id = self.inner.flights.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        state.flight = Some(Flight {
            id,
            token: token.clone(),
        });

        Ok(FlightGuard {
            shard: self.clone(),
            id,
            token,
        })
    }

    fn interrupted(&self, operation: &str) -> GatewayError {
        debug!(shard_id = self.inner.id, "{operation} interrupted by kill");
        GatewayError::InterruptedByKill {
            shard_id: self.inner.id,
        }
    }

    async fn pause(&self, token: &CancellationToken, operation: &str) -> Result<(), GatewayError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(self.interrupted(operation)),
            _ = sleep(self.inner.options.spawn_attempt_delay) => Ok(()),
        }
    }

    fn enter_if_current(&self, flight_id: u64, status: ShardStatus) {
        let mut state = self.inner.state.lock();
        if state.flight.as_ref().is_some_and(|f| f.id == flight_id) {
            self.enter_locked(&mut state, status);
        }
    }

    /// One bounded connection attempt. On failure the half-open socket is
    /// torn down so the next attempt starts detached.
    async fn attempt(&self, resume: bool, flight_id: u64) -> Result<Option<Arc<Dispatch>>, GatewayError> {
        let limit = self.inner.options.spawn_timeout;

        let result = match timeout(limit, self.init_socket(resume, flight_id)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::ConnectTimeout {
                shard_id: self.inner.id,
                timeout_ms: limit.as_millis() as u64,
            }),
        };

        if result.is_err() {
            let mut state = self.inner.state.lock();
            let current = state.flight.as_ref().is_some_and(|f| f.id == flight_id);
            if current && !state.status.is_detached() {
                let code = if resume { RESUMABLE_CLOSE } else { NORMAL_CLOSE };
                self.close_locked(&mut state, resume, code, "Failed to initialize shard");
                self.enter_locked(&mut state, ShardStatus::Disconnected);
            }
        }

        result
    }

    async fn init_socket(&self, resume: bool, flight_id: u64) -> Result<Option<Arc<Dispatch>>, GatewayError> {
        {
            let mut state = self.inner.state.lock();
            if !state.status.is_detached() {
                let code = if resume { RESUMABLE_CLOSE } else { NORMAL_CLOSE };
                self.close_locked(&mut state, resume, code, "Restarting");
                self.enter_locked(&mut state, ShardStatus::Disconnected);
            }

            let next = if resume && state.can_resume() {
                ShardStatus::Resuming
            } else {
                ShardStatus::Connecting
            };
            self.enter_locked(&mut state, next);
        }

        debug!(shard_id = self.inner.id, resume, "Initiating socket");

        let connection = self.inner.transport.connect(&self.inner.url).await?;
        let live = self.attach(connection, resume, flight_id)?;

        live.await.unwrap_or_else(|_| {
            Err(GatewayError::ClosedDuringInit {
                shard_id: self.inner.id,
                code: ABNORMAL_CLOSURE,
                reason: "connection attempt abandoned".to_string(),
            })
        })
    }

    /// Bind a freshly opened socket to the session and start its tasks.
    fn attach(
        &self,
        connection: Connection,
        resume: bool,
        flight_id: u64,
    ) -> Result<oneshot::Receiver<Result<Option<Arc<Dispatch>>, GatewayError>>, GatewayError> {
        let mut state = self.inner.state.lock();
        if !state.flight.as_ref().is_some_and(|f| f.id == flight_id) {
            return Err(GatewayError::InterruptedByKill {
                shard_id: self.inner.id,
            });
        }

        state.epoch += 1;
        let epoch = state.epoch;

        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            self.inner.id,
            self.inner.bus.clone(),
            connection.writer,
            rx,
        ));
        let reader = tokio::spawn(self.clone().read_loop(epoch, connection.reader));

        state.socket = Some(Socket { outgoing, reader });
        state.last_close = None;

        let (init, live) = oneshot::channel();
        state.init = Some(init);

        debug!(shard_id = self.inner.id, epoch, "Socket open");

        let next = if resume && state.can_resume() {
            ShardStatus::Resuming
        } else {
            ShardStatus::Identifying
        };
        self.enter_locked(&mut state, next);

        Ok(live)
    }

    async fn read_loop(self, epoch: u64, mut reader: Box<dyn SocketReader>) {
        loop {
            match reader.next_frame().await {
                Some(Ok(Frame::Text(text))) => self.handle_text(epoch, &text),
                Some(Ok(Frame::Close(frame))) => {
                    self.handle_close(epoch, frame);
                    return;
                }
                Some(Err(e)) => {
                    warn!(shard_id = self.inner.id, error = %e, "Socket error");
                }
                None => {
                    self.handle_close(epoch, None);
                    return;
                }
            }
        }
    }

    fn handle_text(&self, epoch: u64, text: &str) {
        let payload: InboundPayload = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(shard_id = self.inner.id, error = %e, "Ignoring malformed payload");
                return;
            }
        };

        let dispatch = {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            if let Some(sequence) = payload.s {
                state.sequence = Some(sequence);
            }
            self.handle_payload_locked(&mut state, epoch, payload)
        };

        // Delivered outside the lock, still in arrival order
        if let Some(dispatch) = dispatch {
            telemetry::record_dispatch(self.inner.id, &dispatch.kind);
            self.inner.bus.dispatch(dispatch);
        }
    }

    fn handle_payload_locked(
        &self,
        state: &mut SessionState,
        epoch: u64,
        payload: InboundPayload,
    ) -> Option<Arc<Dispatch>> {
        let shard_id = self.inner.id;
        let Some(op) = OpCode::from_u8(payload.op) else {
            debug!(shard_id, op = payload.op, "Ignoring unknown opcode");
            return None;
        };

        match op {
            OpCode::Dispatch => return self.handle_dispatch_locked(state, epoch, payload),
            OpCode::Heartbeat => {
                debug!(shard_id, "Got heartbeat request");
                self.heartbeat_locked(state, true);
            }
            OpCode::Reconnect => {
                self.close_locked(state, true, RESUMABLE_CLOSE, "Got Reconnect (opcode 7)");
                self.enter_locked(state, ShardStatus::Disconnected);
                self.reconnect_locked(state, true);
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                let code = if resumable { RESUMABLE_CLOSE } else { NORMAL_CLOSE };
                self.close_locked(state, resumable, code, "Got Invalid Session (opcode 9)");
                self.enter_locked(state, ShardStatus::Disconnected);
                if state.flight.is_none() {
                    self.schedule_reconnect_locked(state, resumable);
                }
            }
            OpCode::Hello => self.handle_hello_locked(state, epoch, &payload.d),
            OpCode::HeartbeatAck => {
                if let Some(ping) = state.heartbeat.ack(Instant::now()) {
                    telemetry::record_ping(shard_id, ping);
                }
                debug!(shard_id, ping_ms = state.heartbeat.ping().as_millis() as u64, "Heartbeat ACK");
            }
            other => {
                debug!(shard_id, op = other.name(), "Ignoring unexpected opcode");
            }
        }

        None
    }

    fn handle_dispatch_locked(
        &self,
        state: &mut SessionState,
        epoch: u64,
        payload: InboundPayload,
    ) -> Option<Arc<Dispatch>> {
        let shard_id = self.inner.id;
        let Some(kind) = payload.t else {
            warn!(shard_id, "Ignoring dispatch without an event name");
            return None;
        };

        let dispatch = Arc::new(Dispatch {
            shard_id,
            kind,
            sequence: payload.s,
            data: payload.d,
        });

        match dispatch.kind.as_str() {
            "READY" => match Ready::deserialize(&dispatch.data) {
                Ok(ready) => {
                    info!(shard_id, guilds = ready.guilds.len(), "Shard ready");
                    state.session_id = Some(ready.session_id);
                    state.ready = Some(Arc::clone(&dispatch));
                    state.guilds.extend(ready.guilds.iter().map(|g| g.id));

                    self.enter_locked(state, ShardStatus::Running);

                    if self.inner.options.intents.contains(Intents::GUILDS) {
                        state.guild_sync.begin(ready.guilds.iter().map(|g| g.id));
                        self.check_guilds_ready_locked(state, epoch);
                    } else {
                        self.enter_locked(state, ShardStatus::GuildsReady);
                    }
                }
                Err(e) => warn!(shard_id, error = %e, "Ignoring malformed READY"),
            },
            "RESUMED" => {
                info!(shard_id, "Shard resumed");
                self.enter_locked(state, ShardStatus::Running);
            }
            "GUILD_CREATE" => {
                if let Ok(guild) = GuildRef::deserialize(&dispatch.data) {
                    state.guilds.insert(guild.id);
                    if state.status == ShardStatus::Running && state.guild_sync.arrived(guild.id) {
                        self.check_guilds_ready_locked(state, epoch);
                    }
                }
            }
            "GUILD_DELETE" => {
                if let Ok(guild) = GuildRef::deserialize(&dispatch.data) {
                    if guild.unavailable != Some(true) {
                        state.guilds.remove(&guild.id);
                    }
                }
            }
            _ => {}
        }

        telemetry::set_guilds(shard_id, state.guilds.len());
        Some(dispatch)
    }

    fn handle_hello_locked(&self, state: &mut SessionState, epoch: u64, data: &serde_json::Value) {
        let shard_id = self.inner.id;
        let hello = match Hello::deserialize(data) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(shard_id, error = %e, "Ignoring malformed Hello");
                return;
            }
        };

        debug!(shard_id, interval_ms = hello.heartbeat_interval, "Got Hello");
        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        self.start_heartbeat_locked(state, epoch, interval);

        let resuming = state.status == ShardStatus::Resuming && state.can_resume();
        let text = if resuming {
            let resume = Resume {
                token: &self.inner.token,
                session_id: state.session_id.as_deref().unwrap_or_default(),
                seq: state.sequence.unwrap_or_default(),
            };
            serde_json::to_string(&Command::new(OpCode::Resume, resume))
        } else {
            let options = &self.inner.options;
            let identify = Identify::new(
                &self.inner.token,
                options.intents,
                options.large_threshold,
                options.presence.as_ref(),
                [shard_id, self.inner.total],
            );
            serde_json::to_string(&Command::new(OpCode::Identify, identify))
        };

        let text = match text {
            Ok(text) => text,
            Err(source) => {
                let e = GatewayError::SerializationFailed { shard_id, source };
                self.handshake_failed_locked(state, resuming, &e);
                return;
            }
        };

        let op = if resuming { OpCode::Resume } else { OpCode::Identify };
        let (ack, sent) = oneshot::channel();
        match push_outgoing(state.socket.as_ref(), shard_id, text, op as u8, Some(ack)) {
            Ok(()) => self.watch_handshake(epoch, sent, resuming),
            Err(e) => self.handshake_failed_locked(state, resuming, &e),
        }
    }

    fn watch_handshake(
        &self,
        epoch: u64,
        sent: oneshot::Receiver<Result<(), GatewayError>>,
        resuming: bool,
    ) {
        let shard = self.clone();
        tokio::spawn(async move {
            let shard_id = shard.inner.id;
            let result = sent
                .await
                .unwrap_or(Err(GatewayError::SendWithoutOpenSocket { shard_id }));

            if let Err(e) = result {
                let mut state = shard.inner.state.lock();
                if state.epoch == epoch {
                    shard.handshake_failed_locked(&mut state, resuming, &e);
                }
            }
        });
    }

    fn handshake_failed_locked(&self, state: &mut SessionState, resuming: bool, error: &GatewayError) {
        let (code, reason) = if resuming {
            (RESUMABLE_CLOSE, "Failed to send resume payload")
        } else {
            (NORMAL_CLOSE, "Failed to send identify payload")
        };

        warn!(shard_id = self.inner.id, error = %error, "{reason}");
        self.close_locked(state, resuming, code, reason);
        self.enter_locked(state, ShardStatus::Disconnected);
    }

    fn start_heartbeat_locked(&self, state: &mut SessionState, epoch: u64, interval: Duration) {
        let stamp = state.heartbeat.arm_jitter();
        let shard = self.clone();

        let handle = tokio::spawn(async move {
            sleep(interval / 2).await;
            if !shard.heartbeat_jitter_elapsed(epoch, stamp) {
                return;
            }

            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !shard.heartbeat_tick(epoch) {
                    return;
                }
            }
        });

        state.heartbeat.timer.replace(handle);
    }

    fn heartbeat_jitter_elapsed(&self, epoch: u64, stamp: u64) -> bool {
        let mut state = self.inner.state.lock();
        if state.epoch != epoch || !state.heartbeat.take_jitter(stamp) || !state.status.heartbeats() {
            return false;
        }
        self.heartbeat_locked(&mut state, false)
    }

    fn heartbeat_tick(&self, epoch: u64) -> bool {
        let mut state = self.inner.state.lock();
        if state.epoch != epoch {
            return false;
        }
        self.heartbeat_locked(&mut state, false)
    }

    /// Returns false when the connection was found zombified and torn down.
    fn heartbeat_locked(&self, state: &mut SessionState, force: bool) -> bool {
        let shard_id = self.inner.id;

        match state.heartbeat.tick(force) {
            Tick::Zombie => {
                warn!(shard_id, "Not receiving heartbeat ACKs (zombified connection), restarting");
                telemetry::record_error(shard_id, "zombie_connection");
                self.close_locked(state, true, ZOMBIE_CLOSE, "Did not receive heartbeat ACK");
                self.enter_locked(state, ShardStatus::Disconnected);
                self.reconnect_locked(state, true);
                false
            }
            Tick::Beat => {
                let sent = serde_json::to_string(&protocol::heartbeat(state.sequence))
                    .map_err(|source| GatewayError::SerializationFailed { shard_id, source })
                    .and_then(|text| {
                        push_outgoing(state.socket.as_ref(), shard_id, text, OpCode::Heartbeat as u8, None)
                    });

                match sent {
                    Ok(()) => state.heartbeat.sent(Instant::now()),
                    Err(e) => warn!(shard_id, error = %e, "Failed to send heartbeat"),
                }
                true
            }
        }
    }

    fn check_guilds_ready_locked(&self, state: &mut SessionState, epoch: u64) {
        state.guild_sync.timer.cancel();

        if state.guild_sync.is_complete() {
            state.guild_sync.reset();
            self.enter_locked(state, ShardStatus::GuildsReady);
            return;
        }

        let shard = self.clone();
        let limit = self.inner.options.guilds_ready_timeout;
        let handle = tokio::spawn(async move {
            sleep(limit).await;
            shard.guilds_ready_timed_out(epoch);
        });
        state.guild_sync.timer.replace(handle);
    }

    fn guilds_ready_timed_out(&self, epoch: u64) {
        let mut state = self.inner.state.lock();
        if state.epoch != epoch || state.status != ShardStatus::Running || !state.guild_sync.is_tracking() {
            return;
        }

        warn!(
            shard_id = self.inner.id,
            missing = state.guild_sync.remaining(),
            "Timed out while waiting for guilds, entering GUILDS_READY anyway"
        );
        state.guild_sync.reset();
        self.enter_locked(&mut state, ShardStatus::GuildsReady);
    }

    fn handle_close(&self, epoch: u64, frame: Option<CloseFrame>) {
        let shard_id = self.inner.id;
        let mut state = self.inner.state.lock();
        if state.epoch != epoch {
            return;
        }

        let frame = frame.unwrap_or(CloseFrame {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
        });
        warn!(shard_id, code = frame.code, reason = %frame.reason, "Received close");
        telemetry::record_close(shard_id, frame.code);

        if is_recoverable_close(frame.code) {
            self.close_locked(&mut state, true, RESUMABLE_CLOSE, &frame.reason);
            state.last_close = Some(frame);
            self.enter_locked(&mut state, ShardStatus::Disconnected);
            self.reconnect_locked(&mut state, true);
        } else {
            error!(shard_id, code = frame.code, "Close code is not recoverable, killing shard");
            self.close_locked(&mut state, false, NORMAL_CLOSE, &frame.reason);
            state.last_close = Some(frame);
            self.enter_locked(&mut state, ShardStatus::Idle);
            cancel_flight(&mut state);
        }
    }

    /// Tear down everything tied to the current socket. Session id and
    /// sequence survive only when `resuming`.
    fn close_locked(&self, state: &mut SessionState, resuming: bool, code: u16, reason: &str) {
        let shard_id = self.inner.id;
        debug!(shard_id, code, reason, resuming, "Closing");

        let rejected = state.queue.reject_all(shard_id);
        if rejected > 0 {
            debug!(shard_id, rejected, "Force flushed send queue");
        }

        let frame = CloseFrame {
            code,
            reason: reason.to_string(),
        };
        if let Some(socket) = state.socket.take() {
            // Writer may already be gone
            let _ = socket.outgoing.send(Outgoing::Close(frame.clone()));
            socket.reader.abort();
        }
        state.epoch += 1;
        state.last_close = Some(frame);
        state.ready = None;

        state.heartbeat.reset();
        state.guild_sync.reset();
        state.reconnect_timer.cancel();

        if !resuming {
            state.sequence = None;
            state.session_id = None;
        }
    }

    fn enter_locked(&self, state: &mut SessionState, status: ShardStatus) {
        if state.status == status {
            return;
        }

        let shard_id = self.inner.id;
        let previous = std::mem::replace(&mut state.status, status);
        debug!(shard_id, from = %previous, to = %status, "Shard state changed");
        telemetry::set_shard_state(shard_id, status);
        self.inner
            .bus
            .emit(GatewayEvent::ShardStateChanged { shard_id, status });

        match status {
            ShardStatus::Running => {
                flush_queue(state, shard_id);
                if let Some(init) = state.init.take() {
                    let _ = init.send(Ok(state.ready.take()));
                }
            }
            ShardStatus::Idle | ShardStatus::Disconnected => {
                if let Some(init) = state.init.take() {
                    let (code, reason) = state
                        .last_close
                        .as_ref()
                        .map(|c| (c.code, c.reason.clone()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    let _ = init.send(Err(GatewayError::ClosedDuringInit {
                        shard_id,
                        code,
                        reason,
                    }));
                }
            }
            _ => {}
        }
    }

    /// Start a background restart (or fresh spawn) unless one is in flight.
    /// The flight is claimed before the task runs, so a kill in between
    /// cancels it.
    fn reconnect_locked(&self, state: &mut SessionState, resume: bool) {
        let operation = if resume { RESTART } else { SPAWN };
        let flight = match self.claim_flight_locked(state, operation) {
            Ok(flight) => flight,
            Err(e) => {
                debug!(shard_id = self.inner.id, error = %e, "Skipping reconnect");
                return;
            }
        };

        info!(shard_id = self.inner.id, resume, "Reconnecting");
        let shard = self.clone();
        tokio::spawn(shard.run_reconnect(flight, resume));
    }

    fn schedule_reconnect_locked(&self, state: &mut SessionState, resume: bool) {
        let shard = self.clone();
        let epoch = state.epoch;
        let delay = self.inner.options.invalid_session_delay;

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let mut state = shard.inner.state.lock();
            if state.epoch == epoch && state.status == ShardStatus::Disconnected {
                shard.reconnect_locked(&mut state, resume);
            }
        });
        state.reconnect_timer.replace(handle);
    }

    async fn run_reconnect(self, flight: FlightGuard, resume: bool) {
        let shard_id = self.inner.id;
        let result = if resume {
            self.restart_with(flight).await
        } else {
            self.spawn_with(flight).await.map(|_| ())
        };

        match result {
            Ok(()) => info!(shard_id, "Reconnected"),
            Err(e) if e.is_cancellation() => debug!(shard_id, "Reconnect cancelled by kill"),
            Err(e) => error!(shard_id, resume, error = %e, "Error reconnecting"),
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.inner.id)
            .field("total", &self.inner.total)
            .field("status", &self.status())
            .finish()
    }
}

fn cancel_flight(state: &mut SessionState) {
    if let Some(flight) = state.flight.take() {
        flight.token.cancel();
    }
}

fn push_outgoing(
    socket: Option<&Socket>,
    shard_id: u32,
    text: String,
    op: u8,
    ack: Option<SendAck>,
) -> Result<(), GatewayError> {
    let socket = socket.ok_or(GatewayError::SendWithoutOpenSocket { shard_id })?;
    socket
        .outgoing
        .send(Outgoing::Payload { text, op, ack })
        .map_err(|_| GatewayError::SendWithoutOpenSocket { shard_id })
}

/// Hand every queued send to the writer, oldest first.
fn flush_queue(state: &mut SessionState, shard_id: u32) {
    let SessionState { queue, socket, .. } = state;
    let mut flushed = 0usize;

    for item in queue.drain() {
        // A failed push drops the ack, which the waiting caller sees as an error
        let _ = push_outgoing(socket.as_ref(), shard_id, item.text, item.op, Some(item.done));
        flushed += 1;
    }

    if flushed > 0 {
        debug!(shard_id, flushed, "Flushed send queue");
    }
}

async fn write_loop(
    shard_id: u32,
    bus: EventBus,
    mut writer: Box<dyn SocketWriter>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Payload { text, op, ack } => {
                let result = writer.send(Frame::Text(text.clone())).await;
                let op_name = OpCode::from_u8(op).map_or("Unknown", OpCode::name);

                match &result {
                    Ok(()) => {
                        debug!(shard_id, op, op_name, "Sent payload");
                        telemetry::record_payload_sent(shard_id, op_name);
                        bus.emit(GatewayEvent::PayloadSent {
                            shard_id,
                            payload: text,
                        });
                    }
                    Err(e) => warn!(shard_id, op, op_name, error = %e, "Failed to send payload"),
                }

                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            Outgoing::Close(frame) => {
                if let Err(e) = writer.send(Frame::Close(Some(frame))).await {
                    debug!(shard_id, error = %e, "Close frame not delivered");
                }
                return;
            }
        }
    }
}
