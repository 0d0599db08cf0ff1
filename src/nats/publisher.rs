//! NATS event publisher
//!
//! Publishes dispatch envelopes to NATS JetStream. [`NatsSink`] bridges the
//! synchronous dispatch sink to the async publisher through a bounded channel.

use crate::error::GatewayError;
use crate::events::{Dispatch, DispatchEnvelope, DispatchSink};
use crate::metrics as telemetry;
use async_nats::jetstream::{self, Context as JsContext};
use async_nats::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stream names
pub mod streams {
    /// Commands stream for interactions
    pub const COMMANDS: &str = "COMMANDS";
    /// Events stream for every other dispatch
    pub const EVENTS: &str = "EVENTS";
}

/// Subject prefixes for routing
pub mod subjects {
    /// Interactions: commands.interaction
    pub const INTERACTION: &str = "commands.interaction";
    /// Guild events: events.guild.{join,leave,update}
    pub const GUILD_EVENTS: &str = "events.guild";
    /// Member events: events.member.{join,leave,update}
    pub const MEMBER_EVENTS: &str = "events.member";
    /// Everything else: events.{dispatch_name}
    pub const EVENTS: &str = "events";
}

/// Subject a dispatch is published on
pub fn route_subject(event_type: &str) -> String {
    match event_type {
        "INTERACTION_CREATE" => subjects::INTERACTION.to_string(),

        "GUILD_CREATE" => format!("{}.join", subjects::GUILD_EVENTS),
        "GUILD_DELETE" => format!("{}.leave", subjects::GUILD_EVENTS),
        "GUILD_UPDATE" => format!("{}.update", subjects::GUILD_EVENTS),

        "GUILD_MEMBER_ADD" => format!("{}.join", subjects::MEMBER_EVENTS),
        "GUILD_MEMBER_REMOVE" => format!("{}.leave", subjects::MEMBER_EVENTS),
        "GUILD_MEMBER_UPDATE" => format!("{}.update", subjects::MEMBER_EVENTS),

        other => format!("{}.{}", subjects::EVENTS, other.to_ascii_lowercase()),
    }
}

/// NATS publisher for gateway dispatches
pub struct NatsPublisher {
    client: Client,
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server
    pub async fn connect(servers: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;

        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");
        telemetry::set_nats_connected(true);

        Ok(Arc::new(Self {
            client,
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    pub fn jetstream(&self) -> &JsContext {
        &self.jetstream
    }

    /// Publish an envelope to the subject its dispatch type routes to
    pub async fn publish(&self, envelope: &DispatchEnvelope) -> Result<(), GatewayError> {
        let subject = route_subject(&envelope.event_type);
        let payload = serde_json::to_vec(envelope).map_err(|source| GatewayError::SerializationFailed {
            shard_id: envelope.shard_id,
            source,
        })?;

        debug!(
            event_type = %envelope.event_type,
            subject,
            event_id = %envelope.event_id,
            "Publishing event"
        );

        let started = Instant::now();
        let result = match self.jetstream.publish(subject.clone(), payload.into()).await {
            Ok(ack) => ack.await.map_err(|e| Box::new(e) as crate::error::BoxError),
            Err(e) => Err(Box::new(e) as crate::error::BoxError),
        };

        match result {
            Ok(ack) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                telemetry::record_route_success(envelope.shard_id, started.elapsed());
                debug!(subject, stream = %ack.stream, seq = ack.sequence, "Event published");
                Ok(())
            }
            Err(source) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                telemetry::record_route_failure(envelope.shard_id);
                warn!(subject, error = %source, "Failed to publish event");
                Err(GatewayError::NatsPublishFailed { subject, source })
            }
        }
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        telemetry::set_nats_connected(false);
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS client");
        }
    }
}

/// Dispatch sink relaying every dispatch to NATS.
///
/// `handle` never blocks: when the relay falls behind, dispatches are dropped
/// with a warning.
pub struct NatsSink {
    tx: mpsc::Sender<DispatchEnvelope>,
}

impl NatsSink {
    /// Create the sink and start the publishing task draining it.
    pub fn spawn(publisher: Arc<NatsPublisher>, capacity: usize) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DispatchEnvelope>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                // Failures are counted and logged by the publisher
                let _ = publisher.publish(&envelope).await;
            }
            debug!("NATS relay stopped");
        });

        (Arc::new(Self { tx }), handle)
    }
}

impl DispatchSink for NatsSink {
    fn handle(&self, dispatch: &Dispatch) {
        let envelope = DispatchEnvelope::from_dispatch(dispatch);
        if let Err(e) = self.tx.try_send(envelope) {
            telemetry::record_route_failure(dispatch.shard_id);
            warn!(shard_id = dispatch.shard_id, event_type = %dispatch.kind, error = %e, "Dropping dispatch, NATS relay is behind");
        }
    }
}

/// Ensure streams exist with correct configuration
///
/// This is typically run during startup or by a separate setup job.
pub async fn ensure_streams(js: &JsContext) -> Result<(), GatewayError> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    let configs = [
        // Memory storage, 60s retention for fast command processing
        Config {
            name: streams::COMMANDS.to_string(),
            subjects: vec!["commands.>".to_string()],
            retention: RetentionPolicy::Limits,
            max_age: std::time::Duration::from_secs(60),
            storage: StorageType::Memory,
            ..Default::default()
        },
        // Memory storage, 5min retention for event processing
        Config {
            name: streams::EVENTS.to_string(),
            subjects: vec!["events.>".to_string()],
            retention: RetentionPolicy::Limits,
            max_age: std::time::Duration::from_secs(300),
            storage: StorageType::Memory,
            ..Default::default()
        },
    ];

    for config in configs {
        let name = config.name.clone();
        match js.get_or_create_stream(config).await {
            Ok(_) => info!(stream = %name, "Stream ready"),
            Err(e) => {
                error!(stream = %name, error = %e, "Failed to create stream");
                return Err(GatewayError::NatsConnectionFailed(Box::new(e)));
            }
        }
    }

    info!("NATS streams configured");
    Ok(())
}
