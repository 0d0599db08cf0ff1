//! NATS JetStream integration
//!
//! Relays gateway dispatches to NATS streams.

mod publisher;

pub use publisher::{ensure_streams, route_subject, streams, subjects, NatsPublisher, NatsSink};
