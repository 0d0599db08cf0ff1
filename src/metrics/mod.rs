//! Prometheus metrics module
//!
//! Free functions record through the global `metrics` recorder so shards can
//! report without holding a handle; [`GatewayMetrics`] installs the
//! Prometheus recorder and renders the scrape output.

use crate::error::GatewayError;
use crate::shard::ShardStatus;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: Arc<PrometheusHandle>,
}

impl GatewayMetrics {
    /// Install the Prometheus recorder and register metric descriptions.
    ///
    /// Fails if a global recorder is already installed.
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Build a collector around a recorder that is not installed globally.
    ///
    /// Renders an empty scrape; used where the global recorder is owned elsewhere.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: Arc::new(recorder.handle()),
        }
    }

    /// Register metric descriptions
    fn register_metrics() {
        // Counters
        describe_counter!(
            "gateway_dispatches_total",
            Unit::Count,
            "Total dispatches received from the gateway"
        );
        describe_counter!(
            "gateway_payloads_sent_total",
            Unit::Count,
            "Total payloads written to gateway sockets"
        );
        describe_counter!(
            "gateway_closes_total",
            Unit::Count,
            "Socket closes received, by close code"
        );
        describe_counter!(
            "gateway_spawns_total",
            Unit::Count,
            "Shard spawn outcomes"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );
        describe_counter!(
            "gateway_events_routed_total",
            Unit::Count,
            "Total dispatches published to NATS"
        );
        describe_counter!(
            "gateway_route_failures_total",
            Unit::Count,
            "Failed dispatch publishes to NATS"
        );

        // Latency histograms
        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round trip time"
        );
        describe_histogram!(
            "gateway_event_route_duration_seconds",
            Unit::Seconds,
            "Time to publish a dispatch to NATS"
        );

        // Gauges
        describe_gauge!(
            "gateway_shard_state",
            Unit::Count,
            "Shard lifecycle state (0=idle .. 6=disconnected)"
        );
        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards with a live session"
        );
        describe_gauge!(
            "gateway_guilds_total",
            Unit::Count,
            "Guilds tracked per shard"
        );
        describe_gauge!(
            "gateway_nats_connected",
            Unit::Count,
            "NATS connection status (1=connected, 0=disconnected)"
        );
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a dispatch received
pub fn record_dispatch(shard_id: u32, kind: &str) {
    counter!(
        "gateway_dispatches_total",
        "shard_id" => shard_id.to_string(),
        "event_type" => kind.to_ascii_lowercase()
    )
    .increment(1);
}

/// Record a payload written to the socket
pub fn record_payload_sent(shard_id: u32, op: &'static str) {
    counter!(
        "gateway_payloads_sent_total",
        "shard_id" => shard_id.to_string(),
        "op" => op
    )
    .increment(1);
}

/// Record a received close frame
pub fn record_close(shard_id: u32, code: u16) {
    counter!(
        "gateway_closes_total",
        "shard_id" => shard_id.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a spawn outcome
pub fn record_spawn(shard_id: u32, success: bool) {
    counter!(
        "gateway_spawns_total",
        "shard_id" => shard_id.to_string(),
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record gateway error
pub fn record_error(shard_id: u32, error_type: &'static str) {
    counter!(
        "gateway_errors_total",
        "shard_id" => shard_id.to_string(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Record a heartbeat round trip
pub fn record_ping(shard_id: u32, ping: Duration) {
    histogram!(
        "gateway_heartbeat_latency_seconds",
        "shard_id" => shard_id.to_string()
    )
    .record(ping.as_secs_f64());
}

/// Set the lifecycle state gauge for a shard
pub fn set_shard_state(shard_id: u32, status: ShardStatus) {
    gauge!(
        "gateway_shard_state",
        "shard_id" => shard_id.to_string()
    )
    .set(status.gauge_value());
}

/// Set guild count for a shard
pub fn set_guilds(shard_id: u32, count: usize) {
    gauge!(
        "gateway_guilds_total",
        "shard_id" => shard_id.to_string()
    )
    .set(count as f64);
}

/// Set live shard count
pub fn set_shards_ready(count: usize) {
    gauge!("gateway_shards_ready").set(count as f64);
}

/// Record successful publish to NATS
pub fn record_route_success(shard_id: u32, duration: Duration) {
    counter!(
        "gateway_events_routed_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);

    histogram!(
        "gateway_event_route_duration_seconds",
        "shard_id" => shard_id.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record failed publish
pub fn record_route_failure(shard_id: u32) {
    counter!(
        "gateway_route_failures_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);
}

/// Set NATS connection status
pub fn set_nats_connected(connected: bool) {
    gauge!("gateway_nats_connected").set(if connected { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_dispatch(0, "GUILD_CREATE");
        record_close(0, 4000);
        record_ping(0, Duration::from_millis(40));
        set_shard_state(0, ShardStatus::Running);
    }

    #[test]
    fn detached_collector_renders() {
        let metrics = GatewayMetrics::detached();
        assert!(!metrics.render().contains("gateway_dispatches_total"));
    }
}
