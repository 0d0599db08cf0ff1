//! Health check endpoints

use crate::metrics::{self as telemetry, GatewayMetrics};
use crate::nats::NatsPublisher;
use crate::shard::ShardPool;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Per-shard readiness detail
#[derive(Debug, Serialize)]
pub struct ShardReport {
    pub id: u32,
    pub status: &'static str,
    pub guilds: usize,
    pub ping_ms: u64,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub nats_connected: bool,
    pub guilds_total: usize,
    pub shards: Vec<ShardReport>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ShardPool>,
    pub nats: Option<Arc<NatsPublisher>>,
    pub metrics: GatewayMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn readiness(state: &AppState) -> ReadyResponse {
    let shards: Vec<ShardReport> = state
        .pool
        .shards()
        .iter()
        .map(|shard| ShardReport {
            id: shard.id(),
            status: shard.status().as_str(),
            guilds: shard.guild_count(),
            ping_ms: shard.ping().as_millis() as u64,
        })
        .collect();

    let shards_ready = state.pool.live_shard_count();
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());

    ReadyResponse {
        ready: shards_ready > 0 && nats_connected,
        shards_total: shards.len(),
        shards_ready,
        nats_connected,
        guilds_total: state.pool.total_guilds(),
        shards,
    }
}

/// Readiness endpoint - returns 200 if at least one shard is live
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = readiness(&state);

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    // Update current metrics
    telemetry::set_shards_ready(state.pool.live_shard_count());

    if let Some(ref nats) = state.nats {
        telemetry::set_nats_connected(nats.is_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
