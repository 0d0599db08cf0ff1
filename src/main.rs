//! Arrakis Shard Gateway
//!
//! Process entry point:
//! - Loads configuration from the environment
//! - Connects the shard pool and relays dispatches to NATS JetStream
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use arrakis_shard_gateway::config::GatewayConfig;
use arrakis_shard_gateway::health::{self, AppState};
use arrakis_shard_gateway::metrics::GatewayMetrics;
use arrakis_shard_gateway::nats::{ensure_streams, NatsPublisher, NatsSink};
use arrakis_shard_gateway::{ShardPool, TungsteniteTransport, TwilightRest};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Dispatches buffered between the shard readers and the NATS relay
const NATS_RELAY_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_shard_gateway={}", gateway_config.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sharding = ?gateway_config.shard.sharding,
        intents = gateway_config.shard.intents.bits(),
        "Starting Arrakis Shard Gateway"
    );

    // Initialize metrics
    let metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    let pool = Arc::new(ShardPool::new(
        gateway_config.discord_token.clone(),
        gateway_config.shard.clone(),
        Arc::new(TwilightRest::new(gateway_config.discord_token.clone())),
        Arc::new(TungsteniteTransport),
    )?);

    // Connect to NATS if configured
    let nats = match gateway_config.nats_url {
        Some(ref url) => match NatsPublisher::connect(url).await {
            Ok(publisher) => {
                if let Err(e) = ensure_streams(publisher.jetstream()).await {
                    warn!(error = %e, "Continuing without stream setup");
                }
                let (sink, _relay) = NatsSink::spawn(Arc::clone(&publisher), NATS_RELAY_CAPACITY);
                pool.events().set_sink(sink);
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                None
            }
        },
        None => {
            info!("No NATS_URL configured - running in local mode");
            None
        }
    };

    // Start health server
    let app_state = AppState {
        pool: Arc::clone(&pool),
        nats: nats.clone(),
        metrics,
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    let connect = {
        let pool = Arc::clone(&pool);
        async move {
            match pool.connect(None).await {
                Ok(summary) => {
                    info!(success = summary.success, failed = summary.failed, "Shard pool connected");
                }
                Err(e) => error!(error = %e, "Shard pool failed to connect"),
            }
            // Shards keep running on their own tasks
            std::future::pending::<()>().await
        }
    };

    // Run everything concurrently
    tokio::select! {
        _ = connect => {}
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gateway...");

    pool.kill_all(1000, "Shutting down");

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
