use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use botbridge_core::{
    build_router, spawn_upstream, GatewayConfig, GatewayRouter, IdempotencyCache, ReplyCorrelator,
    SessionRegistry,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Sessions younger than this are never swept, whatever the env says.
const OFFLINE_TTL_FLOOR: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let defaults = GatewayConfig::default();

    let config = GatewayConfig {
        bind: parse_socket("BRIDGE_BIND", defaults.bind),
        upstream_url: parse_string("BRIDGE_UPSTREAM_URL", &defaults.upstream_url),
        upstream_token: parse_string("BRIDGE_UPSTREAM_TOKEN", &defaults.upstream_token),
        self_id: parse_string("BRIDGE_SELF_ID", &defaults.self_id),
        client_ping_interval: parse_duration("BRIDGE_PING_SECS", defaults.client_ping_interval),
        reconnect_interval: parse_duration("BRIDGE_RECONNECT_SECS", defaults.reconnect_interval),
        upstream_heartbeat_interval: defaults.upstream_heartbeat_interval,
        max_queue_per_user: parse_usize("BRIDGE_MAX_QUEUE_PER_USER", defaults.max_queue_per_user),
        max_sessions: parse_usize("BRIDGE_MAX_SESSIONS", defaults.max_sessions),
        offline_ttl: parse_duration("BRIDGE_OFFLINE_TTL_SECS", defaults.offline_ttl)
            .max(OFFLINE_TTL_FLOOR),
        data_file: PathBuf::from(parse_string(
            "BRIDGE_DATA_FILE",
            &defaults.data_file.to_string_lossy(),
        )),
        maintenance_interval: parse_duration(
            "BRIDGE_MAINTENANCE_SECS",
            defaults.maintenance_interval,
        ),
        idempotency_ttl: parse_duration("BRIDGE_IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl),
    };

    let registry = Arc::new(SessionRegistry::new(&config));
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let upstream = spawn_upstream(&config, frame_tx);
    let router = GatewayRouter::new(
        registry.clone(),
        ReplyCorrelator::new(),
        upstream,
        IdempotencyCache::new(),
        config.idempotency_ttl,
    );
    tokio::spawn(router.clone().run_upstream_loop(frame_rx));

    // Periodic sweep of expired sessions plus a durable snapshot.
    let maintenance_registry = registry.clone();
    let maintenance_interval = config.maintenance_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(maintenance_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            maintenance_registry.sweep_idle();
            if let Err(e) = maintenance_registry.save() {
                tracing::error!("failed to save session snapshot: {e}");
            }
        }
    });

    let app = build_router(router, config.client_ping_interval);
    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, upstream = %config.upstream_url, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = registry.save() {
        tracing::error!("failed to save session snapshot on shutdown: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {e}");
        return;
    }
    tracing::info!("shutdown requested");
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_socket(key: &str, default: SocketAddr) -> SocketAddr {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_duration(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Duration::from_secs).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}
