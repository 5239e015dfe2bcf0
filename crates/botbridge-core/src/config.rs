use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address for the client-facing WS server (default: 127.0.0.1:8080).
    pub bind: SocketAddr,
    /// Upstream bot backend address; `http(s)` schemes are rewritten to `ws(s)`.
    pub upstream_url: String,
    /// Bearer credential sent on the upstream connect request.
    pub upstream_token: String,
    /// Self identifier announced to the bot backend; must be numeric
    /// for the wire protocol.
    pub self_id: String,
    /// Interval between literal `PING` frames to clients; disabled if zero.
    pub client_ping_interval: Duration,
    /// Fixed retry interval for the upstream link (no backoff).
    pub reconnect_interval: Duration,
    /// Link-level ping interval on the upstream connection.
    pub upstream_heartbeat_interval: Duration,
    /// Per-user offline queue cap; oldest entries dropped on overflow.
    pub max_queue_per_user: usize,
    /// Global session table cap; eviction kicks in for new user ids.
    pub max_sessions: usize,
    /// Offline sessions with an empty queue are destroyed after this.
    pub offline_ttl: Duration,
    /// Durable session snapshot path.
    pub data_file: PathBuf,
    /// Interval between idle sweeps + snapshot saves.
    pub maintenance_interval: Duration,
    /// Default ttl for idempotency records.
    pub idempotency_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            upstream_url: "ws://localhost:5000".into(),
            upstream_token: String::new(),
            self_id: "123456789".into(),
            client_ping_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            upstream_heartbeat_interval: Duration::from_secs(5),
            max_queue_per_user: 200,
            max_sessions: 5000,
            offline_ttl: Duration::from_secs(604_800),
            data_file: PathBuf::from("data/sessions.json"),
            maintenance_interval: Duration::from_secs(120),
            idempotency_ttl: Duration::from_secs(300),
        }
    }
}
