use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use botbridge_protocol::{ActionCall, ActionResponse, MessageEvent};

use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// Synthetic message ids mimic the bot wire convention of small
/// numeric ids.
const MESSAGE_ID_RANGE: u64 = 1_000_000;

#[derive(Debug, Default)]
struct UpstreamStats {
    connected: AtomicBool,
    disconnects: AtomicU64,
    reconnect_attempts: AtomicU64,
}

/// Snapshot of the upstream link for the health/metrics collaborator.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UpstreamStatus {
    pub connected: bool,
    pub disconnects_total: u64,
    pub reconnect_attempts_total: u64,
}

enum Command {
    Write(String),
    Reconnect,
}

/// Cloneable handle to the single upstream connection task.
///
/// Inbound parsed frames flow to the router over the channel given to
/// [`spawn_upstream`]; writes are queued through this handle.
#[derive(Clone)]
pub struct UpstreamHandle {
    stats: Arc<UpstreamStats>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    self_id: u64,
}

impl UpstreamHandle {
    pub fn connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> UpstreamStatus {
        UpstreamStatus {
            connected: self.connected(),
            disconnects_total: self.stats.disconnects.load(Ordering::Relaxed),
            reconnect_attempts_total: self.stats.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    /// Tear down the current link and dial again (admin/config path).
    pub fn reconnect_now(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }

    /// Translate a user message into a bot wire event and write it.
    pub fn send_message(&self, user_id: &str, text: &str) -> Result<(), GatewayError> {
        if !self.connected() {
            return Err(GatewayError::ServiceUnavailable);
        }
        let user_id: u64 = user_id.parse().map_err(|_| GatewayError::InvalidUserId)?;
        let event = MessageEvent::private_text(
            self.self_id,
            user_id,
            text,
            Utc::now().timestamp() as u64,
            synthetic_message_id(),
        );
        let json = serde_json::to_string(&event).map_err(|e| GatewayError::Send(e.to_string()))?;
        tracing::debug!(user_id, "forwarding event to bot backend");
        self.cmd_tx
            .send(Command::Write(json))
            .map_err(|_| GatewayError::ServiceUnavailable)
    }

    /// Write an acknowledgement for an echoed action call. No-ops with
    /// a warning when the link is down.
    pub fn send_response(&self, ack: &ActionResponse) {
        if !self.connected() {
            tracing::warn!("cannot send ack, bot backend disconnected");
            return;
        }
        match serde_json::to_string(ack) {
            Ok(json) => {
                let _ = self.cmd_tx.send(Command::Write(json));
            }
            Err(e) => tracing::error!("failed to encode ack: {e}"),
        }
    }
}

/// Start the upstream connection task. Parsed inbound action calls are
/// forwarded on `frame_tx`.
pub fn spawn_upstream(
    config: &GatewayConfig,
    frame_tx: mpsc::UnboundedSender<ActionCall>,
) -> UpstreamHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let stats = Arc::new(UpstreamStats::default());
    let self_id = config.self_id.parse().unwrap_or_else(|_| {
        tracing::warn!(self_id = %config.self_id, "self id is not numeric, using 0");
        0
    });
    tokio::spawn(run_upstream(
        config.upstream_url.clone(),
        config.upstream_token.clone(),
        config.self_id.clone(),
        config.reconnect_interval,
        config.upstream_heartbeat_interval,
        stats.clone(),
        cmd_rx,
        frame_tx,
    ));
    UpstreamHandle {
        stats,
        cmd_tx,
        self_id,
    }
}

enum SessionEnd {
    LinkLost(String),
    Shutdown,
}

#[allow(clippy::too_many_arguments)]
async fn run_upstream(
    url: String,
    token: String,
    self_id: String,
    reconnect_interval: Duration,
    heartbeat_interval: Duration,
    stats: Arc<UpstreamStats>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    frame_tx: mpsc::UnboundedSender<ActionCall>,
) {
    let mut first_attempt = true;
    loop {
        if !first_attempt {
            stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        }
        first_attempt = false;

        let request = match build_request(&url, &token, &self_id) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("invalid upstream address: {e}");
                tokio::time::sleep(reconnect_interval).await;
                continue;
            }
        };
        let stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                tracing::warn!("failed to connect to bot backend: {e}");
                tokio::time::sleep(reconnect_interval).await;
                continue;
            }
        };

        tracing::info!(%url, "connected to bot backend");
        stats.connected.store(true, Ordering::Relaxed);
        let end = run_session(stream, &mut cmd_rx, &frame_tx, heartbeat_interval).await;
        stats.connected.store(false, Ordering::Relaxed);
        stats.disconnects.fetch_add(1, Ordering::Relaxed);

        match end {
            SessionEnd::LinkLost(reason) => {
                tracing::warn!(reason, "disconnected from bot backend, retrying");
            }
            SessionEnd::Shutdown => return,
        }
        tokio::time::sleep(reconnect_interval).await;
    }
}

async fn run_session(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    frame_tx: &mpsc::UnboundedSender<ActionCall>,
    heartbeat_interval: Duration,
) -> SessionEnd {
    let (mut sink, mut source) = stream.split();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await; // consume immediate first tick

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Write(json)) => {
                        if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                            return SessionEnd::LinkLost(format!("write failed: {e}"));
                        }
                    }
                    Some(Command::Reconnect) => {
                        let _ = sink.close().await;
                        return SessionEnd::LinkLost("reconnect requested".into());
                    }
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
            // Link-level liveness, independent of the message protocol.
            _ = heartbeat.tick() => {
                if sink.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    return SessionEnd::LinkLost("heartbeat failed".into());
                }
            }
            msg = source.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ActionCall>(&text) {
                            Ok(call) => {
                                let _ = frame_tx.send(call);
                            }
                            // Malformed frames die here, not in the router.
                            Err(e) => tracing::debug!("dropping unparsable bot frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sink.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        return SessionEnd::LinkLost(format!("closed by peer: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SessionEnd::LinkLost(format!("read failed: {e}"));
                    }
                    None => {
                        return SessionEnd::LinkLost("stream ended".into());
                    }
                }
            }
        }
    }
}

fn build_request(
    url: &str,
    token: &str,
    self_id: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, GatewayError> {
    let url = rewrite_ws_scheme(url);
    let mut request = url
        .into_client_request()
        .map_err(|e| GatewayError::Send(e.to_string()))?;
    let headers = request.headers_mut();
    if !token.is_empty() {
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| GatewayError::Send(e.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
    }
    headers.insert(
        "X-Self-ID",
        HeaderValue::from_str(self_id).map_err(|e| GatewayError::Send(e.to_string()))?,
    );
    headers.insert("X-Client-Role", HeaderValue::from_static("Universal"));
    headers.insert(USER_AGENT, HeaderValue::from_static("OneBot/11 (Adapter)"));
    Ok(request)
}

/// Accept `http(s)` upstream addresses by rewriting to `ws(s)`.
fn rewrite_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

pub(crate) fn synthetic_message_id() -> u64 {
    rand::rng().random_range(0..MESSAGE_ID_RANGE)
}

/// Detached handle whose writes land on the returned channel instead of
/// a live socket. Needs a running runtime.
#[cfg(test)]
pub(crate) fn test_handle(connected: bool) -> (UpstreamHandle, mpsc::UnboundedReceiver<String>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            if let Command::Write(json) = cmd {
                let _ = out_tx.send(json);
            }
        }
    });
    let stats = Arc::new(UpstreamStats::default());
    stats.connected.store(connected, Ordering::Relaxed);
    (
        UpstreamHandle {
            stats,
            cmd_tx,
            self_id: 123_456_789,
        },
        out_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_handle() -> UpstreamHandle {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        UpstreamHandle {
            stats: Arc::new(UpstreamStats::default()),
            cmd_tx,
            self_id: 123_456_789,
        }
    }

    #[test]
    fn send_fails_when_disconnected() {
        let handle = offline_handle();
        assert_eq!(
            handle.send_message("10001", "hi"),
            Err(GatewayError::ServiceUnavailable)
        );
    }

    #[tokio::test]
    async fn send_rejects_non_numeric_user_id() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(UpstreamStats::default());
        stats.connected.store(true, Ordering::Relaxed);
        let handle = UpstreamHandle {
            stats,
            cmd_tx,
            self_id: 123_456_789,
        };
        assert_eq!(
            handle.send_message("alice", "hi"),
            Err(GatewayError::InvalidUserId)
        );
        assert_eq!(
            handle.send_message("-5", "hi"),
            Err(GatewayError::InvalidUserId)
        );

        handle.send_message("10001", "hi").unwrap();
        let Some(Command::Write(json)) = cmd_rx.recv().await else {
            panic!("expected a queued write");
        };
        let event: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(event["post_type"], "message");
        assert_eq!(event["user_id"], 10001);
        assert_eq!(event["self_id"], 123_456_789);
        assert_eq!(event["raw_message"], "hi");
    }

    #[test]
    fn scheme_rewrite() {
        assert_eq!(rewrite_ws_scheme("http://bot:5000"), "ws://bot:5000");
        assert_eq!(rewrite_ws_scheme("https://bot:5000"), "wss://bot:5000");
        assert_eq!(rewrite_ws_scheme("ws://bot:5000"), "ws://bot:5000");
    }
}
