use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use botbridge_core::{
    build_router, spawn_upstream, GatewayConfig, GatewayRouter, IdempotencyCache, ReplyCorrelator,
    SessionRegistry,
};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Helpers ──────────────────────────────────────────────────────────

/// In-process stand-in for the bot backend: accepts the gateway's
/// upstream connection, surfaces received frames, writes queued action
/// calls.
struct FakeBot {
    events: mpsc::UnboundedReceiver<Value>,
    actions: mpsc::UnboundedSender<Value>,
}

impl FakeBot {
    async fn recv(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a bot-side frame")
            .expect("bot-side channel closed")
    }

    fn send(&self, action: Value) {
        self.actions.send(action).unwrap();
    }
}

async fn start_fake_bot() -> (SocketAddr, FakeBot) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (event_tx, events) = mpsc::unbounded_channel();
    let (actions, mut actions_rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        // One connection at a time; the gateway redials if it drops.
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let (mut sink, mut source) = ws.split();
            loop {
                tokio::select! {
                    msg = source.next() => {
                        match msg {
                            Some(Ok(tungstenite::Message::Text(t))) => {
                                if let Ok(v) = serde_json::from_str::<Value>(&t) {
                                    let _ = event_tx.send(v);
                                }
                            }
                            Some(Ok(tungstenite::Message::Ping(d))) => {
                                let _ = sink.send(tungstenite::Message::Pong(d)).await;
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        }
                    }
                    action = actions_rx.recv() => {
                        match action {
                            Some(v) => {
                                let _ = sink
                                    .send(tungstenite::Message::Text(v.to_string().into()))
                                    .await;
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    });

    (addr, FakeBot { events, actions })
}

fn test_config(upstream: SocketAddr, dir: &std::path::Path) -> GatewayConfig {
    GatewayConfig {
        upstream_url: format!("ws://{upstream}"),
        data_file: dir.join("sessions.json"),
        reconnect_interval: Duration::from_millis(100),
        upstream_heartbeat_interval: Duration::from_secs(1),
        // Server-side pings off so tests read frames deterministically.
        client_ping_interval: Duration::ZERO,
        ..Default::default()
    }
}

async fn start_gateway(config: GatewayConfig) -> (SocketAddr, GatewayRouter) {
    let registry = Arc::new(SessionRegistry::new(&config));
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let upstream = spawn_upstream(&config, frame_tx);
    let router = GatewayRouter::new(
        registry,
        ReplyCorrelator::new(),
        upstream,
        IdempotencyCache::new(),
        config.idempotency_ttl,
    );
    tokio::spawn(router.clone().run_upstream_loop(frame_rx));

    let app = build_router(router.clone(), config.client_ping_interval);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, router)
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn connect_client(addr: SocketAddr, user_id: Option<&str>) -> WsStream {
    let url = match user_id {
        Some(id) => format!("ws://{addr}/ws?user_id={id}"),
        None => format!("ws://{addr}/ws"),
    };
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream
}

/// Read the next text frame, replying to pings and skipping pongs.
async fn next_text(ws: &mut WsStream) -> String {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Text(t))) => return t.to_string(),
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    let _ = ws.send(tungstenite::Message::Pong(data)).await;
                }
                Some(Ok(tungstenite::Message::Pong(_))) => continue,
                Some(Ok(other)) => panic!("unexpected message: {other:?}"),
                Some(Err(e)) => panic!("ws error: {e}"),
                None => panic!("ws stream ended unexpectedly"),
            }
        }
    })
    .await
    .expect("timed out waiting for a client frame")
}

fn message_new(user_id: &str, text: &str) -> tungstenite::Message {
    tungstenite::Message::Text(
        json!({
            "event": "message_new",
            "payload": {
                "text": text,
                "metadata": {"user_id": user_id, "session_id": "web"}
            }
        })
        .to_string()
        .into(),
    )
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn literal_ping_gets_literal_pong() {
    let dir = tempfile::tempdir().unwrap();
    let (bot_addr, _bot) = start_fake_bot().await;
    let (addr, _router) = start_gateway(test_config(bot_addr, dir.path())).await;

    let mut ws = connect_client(addr, None).await;
    ws.send(tungstenite::Message::Text("PING".into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, "PONG");
}

#[tokio::test]
async fn full_roundtrip_with_ack() {
    let dir = tempfile::tempdir().unwrap();
    let (bot_addr, mut bot) = start_fake_bot().await;
    let (addr, router) = start_gateway(test_config(bot_addr, dir.path())).await;
    wait_until("upstream connect", || router.status().upstream.connected).await;

    let mut ws = connect_client(addr, Some("10001")).await;
    ws.send(message_new("10001", "hello bot")).await.unwrap();

    let event = bot.recv().await;
    assert_eq!(event["post_type"], "message");
    assert_eq!(event["user_id"], 10001);
    assert_eq!(event["raw_message"], "hello bot");

    bot.send(json!({
        "action": "send_private_msg",
        "params": {
            "user_id": 10001,
            "message": [{"type": "text", "data": {"text": "hello human"}}]
        },
        "echo": "e1"
    }));

    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["event"], "message_reply");
    assert_eq!(reply["payload"]["text"], "hello human");
    assert_eq!(reply["payload"]["metadata"]["user_id"], "10001");
    assert_eq!(reply["payload"]["metadata"]["session_id"], "bot-reply");

    let ack = bot.recv().await;
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["retcode"], 0);
    assert_eq!(ack["data"]["delivered"], true);
    assert_eq!(ack["echo"], "e1");
}

#[tokio::test]
async fn offline_reply_is_queued_then_flushed_on_connect() {
    let dir = tempfile::tempdir().unwrap();
    let (bot_addr, mut bot) = start_fake_bot().await;
    let (addr, router) = start_gateway(test_config(bot_addr, dir.path())).await;
    wait_until("upstream connect", || router.status().upstream.connected).await;

    bot.send(json!({
        "action": "send_msg",
        "params": {"user_id": "10002", "message": "you were away"},
        "echo": 1
    }));
    // Queued for an offline user, yet the ack reports delivered.
    let ack = bot.recv().await;
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["data"]["delivered"], true);
    wait_until("reply queued", || router.status().queued_messages == 1).await;

    // Connecting pre-identified flushes the queue before anything else.
    let mut ws = connect_client(addr, Some("10002")).await;
    let queued: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(queued["event"], "message_reply");
    assert_eq!(queued["payload"]["text"], "you were away");
    assert_eq!(router.status().queued_messages, 0);
}

#[tokio::test]
async fn upstream_down_yields_service_unavailable_frame() {
    let dir = tempfile::tempdir().unwrap();
    // Bind then drop to get a port nothing listens on.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (addr, _router) = start_gateway(test_config(dead_addr, dir.path())).await;

    let mut ws = connect_client(addr, Some("10001")).await;
    ws.send(message_new("10001", "anyone there?")).await.unwrap();

    let frame: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(frame["event"], "service_unavailable");
    assert_eq!(frame["error"], "service_unavailable");
}

#[tokio::test]
async fn malformed_frames_are_dropped_silently() {
    let dir = tempfile::tempdir().unwrap();
    let (bot_addr, _bot) = start_fake_bot().await;
    let (addr, _router) = start_gateway(test_config(bot_addr, dir.path())).await;

    let mut ws = connect_client(addr, None).await;
    ws.send(tungstenite::Message::Text("{not json".into()))
        .await
        .unwrap();
    ws.send(tungstenite::Message::Text(
        json!({"payload": {"text": "no event"}}).to_string().into(),
    ))
    .await
    .unwrap();

    // Neither frame gets a response; the next thing through is the pong.
    ws.send(tungstenite::Message::Text("PING".into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, "PONG");
}

#[tokio::test]
async fn integration_request_reply_correlates_through_the_stack() {
    let dir = tempfile::tempdir().unwrap();
    let (bot_addr, mut bot) = start_fake_bot().await;
    let (_addr, router) = start_gateway(test_config(bot_addr, dir.path())).await;
    wait_until("upstream connect", || router.status().upstream.connected).await;

    let waiter = {
        let router = router.clone();
        tokio::spawn(async move {
            router
                .request_reply_from_integration(
                    "crm",
                    "10003",
                    "order status?",
                    "req-42",
                    Duration::from_secs(5),
                )
                .await
        })
    };

    let event = bot.recv().await;
    assert_eq!(event["user_id"], 10003);
    assert_eq!(event["raw_message"], "order status?");

    bot.send(json!({
        "action": "send_private_msg",
        "params": {"user_id": 10003, "message": "shipped"}
    }));

    let reply = waiter.await.unwrap().unwrap();
    assert_eq!(reply["payload"]["text"], "shipped");
    assert_eq!(reply["payload"]["metadata"]["request_id"], "req-42");
}
