use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use botbridge_protocol::{decode_client_frame, ClientFrame};

use crate::registry::{ConnHandle, Outbound};
use crate::router::GatewayRouter;

/// Literal liveness tokens exchanged outside the JSON envelope.
const PING: &str = "PING";
const PONG: &str = "PONG";

/// Run one client connection to completion.
///
/// The connection may arrive pre-identified via the `user_id` query
/// parameter; otherwise it binds on the first `message_new` carrying
/// metadata. All outbound traffic funnels through the registry's
/// connection handle so the router can push replies concurrently.
pub async fn run_connection(
    socket: WebSocket,
    initial_user: Option<String>,
    router: GatewayRouter,
    ping_interval: Duration,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = ConnHandle::new(outbound_tx);
    let span = tracing::info_span!("conn", id = %handle.id);
    let _enter = span.enter();

    let (mut sink, mut stream) = socket.split();

    let mut bound_user: Option<String> = None;
    if let Some(user_id) = initial_user.filter(|id| !id.is_empty()) {
        tracing::info!(user_id, "client connected pre-identified");
        router.registry().register(&user_id, handle.clone());
        router.flush_to(&user_id, &handle);
        bound_user = Some(user_id);
    } else {
        tracing::info!("client connected, awaiting identification");
    }
    // The enter guard is not Send and must not cross an await.
    drop(_enter);

    let ping_enabled = !ping_interval.is_zero();
    let mut ping = tokio::time::interval(if ping_enabled {
        ping_interval
    } else {
        Duration::from_secs(3600)
    });
    ping.tick().await; // consume immediate first tick

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&mut sink, &text, &handle, &mut bound_user, &router).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "client closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("client read failed: {e}");
                        break;
                    }
                    None => {
                        tracing::info!("client stream ended");
                        break;
                    }
                }
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(Outbound::Frame(json)) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = ping.tick(), if ping_enabled => {
                if sink.send(Message::Text(PING.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    router.registry().disconnect_conn(handle.id);
    if let Some(user_id) = &bound_user {
        tracing::info!(user_id, "client disconnected");
    } else {
        tracing::info!("anonymous client disconnected");
    }
}

async fn handle_text(
    sink: &mut SplitSink<WebSocket, Message>,
    text: &str,
    handle: &ConnHandle,
    bound_user: &mut Option<String>,
    router: &GatewayRouter,
) {
    if text.trim() == PING {
        let _ = sink.send(Message::Text(PONG.into())).await;
        return;
    }
    match decode_client_frame(text) {
        Ok(ClientFrame::MessageNew { payload }) => {
            router.handle_message_new(handle, bound_user, payload);
        }
        Ok(other) => {
            tracing::debug!(?other, "unexpected frame from client (ignored)");
        }
        // Malformed frames are dropped, never answered: an error reply
        // here could be mistaken for a protocol ack.
        Err(e) => {
            tracing::warn!("dropping malformed client frame: {e}");
        }
    }
}
