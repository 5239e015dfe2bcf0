use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use botbridge_protocol::{
    encode_client_frame, extract_message_text, ActionCall, ActionResponse, ClientFrame,
    MessagePayload, retcodes, ACTION_SEND_MSG, ACTION_SEND_PRIVATE_MSG, DEFAULT_SESSION_TAG,
};

use crate::error::GatewayError;
use crate::idempotency::{CacheOutcome, IdempotencyCache, StoredResponse};
use crate::registry::{ConnHandle, SessionRegistry};
use crate::correlator::ReplyCorrelator;
use crate::upstream::{synthetic_message_id, UpstreamHandle, UpstreamStatus};

const INTEGRATION_SESSION_TAG: &str = "integration";

/// Aggregated gateway state for the health endpoint.
#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub sessions: usize,
    pub online: usize,
    pub queued_messages: usize,
    pub dropped_messages: u64,
    pub pending_waits: usize,
    pub idempotency_entries: usize,
    pub upstream: UpstreamStatus,
}

/// Central message router: client frames up to the bot backend, bot
/// action calls down to clients, integration sends on behalf of users.
#[derive(Clone)]
pub struct GatewayRouter {
    registry: Arc<SessionRegistry>,
    correlator: ReplyCorrelator,
    upstream: UpstreamHandle,
    idempotency: IdempotencyCache,
    idempotency_ttl: Duration,
}

impl GatewayRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        correlator: ReplyCorrelator,
        upstream: UpstreamHandle,
        idempotency: IdempotencyCache,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            correlator,
            upstream,
            idempotency,
            idempotency_ttl,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle a `message_new` frame from a client connection.
    ///
    /// The sender is identified by the frame's metadata, falling back
    /// to the connection's existing binding. Each frame re-registers
    /// the session (last registration wins residency) and flushes any
    /// queued replies before the new message is forwarded.
    pub fn handle_message_new(
        &self,
        handle: &ConnHandle,
        bound_user: &mut Option<String>,
        payload: MessagePayload,
    ) {
        let metadata = payload.metadata.as_ref();
        let user_id = match metadata
            .map(|m| m.user_id.as_str())
            .filter(|id| !id.is_empty())
            .or(bound_user.as_deref())
        {
            Some(id) => id.to_string(),
            None => {
                tracing::warn!("message_new without a user id");
                self.send_error(handle, &GatewayError::MissingUserId);
                return;
            }
        };

        // Every message re-registers: if another connection claimed the
        // user meanwhile, this one takes residency back.
        self.registry.register(&user_id, handle.clone());
        if bound_user.as_deref() != Some(user_id.as_str()) {
            tracing::info!(user_id, "connection identified");
            *bound_user = Some(user_id.clone());
        }
        self.flush_to(&user_id, handle);

        let session_tag = metadata
            .and_then(|m| m.session_id.as_deref())
            .filter(|tag| !tag.is_empty())
            .unwrap_or(DEFAULT_SESSION_TAG);
        self.registry
            .record_inbound(&user_id, &payload.text, session_tag);

        if let Err(e) = self.upstream.send_message(&user_id, &payload.text) {
            tracing::warn!(user_id, error = %e, "failed to forward message");
            self.send_error(handle, &e);
        }
    }

    /// Drain the user's offline queue down a freshly bound connection.
    pub fn flush_to(&self, user_id: &str, handle: &ConnHandle) {
        for message in self.registry.flush(user_id) {
            if !handle.send_frame(message.to_string()) {
                // Connection died mid-flush; requeue the remainder.
                self.registry.enqueue(user_id, message);
            }
        }
    }

    /// Consume parsed action calls from the upstream link until it is
    /// torn down.
    pub async fn run_upstream_loop(self, mut rx: mpsc::UnboundedReceiver<ActionCall>) {
        while let Some(call) = rx.recv().await {
            self.handle_action(call);
        }
    }

    /// Handle one action call from the bot backend.
    ///
    /// Only the two message-delivery actions are recognized; anything
    /// else is logged and dropped. Echoed calls always get an
    /// acknowledgement, even on failure.
    pub fn handle_action(&self, call: ActionCall) {
        if call.action != ACTION_SEND_PRIVATE_MSG && call.action != ACTION_SEND_MSG {
            tracing::debug!(action = %call.action, "ignoring unhandled action");
            return;
        }
        let echo = call.echo.clone();
        let user_id = match call.user_id() {
            Some(id) => id,
            None => {
                tracing::warn!(action = %call.action, "action call without user_id");
                if let Some(echo) = echo {
                    self.upstream.send_response(&ActionResponse::failed(
                        retcodes::INVALID_PARAMS,
                        "user_id is required",
                        echo,
                    ));
                }
                return;
            }
        };

        let text = extract_message_text(&call.params);
        let reply = ClientFrame::reply(&user_id, text);
        match encode_client_frame(&reply) {
            Ok(json) => self.route_reply(&user_id, &reply, json),
            Err(e) => {
                tracing::error!(user_id, "failed to encode reply: {e}");
                if let Some(echo) = echo {
                    self.upstream.send_response(&ActionResponse::failed(
                        retcodes::INTERNAL_ERROR,
                        e.to_string(),
                        echo,
                    ));
                }
                return;
            }
        }

        if let Some(echo) = echo {
            // Enqueueing for an offline user counts as delivered on the
            // ack: downstream presence is not an upstream protocol error.
            self.upstream
                .send_response(&ActionResponse::ok(synthetic_message_id(), true, echo));
        }
    }

    /// Deliver a reply envelope live or queue it, and settle any
    /// synchronous wait for the user.
    fn route_reply(&self, user_id: &str, reply: &ClientFrame, json: String) {
        let reply_value = serde_json::to_value(reply).unwrap_or(Value::Null);
        // Waiting integration callers observe the reply whether or not
        // the user is connected.
        self.correlator.deliver(user_id, reply_value.clone());

        let live = match self.registry.handle_for(user_id) {
            Some(handle) => handle.send_frame(json),
            None => false,
        };
        if live {
            tracing::debug!(user_id, "delivered reply");
        } else {
            self.registry.enqueue(user_id, reply_value);
            tracing::debug!(user_id, "queued reply for offline user");
        }
    }

    /// Send a message to the bot backend on behalf of a user, initiated
    /// by a server-to-server integration rather than a client socket.
    pub fn send_from_integration(
        &self,
        integration_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<(), GatewayError> {
        if user_id.is_empty() {
            return Err(GatewayError::MissingUserId);
        }
        if text.is_empty() {
            return Err(GatewayError::MalformedFrame("message is required".into()));
        }
        let session_tag = if integration_id.is_empty() {
            INTEGRATION_SESSION_TAG.to_string()
        } else {
            format!("{INTEGRATION_SESSION_TAG}:{integration_id}")
        };
        self.registry.record_inbound(user_id, text, &session_tag);
        self.upstream.send_message(user_id, text)
    }

    /// Send on behalf of a user and wait for the next reply addressed
    /// to them. The wait is registered before the send so a fast reply
    /// cannot slip past, and rejected if the send fails.
    pub async fn request_reply_from_integration(
        &self,
        integration_id: &str,
        user_id: &str,
        text: &str,
        request_id: &str,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let rx = self.correlator.register(user_id, request_id, timeout)?;
        if let Err(e) = self.send_from_integration(integration_id, user_id, text) {
            self.correlator
                .reject_by_request_id(request_id, e.clone());
            return Err(e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    /// Idempotent variant of [`send_from_integration`]: duplicate keys
    /// within the ttl replay the stored response.
    pub async fn send_idempotent(
        &self,
        integration_id: &str,
        user_id: &str,
        text: &str,
        idempotency_key: &str,
    ) -> (CacheOutcome, StoredResponse) {
        let key = self.cache_key(integration_id, "send", idempotency_key);
        let user = user_id.to_string();
        self.idempotency
            .run(&key, self.idempotency_ttl, async {
                Ok(match self.send_from_integration(integration_id, user_id, text) {
                    Ok(()) => StoredResponse::ok(json!({"status": "ok", "user_id": user})),
                    Err(e) => StoredResponse::failed(status_for(&e), &e.to_string(), None),
                })
            })
            .await
    }

    /// Idempotent variant of [`request_reply_from_integration`].
    #[allow(clippy::too_many_arguments)]
    pub async fn request_reply_idempotent(
        &self,
        integration_id: &str,
        user_id: &str,
        text: &str,
        request_id: &str,
        timeout: Duration,
        idempotency_key: &str,
    ) -> (CacheOutcome, StoredResponse) {
        let key = self.cache_key(integration_id, "reply", idempotency_key);
        self.idempotency
            .run(&key, self.idempotency_ttl, async {
                Ok(
                    match self
                        .request_reply_from_integration(
                            integration_id,
                            user_id,
                            text,
                            request_id,
                            timeout,
                        )
                        .await
                    {
                        Ok(reply) => {
                            StoredResponse::ok(json!({"status": "ok", "data": reply}))
                        }
                        Err(e) => StoredResponse::failed(status_for(&e), &e.to_string(), None),
                    },
                )
            })
            .await
    }

    fn cache_key(&self, integration_id: &str, route: &str, idempotency_key: &str) -> String {
        if idempotency_key.is_empty() {
            return String::new();
        }
        format!("integrations:{integration_id}:{route}:{idempotency_key}")
    }

    fn send_error(&self, handle: &ConnHandle, error: &GatewayError) {
        let frame = match error {
            GatewayError::ServiceUnavailable => {
                ClientFrame::service_unavailable(error.to_string())
            }
            other => ClientFrame::error(other.to_string()),
        };
        if let Ok(json) = encode_client_frame(&frame) {
            handle.send_frame(json);
        }
    }

    pub fn status(&self) -> GatewayStatus {
        let sessions = self.registry.list_all();
        GatewayStatus {
            sessions: sessions.len(),
            online: sessions.iter().filter(|s| s.online).count(),
            queued_messages: sessions.iter().map(|s| s.queue_size).sum(),
            dropped_messages: self.registry.dropped_messages(),
            pending_waits: self.correlator.pending_count(),
            idempotency_entries: self.idempotency.entry_count(),
            upstream: self.upstream.status(),
        }
    }
}

fn status_for(error: &GatewayError) -> u16 {
    match error {
        GatewayError::Timeout => 504,
        GatewayError::ServiceUnavailable | GatewayError::Send(_) => 503,
        GatewayError::InvalidUserId
        | GatewayError::MissingUserId
        | GatewayError::MissingRequestId
        | GatewayError::MalformedFrame(_) => 400,
        GatewayError::PersistenceCorrupt(_) => 500,
    }
}
