use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::GatewayError;

const DEFAULT_WAIT: Duration = Duration::from_secs(15);

struct Waiter {
    tx: oneshot::Sender<Result<Value, GatewayError>>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    /// request id → pending wait.
    waiters: HashMap<String, Waiter>,
    /// Per-user FIFO of outstanding request ids. Correlation is
    /// positional: the next reply for a user resolves the oldest wait.
    user_queues: HashMap<String, VecDeque<String>>,
}

/// Matches a synchronous "send and wait" caller to the next inbound
/// reply addressed to the same user.
///
/// The bot wire protocol carries no caller correlation id on replies,
/// so concurrent waits for one user are served strictly in
/// registration order. Integration callers that need content-based
/// matching must keep at most one wait outstanding per user.
#[derive(Clone, Default)]
pub struct ReplyCorrelator {
    inner: Arc<Mutex<Inner>>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for the next reply to `user_id`. Resolves with
    /// the reply payload, or `Timeout` once `timeout` elapses.
    pub fn register(
        &self,
        user_id: &str,
        request_id: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Value, GatewayError>>, GatewayError> {
        if request_id.is_empty() {
            return Err(GatewayError::MissingRequestId);
        }
        let timeout = if timeout.is_zero() { DEFAULT_WAIT } else { timeout };
        let (tx, rx) = oneshot::channel();

        let timer = {
            let correlator = self.clone();
            let rid = request_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                correlator.reject_by_request_id(&rid, GatewayError::Timeout);
            })
        };

        let mut inner = self.inner.lock().expect("correlator lock");
        inner
            .waiters
            .insert(request_id.to_string(), Waiter { tx, timer });
        inner
            .user_queues
            .entry(user_id.to_string())
            .or_default()
            .push_back(request_id.to_string());
        Ok(rx)
    }

    /// Resolve the oldest wait for `user_id` with `payload`, stamping
    /// the request id into the payload metadata (best-effort; the
    /// payload shape may vary). Returns the consumed request id, which
    /// may belong to an already-settled wait.
    pub fn deliver(&self, user_id: &str, payload: Value) -> Option<String> {
        let mut inner = self.inner.lock().expect("correlator lock");
        let request_id = {
            let queue = inner.user_queues.get_mut(user_id)?;
            let rid = queue.pop_front()?;
            if queue.is_empty() {
                inner.user_queues.remove(user_id);
            }
            rid
        };
        let waiter = match inner.waiters.remove(&request_id) {
            Some(w) => w,
            // Already timed out or rejected; the FIFO slot is still consumed.
            None => return Some(request_id),
        };
        drop(inner);

        waiter.timer.abort();
        let mut payload = payload;
        stamp_request_id(&mut payload, &request_id);
        // The receiver may have been dropped; resolving is single-shot
        // by construction, so this is a safe no-op.
        let _ = waiter.tx.send(Ok(payload));
        Some(request_id)
    }

    /// Out-of-band failure path: reject a wait whose originating send
    /// failed before any reply could arrive.
    pub fn reject_by_request_id(&self, request_id: &str, error: GatewayError) -> bool {
        let mut inner = self.inner.lock().expect("correlator lock");
        let waiter = match inner.waiters.remove(request_id) {
            Some(w) => w,
            None => return false,
        };
        let mut emptied_user = None;
        for (user_id, queue) in inner.user_queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|rid| rid == request_id) {
                queue.remove(pos);
                if queue.is_empty() {
                    emptied_user = Some(user_id.clone());
                }
                break;
            }
        }
        if let Some(user_id) = emptied_user {
            inner.user_queues.remove(&user_id);
        }
        drop(inner);

        waiter.timer.abort();
        let _ = waiter.tx.send(Err(error));
        true
    }

    /// Count of outstanding waits, for observability.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("correlator lock").waiters.len()
    }
}

/// Stamp `request_id` into `payload.metadata.request_id` when the
/// payload has the client reply envelope shape.
fn stamp_request_id(payload: &mut Value, request_id: &str) {
    if let Some(meta) = payload
        .pointer_mut("/payload/metadata")
        .and_then(Value::as_object_mut)
    {
        meta.insert("request_id".into(), Value::String(request_id.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply_payload(user_id: &str) -> Value {
        json!({
            "event": "message_reply",
            "payload": {
                "text": "hi",
                "metadata": {"user_id": user_id, "session_id": "bot-reply"}
            }
        })
    }

    #[tokio::test]
    async fn deliver_resolves_with_stamped_request_id() {
        let correlator = ReplyCorrelator::new();
        let rx = correlator
            .register("u1", "r1", Duration::from_secs(5))
            .unwrap();
        let consumed = correlator.deliver("u1", reply_payload("u1"));
        assert_eq!(consumed.as_deref(), Some("r1"));

        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved["payload"]["metadata"]["request_id"], "r1");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_rejects_with_timeout() {
        let correlator = ReplyCorrelator::new();
        let rx = correlator
            .register("u1", "r1", Duration::from_millis(20))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rx.await.unwrap(), Err(GatewayError::Timeout));
        // The timed-out wait left no trace; a later reply is ignored.
        assert_eq!(correlator.deliver("u1", reply_payload("u1")), None);
    }

    #[tokio::test]
    async fn concurrent_waits_resolve_in_registration_order() {
        let correlator = ReplyCorrelator::new();
        let rx_a = correlator
            .register("u1", "r-A", Duration::from_secs(5))
            .unwrap();
        let rx_b = correlator
            .register("u1", "r-B", Duration::from_secs(5))
            .unwrap();

        correlator.deliver("u1", reply_payload("u1"));
        correlator.deliver("u1", reply_payload("u1"));

        let first = rx_a.await.unwrap().unwrap();
        let second = rx_b.await.unwrap().unwrap();
        assert_eq!(first["payload"]["metadata"]["request_id"], "r-A");
        assert_eq!(second["payload"]["metadata"]["request_id"], "r-B");
    }

    #[tokio::test]
    async fn explicit_reject_removes_fifo_slot() {
        let correlator = ReplyCorrelator::new();
        let rx = correlator
            .register("u1", "r1", Duration::from_secs(5))
            .unwrap();
        assert!(correlator.reject_by_request_id("r1", GatewayError::ServiceUnavailable));
        assert_eq!(rx.await.unwrap(), Err(GatewayError::ServiceUnavailable));
        // The FIFO no longer references the rejected wait.
        assert_eq!(correlator.deliver("u1", reply_payload("u1")), None);
    }

    #[tokio::test]
    async fn empty_request_id_fails_immediately() {
        let correlator = ReplyCorrelator::new();
        let err = correlator
            .register("u1", "", Duration::from_secs(5))
            .err()
            .unwrap();
        assert_eq!(err, GatewayError::MissingRequestId);
    }

    #[tokio::test]
    async fn rejecting_later_wait_preserves_earlier_order() {
        let correlator = ReplyCorrelator::new();
        let rx_a = correlator
            .register("u1", "r-A", Duration::from_secs(5))
            .unwrap();
        let _rx_b = correlator
            .register("u1", "r-B", Duration::from_secs(5))
            .unwrap();
        assert!(correlator.reject_by_request_id("r-B", GatewayError::ServiceUnavailable));
        // r-A is still first in line for the next reply.
        correlator.deliver("u1", reply_payload("u1"));
        assert!(rx_a.await.unwrap().is_ok());
    }
}
