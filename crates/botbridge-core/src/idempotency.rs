use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::error::GatewayError;

/// Stored outcome of an idempotent operation: an HTTP-ish status code
/// plus a JSON body, replayed verbatim to duplicate callers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Value,
}

impl StoredResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn failed(status: u16, error: &str, extra: Option<Value>) -> Self {
        let mut body = json!({"status": "failed", "error": error});
        if let Some(Value::Object(map)) = extra {
            for (k, v) in map {
                body[k] = v;
            }
        }
        Self { status, body }
    }
}

/// How a call was served relative to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Miss,
    Hit,
    Inflight,
}

enum Entry {
    Pending {
        rx: watch::Receiver<Option<StoredResponse>>,
        expires_at: i64,
    },
    Done {
        value: StoredResponse,
        expires_at: i64,
    },
}

impl Entry {
    fn expires_at(&self) -> i64 {
        match self {
            Entry::Pending { expires_at, .. } | Entry::Done { expires_at, .. } => *expires_at,
        }
    }
}

enum Claim {
    Hit(StoredResponse),
    Inflight(watch::Receiver<Option<StoredResponse>>),
    Run(watch::Sender<Option<StoredResponse>>),
}

/// At-most-once execution per key within a ttl window.
///
/// Every caller for a key observes the one execution's result:
/// duplicates arriving mid-flight await its settlement, duplicates
/// arriving after it replay the cached value. A failed execution is
/// cached like a success and not retried until the ttl expires.
#[derive(Clone, Default)]
pub struct IdempotencyCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` under `key`, or observe a prior run. An empty key
    /// bypasses the cache entirely.
    pub async fn run<F>(&self, key: &str, ttl: Duration, op: F) -> (CacheOutcome, StoredResponse)
    where
        F: Future<Output = Result<StoredResponse, GatewayError>>,
    {
        if key.is_empty() {
            return (CacheOutcome::Miss, settle(op.await));
        }
        let now = Utc::now().timestamp_millis();
        let expires_at = now + (ttl.as_millis() as i64).max(1);

        let claim = {
            let mut entries = self.inner.lock().expect("idempotency lock");
            entries.retain(|_, e| e.expires_at() > now);
            match entries.get(key) {
                Some(Entry::Done { value, .. }) => Claim::Hit(value.clone()),
                Some(Entry::Pending { rx, .. }) => Claim::Inflight(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(key.to_string(), Entry::Pending { rx, expires_at });
                    Claim::Run(tx)
                }
            }
        };

        match claim {
            Claim::Hit(value) => (CacheOutcome::Hit, value),
            Claim::Inflight(mut rx) => {
                loop {
                    if let Some(value) = rx.borrow().clone() {
                        return (CacheOutcome::Inflight, value);
                    }
                    if rx.changed().await.is_err() {
                        // The executing caller was cancelled before
                        // settling; its entry ages out with the ttl.
                        return (
                            CacheOutcome::Inflight,
                            StoredResponse::failed(503, "service_unavailable", None),
                        );
                    }
                }
            }
            Claim::Run(tx) => {
                let value = settle(op.await);
                {
                    // The ttl window starts when the result lands, not
                    // when the claim was taken.
                    let expires_at =
                        Utc::now().timestamp_millis() + (ttl.as_millis() as i64).max(1);
                    let mut entries = self.inner.lock().expect("idempotency lock");
                    entries.insert(
                        key.to_string(),
                        Entry::Done {
                            value: value.clone(),
                            expires_at,
                        },
                    );
                }
                let _ = tx.send(Some(value.clone()));
                (CacheOutcome::Miss, value)
            }
        }
    }

    /// Count of live entries, for observability.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().expect("idempotency lock").len()
    }
}

/// Convert an operation failure into a well-formed cached result.
fn settle(result: Result<StoredResponse, GatewayError>) -> StoredResponse {
    match result {
        Ok(value) => value,
        Err(e) => StoredResponse::failed(503, &e.to_string(), None),
    }
}
