use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
const INBOUND_TEXT_CAP: usize = 200;
/// Offline-for-less-than-this sessions are still worth persisting.
const PERSIST_ACTIVE_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Frames pushed down a live client connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// Handle to one live client connection.
///
/// Owned by at most one session at a time; compared by id only. The
/// registry never owns the socket itself, only this sender half.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Queue a text frame for this connection. Returns false if the
    /// connection task is already gone.
    pub fn send_frame(&self, json: String) -> bool {
        self.tx.send(Outbound::Frame(json)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

struct Session {
    user_id: String,
    handle: Option<ConnHandle>,
    queue: VecDeque<Value>,
    /// Unix millis of most recent registration or inbound activity.
    last_active: i64,
    last_message_text: String,
    last_message_at: i64,
    last_session_tag: String,
}

impl Session {
    fn new(user_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            handle: None,
            queue: VecDeque::new(),
            last_active: now,
            last_message_text: String::new(),
            last_message_at: 0,
            last_session_tag: String::new(),
        }
    }
}

/// Observability snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub online: bool,
    pub queue_size: usize,
    pub last_active: i64,
    pub last_message_text: String,
    pub last_message_at: i64,
    pub last_session_tag: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    user_id: String,
    #[serde(default)]
    queue: Vec<Value>,
    #[serde(default)]
    last_active: i64,
    #[serde(default)]
    last_message_text: String,
    #[serde(default)]
    last_message_at: i64,
    #[serde(default)]
    last_session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    schema_version: u32,
    saved_at: i64,
    sessions: Vec<PersistedSession>,
}

struct Inner {
    sessions: HashMap<String, Session>,
    /// Reverse lookup, kept consistent with `Session::handle` by the
    /// registry's own operations only.
    conn_to_user: HashMap<Uuid, String>,
    dropped_messages: u64,
}

/// Per-user session store: connection binding, offline queue,
/// activity metadata, durable snapshot.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    max_queue_per_user: usize,
    max_sessions: usize,
    offline_ttl: Duration,
    data_file: PathBuf,
}

impl SessionRegistry {
    /// Create a registry and load the durable snapshot if present.
    /// A corrupt snapshot is quarantined and startup continues empty.
    pub fn new(config: &GatewayConfig) -> Self {
        let registry = Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                conn_to_user: HashMap::new(),
                dropped_messages: 0,
            }),
            max_queue_per_user: config.max_queue_per_user.max(1),
            max_sessions: config.max_sessions.max(1),
            offline_ttl: config.offline_ttl,
            data_file: config.data_file.clone(),
        };
        if let Err(e) = registry.load() {
            tracing::error!("failed to load session snapshot: {e}");
        }
        registry
    }

    /// Bind a connection to a user, creating the session if absent.
    /// A previous binding for the same user is unbound first; the last
    /// registration wins residency.
    pub fn register(&self, user_id: &str, handle: ConnHandle) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("registry lock");
        if !inner.sessions.contains_key(user_id) {
            inner.ensure_capacity(self.max_sessions);
            inner
                .sessions
                .insert(user_id.to_string(), Session::new(user_id, now));
            tracing::info!(user_id, "created session");
        }
        let old_conn = {
            let session = inner.sessions.get_mut(user_id).expect("just inserted");
            let old = session
                .handle
                .as_ref()
                .filter(|old| old.id != handle.id)
                .map(|old| old.id);
            session.handle = Some(handle.clone());
            session.last_active = now;
            old
        };
        if let Some(old_id) = old_conn {
            inner.conn_to_user.remove(&old_id);
        }
        inner.conn_to_user.insert(handle.id, user_id.to_string());
    }

    /// Record the most recent inbound message summary for a user,
    /// creating the session if absent.
    pub fn record_inbound(&self, user_id: &str, text: &str, session_tag: &str) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("registry lock");
        if !inner.sessions.contains_key(user_id) {
            inner.ensure_capacity(self.max_sessions);
            inner
                .sessions
                .insert(user_id.to_string(), Session::new(user_id, now));
        }
        let session = inner.sessions.get_mut(user_id).expect("just inserted");
        session.last_message_text = truncate_chars(text, INBOUND_TEXT_CAP);
        session.last_message_at = now;
        session.last_session_tag = session_tag.to_string();
        session.last_active = now;
    }

    /// Append a message to the user's offline queue, creating the
    /// session if absent. Oldest entries are dropped past the cap and
    /// counted.
    pub fn enqueue(&self, user_id: &str, message: Value) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("registry lock");
        if !inner.sessions.contains_key(user_id) {
            inner.ensure_capacity(self.max_sessions);
            inner
                .sessions
                .insert(user_id.to_string(), Session::new(user_id, now));
        }
        let max_queue = self.max_queue_per_user;
        let session = inner.sessions.get_mut(user_id).expect("just inserted");
        session.queue.push_back(message);
        let mut overflow = 0u64;
        while session.queue.len() > max_queue {
            session.queue.pop_front();
            overflow += 1;
        }
        let queue_len = session.queue.len();
        inner.dropped_messages += overflow;
        tracing::debug!(user_id, queue = queue_len, dropped = overflow, "queued message");
    }

    /// Atomically take and clear the user's queue. Empty if the user
    /// is unknown or has nothing pending.
    pub fn flush(&self, user_id: &str) -> Vec<Value> {
        let mut inner = self.inner.lock().expect("registry lock");
        match inner.sessions.get_mut(user_id) {
            Some(session) if !session.queue.is_empty() => {
                let pending: Vec<Value> = session.queue.drain(..).collect();
                tracing::debug!(user_id, count = pending.len(), "flushed queue");
                pending
            }
            _ => Vec::new(),
        }
    }

    /// The live connection handle for a user, if any.
    pub fn handle_for(&self, user_id: &str) -> Option<ConnHandle> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .sessions
            .get(user_id)
            .and_then(|s| s.handle.clone())
    }

    /// Mark the session owning this connection as offline. Session and
    /// queue are kept.
    pub fn disconnect_conn(&self, conn_id: Uuid) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(user_id) = inner.conn_to_user.remove(&conn_id) {
            if let Some(session) = inner.sessions.get_mut(&user_id) {
                // A newer connection may already own the session.
                if session.handle.as_ref().is_some_and(|h| h.id == conn_id) {
                    session.handle = None;
                    session.last_active = Utc::now().timestamp_millis();
                    tracing::info!(user_id, "session went offline");
                }
            }
        }
    }

    /// Administrative kick: close the bound connection and mark the
    /// session offline. Session and queue are kept.
    pub fn kick(&self, user_id: &str) {
        let mut guard = self.inner.lock().expect("registry lock");
        let inner = &mut *guard;
        if let Some(session) = inner.sessions.get_mut(user_id) {
            if let Some(handle) = session.handle.take() {
                handle.close();
                inner.conn_to_user.remove(&handle.id);
            }
            session.last_active = Utc::now().timestamp_millis();
            tracing::info!(user_id, "kicked session offline");
        }
    }

    /// Remove a session and its reverse mapping entirely.
    pub fn destroy(&self, user_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.destroy(user_id);
    }

    /// Snapshot for observability collaborators.
    pub fn list_all(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .sessions
            .values()
            .map(|s| SessionInfo {
                user_id: s.user_id.clone(),
                online: s.handle.is_some(),
                queue_size: s.queue.len(),
                last_active: s.last_active,
                last_message_text: s.last_message_text.clone(),
                last_message_at: s.last_message_at,
                last_session_tag: s.last_session_tag.clone(),
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().expect("registry lock").sessions.len()
    }

    /// Cumulative count of queue entries dropped on overflow.
    pub fn dropped_messages(&self) -> u64 {
        self.inner.lock().expect("registry lock").dropped_messages
    }

    /// Destroy sessions that are offline, have an empty queue, and
    /// have been idle longer than the offline ttl.
    pub fn sweep_idle(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = self.offline_ttl.as_millis() as i64;
        let mut inner = self.inner.lock().expect("registry lock");
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| {
                s.handle.is_none() && s.queue.is_empty() && now - s.last_active > ttl_ms
            })
            .map(|s| s.user_id.clone())
            .collect();
        for user_id in &expired {
            inner.destroy(user_id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "swept idle sessions");
        }
        expired.len()
    }

    /// Serialize sessions worth keeping (non-empty queue or active in
    /// the last 24 h) and atomically replace the durable file.
    pub fn save(&self) -> std::io::Result<usize> {
        let now = Utc::now().timestamp_millis();
        let doc = {
            let inner = self.inner.lock().expect("registry lock");
            let sessions: Vec<PersistedSession> = inner
                .sessions
                .values()
                .filter(|s| !s.queue.is_empty() || now - s.last_active < PERSIST_ACTIVE_WINDOW_MS)
                .map(|s| PersistedSession {
                    user_id: s.user_id.clone(),
                    queue: s.queue.iter().cloned().collect(),
                    last_active: s.last_active,
                    last_message_text: s.last_message_text.clone(),
                    last_message_at: s.last_message_at,
                    last_session_id: s.last_session_tag.clone(),
                })
                .collect();
            SnapshotDoc {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                saved_at: now,
                sessions,
            }
        };
        if let Some(dir) = self.data_file.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.data_file.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.data_file)?;
        tracing::info!(
            count = doc.sessions.len(),
            path = %self.data_file.display(),
            "saved session snapshot"
        );
        Ok(doc.sessions.len())
    }

    /// Load the durable snapshot. A file that fails to parse is moved
    /// aside under a `.bad.<millis>.json` name and the registry starts
    /// empty.
    fn load(&self) -> Result<(), GatewayError> {
        if !self.data_file.exists() {
            return Ok(());
        }
        let data = fs::read_to_string(&self.data_file)
            .map_err(|e| GatewayError::PersistenceCorrupt(e.to_string()))?;
        let sessions = match parse_snapshot(&data) {
            Ok(sessions) => sessions,
            Err(e) => {
                let quarantine = quarantine_path(&self.data_file);
                if let Err(rename_err) = fs::rename(&self.data_file, &quarantine) {
                    tracing::error!("failed to quarantine corrupt snapshot: {rename_err}");
                }
                tracing::error!(
                    moved_to = %quarantine.display(),
                    "session snapshot invalid, moved aside"
                );
                return Err(GatewayError::PersistenceCorrupt(e.to_string()));
            }
        };
        let count = sessions.len();
        let mut inner = self.inner.lock().expect("registry lock");
        for p in sessions {
            if p.user_id.is_empty() {
                continue;
            }
            // Reloaded sessions always start offline.
            let mut session = Session::new(&p.user_id, p.last_active);
            session.queue = p.queue.into();
            session.last_message_text = p.last_message_text;
            session.last_message_at = p.last_message_at;
            session.last_session_tag = p.last_session_id;
            inner.sessions.insert(p.user_id.clone(), session);
        }
        tracing::info!(count, "loaded session snapshot");
        Ok(())
    }
}

impl Inner {
    fn destroy(&mut self, user_id: &str) {
        if let Some(session) = self.sessions.remove(user_id) {
            if let Some(handle) = session.handle {
                self.conn_to_user.remove(&handle.id);
            }
            tracing::info!(user_id, "destroyed session");
        }
    }

    /// Evict lowest-ranked sessions until under capacity: offline
    /// first, then emptiest queue, then oldest idle.
    fn ensure_capacity(&mut self, max_sessions: usize) {
        if self.sessions.len() < max_sessions {
            return;
        }
        let mut candidates: Vec<(bool, usize, i64, String)> = self
            .sessions
            .values()
            .map(|s| {
                (
                    s.handle.is_some(),
                    s.queue.len(),
                    s.last_active,
                    s.user_id.clone(),
                )
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        let mut victims = candidates.into_iter();
        while self.sessions.len() >= max_sessions {
            match victims.next() {
                Some((_, _, _, user_id)) => {
                    tracing::warn!(user_id, "evicting session at capacity");
                    self.destroy(&user_id);
                }
                None => break,
            }
        }
    }
}

fn parse_snapshot(data: &str) -> Result<Vec<PersistedSession>, serde_json::Error> {
    // Current schema is a versioned document; a bare array is the
    // pre-versioned layout and still accepted.
    match serde_json::from_str::<SnapshotDoc>(data) {
        Ok(doc) => Ok(doc.sessions),
        Err(_) => serde_json::from_str::<Vec<PersistedSession>>(data),
    }
}

fn quarantine_path(data_file: &Path) -> PathBuf {
    let stem = data_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sessions".into());
    let name = format!("{stem}.bad.{}.json", Utc::now().timestamp_millis());
    data_file.with_file_name(name)
}

fn truncate_chars(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}
