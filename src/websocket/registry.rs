//! Live WebSocket session tracking.
//!
//! # Responsibilities
//! - Generate unique session IDs
//! - Record how each session is being served (claimed, bridged, raw)
//! - Let the management surface list sessions and close one, or all of them

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::model::now_millis;
use crate::websocket::SessionInfo;

/// Relaxed ordering is enough; only uniqueness matters.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// Who is answering a session's messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SessionMode {
    Pending,
    Claimed { injector: String },
    Bridged { upstream: String },
    Raw,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub url: String,
    pub target: String,
    pub started: u64,
    #[serde(flatten)]
    pub mode: SessionMode,
}

struct SessionEntry {
    info: SessionInfo,
    started: u64,
    mode: SessionMode,
    close: watch::Sender<bool>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. The guard removes it again when dropped; its
    /// receiver flips to `true` when the session is asked to close.
    pub fn register(self: &Arc<Self>, info: SessionInfo) -> SessionGuard {
        let (close_tx, close_rx) = watch::channel(false);
        let id = info.id.clone();
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                info,
                started: now_millis(),
                mode: SessionMode::Pending,
                close: close_tx,
            },
        );
        SessionGuard {
            registry: Arc::clone(self),
            id,
            closed: close_rx,
        }
    }

    pub fn set_mode(&self, id: &str, mode: SessionMode) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.mode = mode;
        }
    }

    /// Ask one session to close (tear down its bridge). False if it is unknown.
    pub fn dispose(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                let _ = entry.close.send(true);
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&self) {
        for entry in self.sessions.iter() {
            let _ = entry.close.send(true);
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                id: entry.info.id.clone(),
                url: entry.info.url.clone(),
                target: entry.info.target.clone(),
                started: entry.started,
                mode: entry.mode.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Keeps a session registered for as long as it lives.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: String,
    closed: watch::Receiver<bool>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_mode(&self, mode: SessionMode) {
        self.registry.set_mode(&self.id, mode);
    }

    /// Resolves once the session has been asked to close.
    pub async fn closed(&mut self) {
        let _ = self.closed.wait_for(|closed| *closed).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.id);
    }
}
