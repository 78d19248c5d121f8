//! Event bus subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch / injectors / websocket engine / recorder
//!     → EventBus::emit(Event)
//!     → tokio broadcast channel
//!     → subscribers: recorder, event logger, management feed
//! ```
//!
//! # Design Decisions
//! - One typed enum instead of string-named listeners
//! - Request/response pairing uses an exchange token carried by the events
//! - Emitting never blocks and never fails; events without subscribers are dropped
//! - Slow subscribers lag and lose the oldest events rather than stalling traffic

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{now_millis, Answer, NormalizedRequest};
use crate::recorder::FeedItem;

static EXCHANGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Token pairing a `request` event with its terminal `response` or `missing` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ExchangeId(u64);

impl ExchangeId {
    pub fn new() -> Self {
        Self(EXCHANGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ex-{}", self.0)
    }
}

/// A WebSocket message observed by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEvent {
    pub time: u64,
    pub content: String,
    pub from: String,
    pub to: String,
    /// True when the message came from the upstream side.
    pub remote: bool,
}

/// Everything the server reports about the traffic it sees.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Request {
        exchange: ExchangeId,
        time: u64,
        request: Arc<NormalizedRequest>,
    },
    Response {
        exchange: ExchangeId,
        time: u64,
        answer: Arc<Answer>,
    },
    Missing {
        exchange: ExchangeId,
        time: u64,
    },
    Message(MessageEvent),
    Broadcast(FeedItem),
    Error {
        source: String,
        message: String,
    },
    Debug {
        source: String,
        message: String,
    },
    Info {
        source: String,
        message: String,
    },
    Open {
        address: String,
    },
    Close,
    UserConnected {
        session: String,
        url: String,
    },
    UserDisconnected {
        session: String,
    },
    Logged {
        source: String,
        path: String,
    },
}

/// Cloneable handle on the shared broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.emit(Event::Error {
            source: source.to_string(),
            message: message.into(),
        });
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.emit(Event::Info {
            source: source.to_string(),
            message: message.into(),
        });
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.emit(Event::Debug {
            source: source.to_string(),
            message: message.into(),
        });
    }

    pub fn message(&self, from: &str, to: &str, content: impl Into<String>, remote: bool) {
        self.emit(Event::Message(MessageEvent {
            time: now_millis(),
            content: content.into(),
            from: from.to_string(),
            to: to.to_string(),
            remote,
        }));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.info("test", "first");
        bus.error("test", "second");

        match rx.recv().await.unwrap() {
            Event::Info { message, .. } => assert_eq!(message, "first"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Event::Error { message, .. } => assert_eq!(message, "second"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.debug("test", "nobody listens");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_kebab_tags() {
        let json = serde_json::to_value(Event::UserDisconnected {
            session: "ws-1".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "user-disconnected");
        assert_eq!(json["session"], "ws-1");
    }

    #[test]
    fn exchange_ids_are_unique() {
        assert_ne!(ExchangeId::new(), ExchangeId::new());
    }

    #[test]
    fn exchange_events_serialize_shared_payloads() {
        let request = Arc::new(NormalizedRequest {
            url: "/users?page=1".into(),
            target: "/".into(),
            query: Default::default(),
            method: "GET".into(),
            headers: Default::default(),
            content: Default::default(),
        });
        let json = serde_json::to_value(Event::Request {
            exchange: ExchangeId::new(),
            time: 7,
            request,
        })
        .unwrap();
        assert_eq!(json["event"], "request");
        assert_eq!(json["request"]["url"], "/users?page=1");

        let json = serde_json::to_value(Event::Response {
            exchange: ExchangeId::new(),
            time: 8,
            answer: Arc::new(Answer::new(201)),
        })
        .unwrap();
        assert_eq!(json["answer"]["status"]["code"], 201);
    }
}
