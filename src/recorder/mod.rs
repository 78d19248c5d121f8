//! Traffic recorder.
//!
//! # Data Flow
//! ```text
//! EventBus
//!     → request (exchange token, start time) kept as pending
//!     → response | missing with the same token
//!     → hit / miss appended to the bounded logs (log.rs)
//!     → broadcast event for the live feed
//! message events → messages log
//! ```
//!
//! # Design Decisions
//! - Each log has its own capacity; eviction is FIFO
//! - Each entry point is a single append-and-evict under the log's lock
//! - Pairing uses the exchange token, so every exchange is recorded once
//! - The recorder reads the shared broadcast bus: a burst larger than
//!   `event_capacity` makes it lag, and the skipped events are not recorded
//!   (logged as a warning). Size `event_capacity` above the expected burst.
//! - Pending exchanges without a terminal event are dropped after a minute

pub mod log;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RecorderConfig;
use crate::events::{Event, EventBus, ExchangeId, MessageEvent};
use crate::model::{now_millis, Answer, NormalizedRequest};

pub use log::BoundedLog;

/// Pending exchanges older than this are forgotten.
const STALE_PENDING_MS: u64 = 60_000;

/// How often pending exchanges are checked for staleness.
const PENDING_SWEEP: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct RecordedRequest {
    pub id: Uuid,
    pub start: u64,
    pub end: u64,
    pub request: Arc<NormalizedRequest>,
    pub response: Arc<Answer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    pub id: Uuid,
    pub start: u64,
    pub end: u64,
    pub request: Arc<NormalizedRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedMessage {
    pub id: Uuid,
    pub time: u64,
    pub content: String,
    pub from: String,
    pub to: String,
    pub remote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Request,
    Error,
    Message,
}

/// Live-feed notice for a new record; details are fetched by id.
#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub kind: FeedKind,
    pub id: Uuid,
    pub time: u64,
}

pub struct Recorder {
    requests: Mutex<BoundedLog<RecordedRequest>>,
    errors: Mutex<BoundedLog<RecordedError>>,
    messages: Mutex<BoundedLog<RecordedMessage>>,
    bus: EventBus,
}

impl Recorder {
    pub fn new(config: &RecorderConfig, bus: EventBus) -> Self {
        Self {
            requests: Mutex::new(BoundedLog::new(config.max_requests)),
            errors: Mutex::new(BoundedLog::new(config.max_errors)),
            messages: Mutex::new(BoundedLog::new(config.max_messages)),
            bus,
        }
    }

    /// Record an answered exchange.
    pub fn hit(
        &self,
        start: u64,
        end: u64,
        request: Arc<NormalizedRequest>,
        response: Arc<Answer>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.requests
            .lock()
            .expect("recorder mutex poisoned")
            .push(RecordedRequest {
                id,
                start,
                end,
                request,
                response,
            });
        self.announce(FeedKind::Request, id, end);
        id
    }

    /// Record an exchange no injector answered.
    pub fn miss(&self, start: u64, end: u64, request: Arc<NormalizedRequest>) -> Uuid {
        let id = Uuid::new_v4();
        self.errors
            .lock()
            .expect("recorder mutex poisoned")
            .push(RecordedError {
                id,
                start,
                end,
                request,
            });
        self.announce(FeedKind::Error, id, end);
        id
    }

    pub fn message(&self, message: &MessageEvent) -> Uuid {
        let id = Uuid::new_v4();
        self.messages
            .lock()
            .expect("recorder mutex poisoned")
            .push(RecordedMessage {
                id,
                time: message.time,
                content: message.content.clone(),
                from: message.from.clone(),
                to: message.to.clone(),
                remote: message.remote,
            });
        self.announce(FeedKind::Message, id, message.time);
        id
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("recorder mutex poisoned").snapshot()
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        self.errors.lock().expect("recorder mutex poisoned").snapshot()
    }

    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().expect("recorder mutex poisoned").snapshot()
    }

    pub fn find_request(&self, id: Uuid) -> Option<RecordedRequest> {
        self.requests
            .lock()
            .expect("recorder mutex poisoned")
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn find_error(&self, id: Uuid) -> Option<RecordedError> {
        self.errors
            .lock()
            .expect("recorder mutex poisoned")
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn find_message(&self, id: Uuid) -> Option<RecordedMessage> {
        self.messages
            .lock()
            .expect("recorder mutex poisoned")
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn clear(&self) {
        self.requests.lock().expect("recorder mutex poisoned").clear();
        self.errors.lock().expect("recorder mutex poisoned").clear();
        self.messages.lock().expect("recorder mutex poisoned").clear();
    }

    fn announce(&self, kind: FeedKind, id: Uuid, time: u64) {
        self.bus.emit(Event::Broadcast(FeedItem { kind, id, time }));
    }

    /// Subscribe to the bus and record exchanges and messages as they complete.
    pub fn attach(self: &Arc<Self>) -> JoinHandle<()> {
        let recorder = Arc::clone(self);
        let mut rx = self.bus.subscribe();

        tokio::spawn(async move {
            let mut pending: HashMap<ExchangeId, (u64, Arc<NormalizedRequest>)> = HashMap::new();
            let mut sweep = tokio::time::interval_at(
                tokio::time::Instant::now() + PENDING_SWEEP,
                PENDING_SWEEP,
            );
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = sweep.tick() => {
                        forget_stale(&mut pending, now_millis());
                        continue;
                    }
                };
                match event {
                    Ok(Event::Request {
                        exchange,
                        time,
                        request,
                    }) => {
                        pending.insert(exchange, (time, request));
                    }
                    Ok(Event::Response {
                        exchange,
                        time,
                        answer,
                    }) => {
                        if let Some((start, request)) = pending.remove(&exchange) {
                            recorder.hit(start, time, request, answer);
                        }
                    }
                    Ok(Event::Missing { exchange, time }) => {
                        if let Some((start, request)) = pending.remove(&exchange) {
                            recorder.miss(start, time, request);
                        }
                    }
                    Ok(Event::Message(message)) => {
                        recorder.message(&message);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Recorder lagged behind the event bus");
                        forget_stale(&mut pending, now_millis());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn forget_stale(pending: &mut HashMap<ExchangeId, (u64, Arc<NormalizedRequest>)>, now: u64) {
    let before = pending.len();
    pending.retain(|_, (start, _)| now.saturating_sub(*start) < STALE_PENDING_MS);
    if pending.len() < before {
        tracing::debug!(forgotten = before - pending.len(), "Stale pending exchanges dropped");
    }
}
