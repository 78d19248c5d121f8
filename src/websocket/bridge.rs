//! Upstream WebSocket bridge.
//!
//! # States
//! ```text
//! Connecting ──ok──→ Open ──close──→ Closed ──delay──→ Connecting …
//!     │                │                │
//!     └────────────── abort / client gone ──────────→ TornDown
//! ```
//!
//! # Design Decisions
//! - One task owns the buffer and the upstream socket; no locks
//! - Client messages are buffered with their arrival time whenever the
//!   upstream is not open or older messages are still queued
//! - Buffered messages are released in order, spaced by their original
//!   arrival deltas; an empty buffer means new messages go out at once
//! - A failed send puts the message back at the front and closes the phase
//! - Upstream errors are reported; only a close ends the open phase

use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::events::EventBus;
use crate::observability::metrics;

const SOURCE: &str = "websocket";

/// One WebSocket data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Text as-is, binary as base64, for events.
    pub fn describe(&self) -> String {
        match self {
            Frame::Text(text) => text.clone(),
            Frame::Binary(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    fn into_upstream(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        }
    }

    fn from_upstream(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Frame::Text(text.as_str().to_string())),
            Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Open,
    Closed,
    TornDown,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub upstream_url: String,
    pub client_id: String,
    pub reconnect_delay: Duration,
}

/// Handle on a running bridge task.
pub struct Bridge {
    abort: watch::Sender<bool>,
    state: watch::Receiver<BridgeState>,
    task: JoinHandle<()>,
}

impl Bridge {
    /// Start bridging. `outbound` carries client messages, `inbound` receives
    /// upstream messages for the client.
    pub fn spawn(
        config: BridgeConfig,
        outbound: mpsc::UnboundedReceiver<Frame>,
        inbound: mpsc::UnboundedSender<Frame>,
        bus: EventBus,
    ) -> Self {
        let (abort_tx, abort_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(BridgeState::Connecting);

        let engine = Engine {
            config,
            outbound,
            inbound,
            abort: abort_rx,
            state: state_tx,
            buffer: VecDeque::new(),
            bus,
        };
        let task = tokio::spawn(engine.run());

        Self {
            abort: abort_tx,
            state: state_rx,
            task,
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Wait until the bridge reaches `state`.
    pub async fn wait_for(&mut self, state: BridgeState) -> bool {
        self.state.wait_for(|s| *s == state).await.is_ok()
    }

    /// Tear down: cancel any pending reconnect and close the upstream socket.
    pub fn abort(&self) {
        let _ = self.abort.send(true);
    }

    /// Tear down and wait for the task to finish.
    pub async fn shutdown(self) {
        self.abort();
        let _ = self.task.await;
    }
}

/// Why a phase ended.
enum Exit {
    Retry,
    TearDown,
}

struct Engine {
    config: BridgeConfig,
    outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<Frame>,
    abort: watch::Receiver<bool>,
    state: watch::Sender<BridgeState>,
    buffer: VecDeque<(Instant, Frame)>,
    bus: EventBus,
}

impl Engine {
    async fn run(mut self) {
        loop {
            if *self.abort.borrow() {
                break;
            }
            self.set_state(BridgeState::Connecting);
            let socket = match self.connect().await {
                Ok(Some(socket)) => socket,
                Ok(None) => break,
                Err(()) => {
                    if let Exit::TearDown = self.wait_before_retry().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(BridgeState::Open);
            self.bus.info(
                SOURCE,
                format!("{} connected to {}", self.config.client_id, self.config.upstream_url),
            );
            if let Exit::TearDown = self.pump(socket).await {
                break;
            }

            self.set_state(BridgeState::Closed);
            if let Exit::TearDown = self.wait_before_retry().await {
                break;
            }
        }

        self.set_state(BridgeState::TornDown);
        tracing::debug!(
            client = %self.config.client_id,
            buffered = self.buffer.len(),
            "Bridge torn down"
        );
    }

    fn set_state(&self, state: BridgeState) {
        self.state.send_replace(state);
    }

    fn enqueue(&mut self, frame: Frame) {
        self.buffer.push_back((Instant::now(), frame));
    }

    /// Connect while buffering. `Ok(None)` means tear down.
    async fn connect(
        &mut self,
    ) -> Result<
        Option<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>,
        (),
    > {
        let url = self.config.upstream_url.clone();
        let connect = tokio_tungstenite::connect_async(url);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                changed = self.abort.changed() => {
                    if changed.is_err() || *self.abort.borrow() {
                        return Ok(None);
                    }
                }
                frame = self.outbound.recv() => match frame {
                    Some(frame) => self.enqueue(frame),
                    None => return Ok(None),
                },
                result = &mut connect => match result {
                    Ok((socket, _)) => return Ok(Some(socket)),
                    Err(e) => {
                        tracing::warn!(upstream = %self.config.upstream_url, error = %e, "Upstream WebSocket connect failed");
                        self.bus.error(
                            SOURCE,
                            format!("{}: connect failed: {e}", self.config.upstream_url),
                        );
                        return Err(());
                    }
                },
            }
        }
    }

    /// Run the open phase until the upstream closes or the session ends.
    async fn pump(
        &mut self,
        socket: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ) -> Exit {
        let (mut sink, mut stream) = socket.split();
        let mut next_release = Instant::now();

        loop {
            tokio::select! {
                changed = self.abort.changed() => {
                    if changed.is_err() || *self.abort.borrow() {
                        let _ = sink.close().await;
                        return Exit::TearDown;
                    }
                }
                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        if self.buffer.is_empty() {
                            next_release = Instant::now();
                        }
                        self.enqueue(frame);
                    }
                    None => {
                        let _ = sink.close().await;
                        return Exit::TearDown;
                    }
                },
                _ = tokio::time::sleep_until(next_release), if !self.buffer.is_empty() => {
                    let Some((arrived, frame)) = self.buffer.pop_front() else {
                        continue;
                    };
                    let content = frame.describe();
                    match sink.send(frame.clone().into_upstream()).await {
                        Ok(()) => {
                            metrics::record_ws_message("outbound");
                            self.bus.message(&self.config.client_id, &self.config.upstream_url, content, false);
                            if let Some((next_arrival, _)) = self.buffer.front() {
                                next_release = Instant::now() + next_arrival.saturating_duration_since(arrived);
                            }
                        }
                        Err(e) => {
                            self.buffer.push_front((arrived, frame));
                            self.bus.error(SOURCE, format!("{}: send failed: {e}", self.config.upstream_url));
                            return Exit::Retry;
                        }
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None => return Exit::Retry,
                    Some(Ok(message)) => {
                        if let Some(frame) = Frame::from_upstream(message) {
                            metrics::record_ws_message("inbound");
                            self.bus.message(&self.config.upstream_url, &self.config.client_id, frame.describe(), true);
                            if self.inbound.send(frame).is_err() {
                                let _ = sink.close().await;
                                return Exit::TearDown;
                            }
                        }
                    }
                    Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                        return Exit::Retry;
                    }
                    Some(Err(e)) => {
                        self.bus.error(SOURCE, format!("{}: {e}", self.config.upstream_url));
                    }
                },
            }
        }
    }

    /// Announce the retry and wait, still buffering.
    async fn wait_before_retry(&mut self) -> Exit {
        let delay = self.config.reconnect_delay;
        metrics::record_ws_reconnect();
        self.bus.info(
            SOURCE,
            format!(
                "{} reconnecting to {} in {}ms",
                self.config.client_id,
                self.config.upstream_url,
                delay.as_millis()
            ),
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                changed = self.abort.changed() => {
                    if changed.is_err() || *self.abort.borrow() {
                        return Exit::TearDown;
                    }
                }
                frame = self.outbound.recv() => match frame {
                    Some(frame) => self.enqueue(frame),
                    None => return Exit::TearDown,
                },
                _ = &mut sleep => return Exit::Retry,
            }
        }
    }
}
