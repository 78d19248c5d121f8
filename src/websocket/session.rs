//! Serving one upgraded client socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::config::ServerContext;
use crate::events::Event;
use crate::injectors::{Injector, InjectorChain};
use crate::model::NormalizedRequest;
use crate::observability::metrics;
use crate::websocket::{
    Bridge, BridgeConfig, Frame, SessionGuard, SessionId, SessionInfo, SessionMode,
    SessionRegistry,
};

/// Label used as the peer of raw sessions in message events.
const RAW_PEER: &str = "server";

enum Route {
    Claimed(Arc<dyn Injector>),
    Bridged(String),
    Raw,
}

impl Route {
    fn mode(&self) -> SessionMode {
        match self {
            Route::Claimed(injector) => SessionMode::Claimed {
                injector: injector.name().to_string(),
            },
            Route::Bridged(upstream) => SessionMode::Bridged {
                upstream: upstream.clone(),
            },
            Route::Raw => SessionMode::Raw,
        }
    }
}

/// What a client sent.
enum Incoming {
    Data(Frame),
    Control,
    Closed,
}

fn read_client(message: Option<Result<Message, axum::Error>>) -> Incoming {
    match message {
        Some(Ok(Message::Text(text))) => Incoming::Data(Frame::Text(text.as_str().to_string())),
        Some(Ok(Message::Binary(bytes))) => Incoming::Data(Frame::Binary(bytes.to_vec())),
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Incoming::Control,
        Some(Ok(Message::Close(_))) | None => Incoming::Closed,
        Some(Err(e)) => {
            tracing::debug!(error = %e, "WebSocket client error");
            Incoming::Closed
        }
    }
}

fn to_client(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
    }
}

type ClientSink = SplitSink<WebSocket, Message>;

#[derive(Clone)]
pub struct WebSocketEngine {
    ctx: ServerContext,
    chain: InjectorChain,
    registry: Arc<SessionRegistry>,
}

impl WebSocketEngine {
    pub fn new(ctx: ServerContext, chain: InjectorChain, registry: Arc<SessionRegistry>) -> Self {
        Self {
            ctx,
            chain,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Drive a client socket until it closes or the session is disposed.
    pub async fn serve(&self, socket: WebSocket, request: Arc<NormalizedRequest>) {
        let info = SessionInfo::new(SessionId::new().to_string(), &request.url, &request.target);
        let mut guard = self.registry.register(info.clone());
        self.ctx.bus().emit(Event::UserConnected {
            session: info.id.clone(),
            url: info.url.clone(),
        });
        metrics::ws_session_opened();

        let route = self.route(&info, &request).await;
        guard.set_mode(route.mode());
        tracing::info!(session = %info.id, url = %info.url, mode = ?route.mode(), "WebSocket session opened");

        let (sender, receiver) = socket.split();
        match &route {
            Route::Claimed(injector) => {
                self.serve_claimed(sender, receiver, &info, injector, &mut guard)
                    .await;
                injector.disconnected(&info).await;
            }
            Route::Bridged(upstream) => {
                self.serve_bridged(sender, receiver, &info, upstream, &mut guard)
                    .await;
            }
            Route::Raw => self.serve_raw(receiver, &info, &mut guard).await,
        }

        drop(guard);
        metrics::ws_session_closed();
        self.ctx.bus().emit(Event::UserDisconnected {
            session: info.id.clone(),
        });
        tracing::info!(session = %info.id, "WebSocket session closed");
    }

    /// Claim first, then bridge, then raw.
    async fn route(&self, info: &SessionInfo, request: &NormalizedRequest) -> Route {
        for injector in self.chain.active() {
            if injector.connected(info).await {
                return Route::Claimed(Arc::clone(injector));
            }
        }
        self.chain
            .active()
            .find_map(|injector| injector.websocket_upstream(request))
            .map_or(Route::Raw, Route::Bridged)
    }

    async fn serve_claimed(
        &self,
        mut sender: ClientSink,
        mut receiver: futures_util::stream::SplitStream<WebSocket>,
        info: &SessionInfo,
        injector: &Arc<dyn Injector>,
        guard: &mut SessionGuard,
    ) {
        let bus = self.ctx.bus();
        loop {
            let incoming = tokio::select! {
                _ = guard.closed() => break,
                message = receiver.next() => read_client(message),
            };
            match incoming {
                Incoming::Data(frame) => {
                    let content = frame.describe();
                    bus.message(&info.id, injector.name(), content.as_str(), false);
                    if let Some(reply) = injector.message(info, &content).await {
                        bus.message(injector.name(), &info.id, reply.as_str(), true);
                        if sender.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Incoming::Control => {}
                Incoming::Closed => break,
            }
        }
        let _ = sender.close().await;
    }

    async fn serve_bridged(
        &self,
        mut sender: ClientSink,
        mut receiver: futures_util::stream::SplitStream<WebSocket>,
        info: &SessionInfo,
        upstream: &str,
        guard: &mut SessionGuard,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let bridge = Bridge::spawn(
            BridgeConfig {
                upstream_url: upstream.to_string(),
                client_id: info.id.clone(),
                reconnect_delay: self.ctx.reconnect_delay(),
            },
            out_rx,
            in_tx,
            self.ctx.bus().clone(),
        );

        loop {
            tokio::select! {
                _ = guard.closed() => break,
                message = receiver.next() => match read_client(message) {
                    Incoming::Data(frame) => {
                        if out_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Incoming::Control => {}
                    Incoming::Closed => break,
                },
                frame = in_rx.recv() => match frame {
                    Some(frame) => {
                        if sender.send(to_client(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        bridge.shutdown().await;
        let _ = sender.close().await;
    }

    async fn serve_raw(
        &self,
        mut receiver: futures_util::stream::SplitStream<WebSocket>,
        info: &SessionInfo,
        guard: &mut SessionGuard,
    ) {
        loop {
            let incoming = tokio::select! {
                _ = guard.closed() => break,
                message = receiver.next() => read_client(message),
            };
            match incoming {
                Incoming::Data(frame) => {
                    self.ctx
                        .bus()
                        .message(&info.id, RAW_PEER, frame.describe(), false);
                }
                Incoming::Control => {}
                Incoming::Closed => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injectors::{InjectorError, OptionSet};
    use crate::model::{Answer, Content};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::BTreeMap;

    struct Peer {
        name: &'static str,
        claims: bool,
        upstream: Option<&'static str>,
    }

    #[async_trait]
    impl Injector for Peer {
        fn name(&self) -> &str {
            self.name
        }

        fn is_active(&self) -> bool {
            true
        }

        fn set_active(&self, _active: bool) {}

        async fn handle(&self, _request: &NormalizedRequest) -> Option<Answer> {
            None
        }

        fn options(&self) -> OptionSet {
            OptionSet::new()
        }

        fn set_options(&self, _options: &Map<String, Value>) -> Result<(), InjectorError> {
            Ok(())
        }

        async fn connected(&self, _session: &SessionInfo) -> bool {
            self.claims
        }

        fn websocket_upstream(&self, request: &NormalizedRequest) -> Option<String> {
            self.upstream.map(|base| format!("{base}{}", request.url))
        }
    }

    fn engine(peers: Vec<Peer>) -> WebSocketEngine {
        let chain = InjectorChain::new(
            peers
                .into_iter()
                .map(|p| Arc::new(p) as Arc<dyn Injector>)
                .collect(),
        );
        WebSocketEngine::new(ServerContext::default(), chain, Arc::new(SessionRegistry::new()))
    }

    fn upgrade() -> NormalizedRequest {
        NormalizedRequest {
            url: "/socket".into(),
            target: "/".into(),
            query: BTreeMap::new(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            content: Content::from(""),
        }
    }

    #[tokio::test]
    async fn claim_beats_upstream_even_later_in_chain() {
        let engine = engine(vec![
            Peer { name: "proxy", claims: false, upstream: Some("ws://backend") },
            Peer { name: "script", claims: true, upstream: None },
        ]);
        let info = SessionInfo::new("ws-1", "/socket", "/");
        let mode = engine.route(&info, &upgrade()).await.mode();
        assert_eq!(mode, SessionMode::Claimed { injector: "script".into() });
    }

    #[tokio::test]
    async fn first_upstream_bridges() {
        let engine = engine(vec![
            Peer { name: "json", claims: false, upstream: None },
            Peer { name: "proxy", claims: false, upstream: Some("ws://backend") },
        ]);
        let info = SessionInfo::new("ws-2", "/socket", "/");
        let mode = engine.route(&info, &upgrade()).await.mode();
        assert_eq!(mode, SessionMode::Bridged { upstream: "ws://backend/socket".into() });
    }

    #[tokio::test]
    async fn nobody_interested_means_raw() {
        let engine = engine(vec![Peer { name: "json", claims: false, upstream: None }]);
        let info = SessionInfo::new("ws-3", "/socket", "/");
        assert_eq!(engine.route(&info, &upgrade()).await.mode(), SessionMode::Raw);
    }
}
