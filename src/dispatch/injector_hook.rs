//! The hook that feeds mounted traffic to the injector chain.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::ServerContext;
use crate::dispatch::cors;
use crate::dispatch::hooks::Hook;
use crate::dispatch::mounts::{MountTable, ROOT};
use crate::events::{Event, ExchangeId};
use crate::injectors::InjectorChain;
use crate::model::{now_millis, Answer, NormalizedRequest};
use crate::observability::metrics;
use crate::websocket::WebSocketEngine;

const SOURCE: &str = "dispatch";

pub struct InjectorHook {
    ctx: ServerContext,
    mounts: MountTable,
    chain: InjectorChain,
    engine: WebSocketEngine,
}

impl InjectorHook {
    pub fn new(ctx: ServerContext, chain: InjectorChain, engine: WebSocketEngine) -> Self {
        let mounts = MountTable::from_config(ctx.config());
        Self {
            ctx,
            mounts,
            chain,
            engine,
        }
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    async fn exchange(&self, parts: Parts, body: Body, target: &str) -> Response {
        let started = Instant::now();
        let origin = parts.headers.get(header::ORIGIN).cloned();

        let body = match axum::body::to_bytes(body, self.ctx.config().upload_limit).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(method = %parts.method, uri = %parts.uri, error = %e, "Request body rejected");
                self.ctx.error(
                    SOURCE,
                    format!("{} {}: request body rejected: {e}", parts.method, parts.uri),
                );
                return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
            }
        };

        let request = Arc::new(NormalizedRequest::from_parts(&parts, body, target));
        let exchange = ExchangeId::new();
        self.ctx.bus().emit(Event::Request {
            exchange,
            time: now_millis(),
            request: Arc::clone(&request),
        });

        // The pass outlives this future, so a timeout or a client hang-up
        // still ends the exchange with `response` or `missing`.
        let pass = tokio::spawn(complete_exchange(
            self.ctx.clone(),
            self.chain.clone(),
            request,
            exchange,
            started,
        ));
        let answer = match pass.await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(%exchange, error = %e, "Injector chain pass aborted");
                self.ctx
                    .error(SOURCE, format!("{} {}: chain pass aborted: {e}", parts.method, parts.uri));
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
            }
        };

        let mut response = Answer::clone(&answer).into_response();
        cors::allow_origin(&mut response, origin.as_ref());
        response
    }

    async fn upgrade(&self, mut parts: Parts, target: &str) -> Response {
        let request = Arc::new(NormalizedRequest::from_parts(&parts, Bytes::new(), target));
        match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => {
                let engine = self.engine.clone();
                upgrade.on_upgrade(move |socket| async move {
                    engine.serve(socket, request).await;
                })
            }
            Err(rejection) => {
                self.ctx
                    .debug(SOURCE, format!("{}: upgrade rejected: {rejection}", request.url));
                rejection.into_response()
            }
        }
    }
}

/// Run the chain and emit the terminal event for `exchange`.
async fn complete_exchange(
    ctx: ServerContext,
    chain: InjectorChain,
    request: Arc<NormalizedRequest>,
    exchange: ExchangeId,
    started: Instant,
) -> Arc<Answer> {
    let bus = ctx.bus();
    let (answer, outcome) = match chain.handle(&request).await {
        Some(answer) => {
            let answer = Arc::new(answer.normalized());
            bus.emit(Event::Response {
                exchange,
                time: now_millis(),
                answer: Arc::clone(&answer),
            });
            (answer, "hit")
        }
        None => {
            bus.emit(Event::Missing {
                exchange,
                time: now_millis(),
            });
            (Arc::new(Answer::not_found(&request.url)), "miss")
        }
    };

    tracing::debug!(
        %exchange,
        method = %request.method,
        url = %request.url,
        target = %request.target,
        status = answer.status.code,
        injector = %answer.injector_name(),
        "Exchange complete"
    );
    metrics::record_exchange(outcome, answer.injector_name(), started.elapsed());
    answer
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

#[async_trait]
impl Hook for InjectorHook {
    fn name(&self) -> &str {
        "injectors"
    }

    fn rate(&self, parts: &Parts) -> f64 {
        if self.mounts.resolve(parts.uri.path()).is_some() {
            1.0
        } else {
            0.0
        }
    }

    async fn handle(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let target = self
            .mounts
            .resolve(parts.uri.path())
            .unwrap_or(ROOT)
            .to_string();

        if self.ctx.config().ws && is_websocket_upgrade(&parts.headers) {
            return self.upgrade(parts, &target).await;
        }
        self.exchange(parts, body, &target).await
    }
}
