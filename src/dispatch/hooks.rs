//! Hook selection.
//!
//! # Design Decisions
//! - Hooks rate the request head only; the body is left to the winner
//! - Registration order breaks ties, and a perfect `1.0` short-circuits
//! - No hook interested means a fixed 404 and no events

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::dispatch::cors;

pub const NO_HANDLER: &str = "No handler registered for this request";

/// A request handler competing for traffic.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Interest in a request, in `[0, 1]`.
    fn rate(&self, parts: &Parts) -> f64;

    async fn handle(&self, request: Request<Body>) -> Response;
}

#[derive(Clone, Default)]
pub struct HookRouter {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        tracing::debug!(hook = %hook.name(), position = self.hooks.len(), "Hook registered");
        self.hooks.push(hook);
    }

    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.register(hook);
        self
    }

    /// The hook that gets the request, if any scores above zero.
    pub fn select(&self, parts: &Parts) -> Option<&Arc<dyn Hook>> {
        let mut best: Option<(&Arc<dyn Hook>, f64)> = None;
        for hook in &self.hooks {
            let score = hook.rate(parts);
            if score >= 1.0 {
                return Some(hook);
            }
            if score > 0.0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((hook, score));
            }
        }
        best.map(|(hook, _)| hook)
    }

    /// Preflights are answered here; everything else goes to the selected hook.
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        if request.method() == Method::OPTIONS {
            return cors::preflight(request.headers());
        }

        let (parts, body) = request.into_parts();
        let Some(hook) = self.select(&parts).cloned() else {
            tracing::debug!(method = %parts.method, uri = %parts.uri, "No hook for request");
            return (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "text/plain")],
                NO_HANDLER,
            )
                .into_response();
        };
        hook.handle(Request::from_parts(parts, body)).await
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for HookRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.hooks.iter().map(|h| h.name()).collect();
        f.debug_struct("HookRouter").field("hooks", &names).finish()
    }
}
