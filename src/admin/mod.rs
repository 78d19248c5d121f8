//! Management API.
//!
//! # Data Flow
//! ```text
//! operator / intercept-cli
//!     → auth.rs (Bearer key, or `?token=` for the feed socket)
//!     → handlers.rs
//!         recorder reads, clear
//!         injector listing, options, activation
//!         WebSocket session listing, dispose
//!         /admin/feed → bus events as JSON frames
//! ```
//!
//! # Design Decisions
//! - Separate listener from intercepted traffic, so mounts can never shadow it
//! - Mutations go through `set_options` / `set_active` only

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{delete, get, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::config::ServerContext;
use crate::http::{HttpServer, ServerError};
use crate::injectors::InjectorChain;
use crate::recorder::Recorder;
use crate::websocket::SessionRegistry;

/// Everything the management handlers read or steer.
#[derive(Clone)]
pub struct AdminState {
    pub ctx: ServerContext,
    pub chain: InjectorChain,
    pub recorder: Arc<Recorder>,
    pub sessions: Arc<SessionRegistry>,
    pub started: Instant,
}

impl AdminState {
    pub fn from_server(server: &HttpServer) -> Self {
        Self {
            ctx: server.context().clone(),
            chain: server.chain().clone(),
            recorder: Arc::clone(server.recorder()),
            sessions: Arc::clone(server.sessions()),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/requests", get(list_requests))
        .route("/admin/requests/{id}", get(get_request))
        .route("/admin/errors", get(list_errors))
        .route("/admin/messages", get(list_messages))
        .route("/admin/records", delete(clear_records))
        .route("/admin/injectors", get(list_injectors))
        .route("/admin/injectors/{name}", get(get_injector).put(set_injector_options))
        .route("/admin/injectors/{name}/active", put(set_injector_active))
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/{id}", delete(dispose_session))
        .route("/admin/feed", get(event_feed))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}

/// Serve the management API until `shutdown` fires.
pub async fn serve_admin(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Management API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
