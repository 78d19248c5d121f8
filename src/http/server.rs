//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build every subsystem the traffic path needs (chain, recorder, sessions)
//! - Create the Axum Router with one wildcard handler
//! - Wire up middleware (request ID, tracing, timeout)
//! - Serve plain or TLS, with graceful shutdown
//! - Report `open` / `close` and release injector resources on exit

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::Response,
    routing::any,
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{ConfigError, ServerConfig, ServerContext};
use crate::dispatch::{HookRouter, InjectorHook};
use crate::events::Event;
use crate::injectors::InjectorChain;
use crate::net::{load_tls_config, ListenerError};
use crate::recorder::Recorder;
use crate::websocket::{SessionRegistry, WebSocketEngine};

/// Time open TLS connections get to finish after shutdown.
const TLS_DRAIN: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("TLS setup failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Application state injected into the handler.
#[derive(Clone)]
pub struct AppState {
    pub hooks: Arc<HookRouter>,
}

/// The interception server.
pub struct HttpServer {
    router: Router,
    ctx: ServerContext,
    chain: InjectorChain,
    recorder: Arc<Recorder>,
    sessions: Arc<SessionRegistry>,
}

impl HttpServer {
    /// Build the configured injector chain and everything around it.
    pub fn new(ctx: ServerContext) -> Self {
        let chain = InjectorChain::from_context(&ctx);
        Self::with_chain(ctx, chain)
    }

    /// Serve an already built chain.
    pub fn with_chain(ctx: ServerContext, chain: InjectorChain) -> Self {
        let recorder = Arc::new(Recorder::new(&ctx.config().recorder, ctx.bus().clone()));
        let sessions = Arc::new(SessionRegistry::new());
        let engine = WebSocketEngine::new(ctx.clone(), chain.clone(), Arc::clone(&sessions));

        let hooks = HookRouter::new().with_hook(Arc::new(InjectorHook::new(
            ctx.clone(),
            chain.clone(),
            engine,
        )));
        let state = AppState {
            hooks: Arc::new(hooks),
        };

        let router = Self::build_router(ctx.config(), state);
        Self {
            router,
            ctx,
            chain,
            recorder,
            sessions,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServerConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(dispatch_handler))
            .route("/", any(dispatch_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn chain(&self) -> &InjectorChain {
        &self.chain
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Serve until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let recording = self.recorder.attach();
        let tls = match &self.ctx.config().listener.ssl {
            Some(tls) => Some(load_tls_config(tls).await.map_err(ServerError::Tls)?),
            None => None,
        };
        let scheme = if tls.is_some() { "https" } else { "http" };

        tracing::info!(
            address = %addr,
            tls = tls.is_some(),
            injectors = ?self.chain.names(),
            "HTTP server starting"
        );
        self.ctx.bus().emit(Event::Open {
            address: format!("{scheme}://{addr}"),
        });

        let sessions = Arc::clone(&self.sessions);
        let app = self.router.clone();
        match tls {
            None => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                        sessions.dispose_all();
                    })
                    .await?;
            }
            Some(tls) => {
                let handle = axum_server::Handle::new();
                let trigger = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    sessions.dispose_all();
                    trigger.graceful_shutdown(Some(TLS_DRAIN));
                });
                axum_server::from_tcp_rustls(listener.into_std()?, tls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await?;
            }
        }

        self.chain.dispose();
        self.ctx.bus().emit(Event::Close);
        recording.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn dispatch_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    state.hooks.dispatch(request).await
}
