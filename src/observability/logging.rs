//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from configuration
//! - Echo event-bus traffic into the log
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level
//! - `log_format = "json"` for machine parsing, human-readable otherwise

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::events::{Event, EventBus};

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.log_format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Log every bus event until the bus goes away.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &Event) {
    match event {
        Event::Request {
            exchange, request, ..
        } => {
            tracing::debug!(%exchange, method = %request.method, url = %request.url, target = %request.target, "request");
        }
        Event::Response {
            exchange, answer, ..
        } => {
            tracing::info!(
                %exchange,
                status = answer.status.code,
                url = %answer.url,
                injector = %answer.injector_name(),
                "response"
            );
        }
        Event::Missing { exchange, .. } => tracing::info!(%exchange, "missing"),
        Event::Message(message) => {
            tracing::debug!(from = %message.from, to = %message.to, remote = message.remote, "message");
        }
        Event::Broadcast(_) => {}
        Event::Error { source, message } => tracing::error!(%source, "{message}"),
        Event::Info { source, message } => tracing::info!(%source, "{message}"),
        Event::Debug { source, message } => tracing::debug!(%source, "{message}"),
        Event::Open { address } => tracing::info!(%address, "open"),
        Event::Close => tracing::info!("close"),
        Event::UserConnected { session, url } => tracing::info!(%session, %url, "user connected"),
        Event::UserDisconnected { session } => tracing::info!(%session, "user disconnected"),
        Event::Logged { source, path } => tracing::debug!(%source, %path, "logged"),
    }
}
