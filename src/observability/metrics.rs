//! Metrics collection and exposition.
//!
//! # Metrics
//! - `intercept_exchanges_total` (counter): dispatched HTTP exchanges by outcome, injector
//! - `intercept_exchange_duration_seconds` (histogram): normalize-to-answer latency
//! - `intercept_ws_messages_total` (counter): bridged WebSocket messages by direction
//! - `intercept_ws_reconnects_total` (counter): upstream WebSocket retries
//! - `intercept_ws_sessions` (gauge): live client WebSocket sessions
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is installed once per process

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

static METRICS_INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Start the Prometheus scrape endpoint on `addr`. Later calls are ignored.
pub fn init_metrics(addr: SocketAddr) {
    if let Some(existing) = METRICS_INSTALLED.get() {
        tracing::debug!(address = %existing, "Metrics exporter already installed");
        return;
    }

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            let _ = METRICS_INSTALLED.set(addr);
            register_metrics();
            tracing::info!(address = %addr, "Metrics exporter listening");
        }
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter");
        }
    }
}

fn register_metrics() {
    describe_counter!(
        "intercept_exchanges_total",
        "Dispatched HTTP exchanges by outcome and answering injector"
    );
    describe_histogram!(
        "intercept_exchange_duration_seconds",
        "Time from normalized request to answer"
    );
    describe_counter!(
        "intercept_ws_messages_total",
        "WebSocket messages relayed through upstream bridges"
    );
    describe_counter!(
        "intercept_ws_reconnects_total",
        "Upstream WebSocket reconnect attempts"
    );
    describe_gauge!("intercept_ws_sessions", "Live client WebSocket sessions");
}

/// `outcome` is `hit` or `miss`; misses are labelled with injector `(none)`.
pub fn record_exchange(outcome: &'static str, injector: &str, elapsed: Duration) {
    counter!(
        "intercept_exchanges_total",
        "outcome" => outcome,
        "injector" => injector.to_string()
    )
    .increment(1);
    histogram!("intercept_exchange_duration_seconds", "outcome" => outcome)
        .record(elapsed.as_secs_f64());
}

pub fn record_ws_message(direction: &'static str) {
    counter!("intercept_ws_messages_total", "direction" => direction).increment(1);
}

pub fn record_ws_reconnect() {
    counter!("intercept_ws_reconnects_total").increment(1);
}

pub fn ws_session_opened() {
    gauge!("intercept_ws_sessions").increment(1.0);
}

pub fn ws_session_closed() {
    gauge!("intercept_ws_sessions").decrement(1.0);
}
