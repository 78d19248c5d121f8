//! Interception server.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ───────────────▶ net listener ──▶ http server ──▶ dispatch (hooks, mounts, CORS)
//!                                                          │
//!                                       ┌──────────────────┴──────────────────┐
//!                                       ▼                                     ▼
//!                              injector chain                        WebSocket engine
//!                      har → json → script → proxy → store      claim / bridge / raw
//!                                       │                                     │
//!     Client Response ◀── Answer ◀──────┘                                     │
//!                                                                             │
//!     Cross-cutting: config + context, event bus → recorder, event logger,   │
//!     management API feed; fixtures watch; observability; lifecycle ◀────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use intercept_proxy::config::{load_config, ServerConfig};
use intercept_proxy::lifecycle::startup;
use intercept_proxy::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "intercept-proxy")]
#[command(about = "HTTP/WebSocket interception server for mocking, replay and recording", long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, env = "INTERCEPT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listener bind address
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }

    init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "intercept-proxy starting"
    );

    startup::run(config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
