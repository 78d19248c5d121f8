//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Initialize subsystems in dependency order
//! - Start background tasks (event logger, metrics exporter)
//! - Bind listeners and begin accepting traffic
//! - Turn OS signals into a graceful shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

use crate::admin::{serve_admin, AdminState};
use crate::config::{validation::validate_config, ConfigError, ServerConfig, ServerContext};
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::{signals::wait_for_signal, Shutdown};
use crate::net;
use crate::observability::{logging::spawn_event_logger, metrics};

/// Run the server until a shutdown signal arrives.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let shutdown = Shutdown::new();
    run_until(config, &shutdown, wait_for_signal()).await
}

/// Run the server until `stop` resolves.
pub async fn run_until(
    config: ServerConfig,
    shutdown: &Shutdown,
    stop: impl std::future::Future<Output = ()>,
) -> Result<(), ServerError> {
    validate_config(&config).map_err(|errors| ServerError::Config(ConfigError::Validation(errors)))?;

    tracing::info!(
        bind_address = %config.listener.bind_address,
        mounts = config.map.len(),
        injectors = config.injectors.len(),
        ws = config.ws,
        "Configuration loaded"
    );

    let ctx = ServerContext::new(config);
    let echo = spawn_event_logger(ctx.bus());

    let observability = &ctx.config().observability;
    if observability.metrics_enabled {
        match observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = HttpServer::new(ctx.clone());
    let listener = net::bind(&ctx.config().listener.bind_address).await?;

    let admin = if ctx.config().admin.enabled {
        let admin_listener = net::bind(&ctx.config().admin.bind_address).await?;
        Some(tokio::spawn(serve_admin(
            admin_listener,
            AdminState::from_server(&server),
            shutdown.subscribe(),
        )))
    } else {
        None
    };

    let serving = server.run(listener, shutdown.subscribe());
    tokio::pin!(serving);
    tokio::pin!(stop);

    let result = tokio::select! {
        result = &mut serving => result,
        _ = &mut stop => {
            shutdown.trigger();
            serving.await
        }
    };

    // Stops the management API too if the main server ended on its own.
    shutdown.trigger();
    if let Some(admin) = admin {
        match admin.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Management API failed"),
            Err(e) => tracing::error!(error = %e, "Management API task failed"),
            Ok(Ok(())) => {}
        }
    }
    echo.abort();
    result
}
