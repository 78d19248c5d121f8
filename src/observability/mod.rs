//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing macros (structured fields)      → logging.rs subscriber
//!     → EventBus events                         → logging.rs event logger
//!     → counters, gauges, histograms            → metrics.rs (Prometheus)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON optional) for machine parsing
//! - Request IDs come from the HTTP layer and appear on trace spans
//! - Metrics are cheap and no-ops until an exporter is installed

pub mod logging;
pub mod metrics;
