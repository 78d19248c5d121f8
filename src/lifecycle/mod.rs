//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → event logger, metrics → chain + server → listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → close WebSocket sessions → drain HTTP → dispose injectors
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - One broadcast reaches every listener and background task

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
