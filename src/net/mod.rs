//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! bind_address
//!     → listener.rs (parse, bind)
//!     → tls.rs (optional, PEM text from the config)
//!     → Hand off to the HTTP layer
//! ```
//!
//! # Design Decisions
//! - TLS is optional and handled transparently by axum-server
//! - Certificate problems surface at startup, not on the first handshake

pub mod listener;
pub mod tls;

pub use listener::{bind, ListenerError};
pub use tls::load_tls_config;
