//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request ID, trace, timeout)
//!     → dispatch (hook selection, injector chain, WebSocket upgrades)
//!     → Answer → axum Response
//!     → Send to client
//! ```

pub mod server;

pub use server::{AppState, HttpServer, ServerError};
