//! HTTP/WebSocket interception server library.

// Core subsystems
pub mod config;
pub mod dispatch;
pub mod events;
pub mod http;
pub mod injectors;
pub mod model;
pub mod net;

// Traffic sources and sinks
pub mod fixtures;
pub mod recorder;
pub mod websocket;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;

pub use config::{ServerConfig, ServerContext};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
