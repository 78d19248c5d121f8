//! WebSocket proxy engine.
//!
//! # Data Flow
//! ```text
//! upgrade request (dispatch)
//!     → WebSocketEngine::serve
//!     → user-connected event, SessionRegistry entry
//!     → route:
//!         script claims it      → each client message goes to its `message` hook
//!         injector has upstream → Bridge (buffer, paced release, reconnect)
//!         otherwise             → raw, messages only become events
//!     → user-disconnected event, registry entry dropped
//! ```
//!
//! # Design Decisions
//! - At most one upstream socket per client socket, owned by one bridge task
//! - Sessions are closed through the registry (management API, shutdown)
//! - Client and upstream halves are split and driven from one `select!` loop

pub mod bridge;
pub mod registry;
pub mod session;

use serde::Serialize;

pub use bridge::{Bridge, BridgeConfig, BridgeState, Frame};
pub use registry::{SessionGuard, SessionId, SessionMode, SessionRegistry, SessionSummary};
pub use session::WebSocketEngine;

/// What injectors get to see of a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    /// Upgrade URL, mount target stripped.
    pub url: String,
    pub target: String,
}

impl SessionInfo {
    pub fn new(id: impl Into<String>, url: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            target: target.into(),
        }
    }
}
