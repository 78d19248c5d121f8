//! Request/answer model shared by every subsystem.
//!
//! # Data Flow
//! ```text
//! axum Request (parts + body bytes)
//!     → request.rs (NormalizedRequest, built once per call)
//!     → injectors produce answer.rs (Answer)
//!     → Answer::into_response at the transport edge
//! ```
//!
//! # Design Decisions
//! - Normalized requests are immutable and shared via Arc
//! - Headers are lower-cased; repeated headers keep every value
//! - Bodies stay text when they are valid UTF-8, bytes otherwise

pub mod answer;
pub mod request;

use std::time::{SystemTime, UNIX_EPOCH};

pub use answer::{Answer, FileTag, InjectorTag, Status};
pub use request::{Content, HeaderValue, NormalizedRequest};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
