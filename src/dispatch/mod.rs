//! Dispatch core.
//!
//! # Data Flow
//! ```text
//! axum wildcard handler
//!     → hooks.rs (OPTIONS → cors.rs preflight; otherwise rate every hook)
//!     → winning hook, or a fixed 404
//!     → injector_hook.rs:
//!         mounts.rs (longest-prefix target)
//!         upgrade?  → WebSocket engine
//!         otherwise → normalize, `request` event, InjectorChain,
//!                     `response` / `missing` event, Answer (+ CORS origin)
//! ```
//!
//! # Design Decisions
//! - Hooks are trait objects so other handlers can compete for traffic
//! - One exchange token per request pairs its events for the recorder

pub mod cors;
pub mod hooks;
pub mod injector_hook;
pub mod mounts;

pub use hooks::{Hook, HookRouter, NO_HANDLER};
pub use injector_hook::InjectorHook;
pub use mounts::MountTable;
