//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → context.rs (ServerContext: Arc<ServerConfig> + EventBus)
//!     → shared with the dispatch core and every injector
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; live changes go through injector options
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod context;
pub mod loader;
pub mod schema;
pub mod validation;

pub use context::ServerContext;
pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, InjectorConfig, ListenerConfig, MountTarget, ObservabilityConfig,
    RecorderConfig, ServerConfig, TlsConfig,
};
