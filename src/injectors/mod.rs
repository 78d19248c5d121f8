//! Injector chain subsystem.
//!
//! # Data Flow
//! ```text
//! NormalizedRequest (from the dispatch hook)
//!     → InjectorChain::handle
//!     → each active injector in registration order, awaited one at a time:
//!         - har.rs    (HAR fixture replay)
//!         - json.rs   (JSON fixture replay)
//!         - script.rs (Rhai handlers)
//!         - proxy.rs  (reverse proxy to the mount's upstream)
//!         - store.rs  (append-only log of unanswered traffic)
//!     → first Some(Answer) wins, None when the chain is exhausted
//! ```
//!
//! # Design Decisions
//! - Closed set of variants behind one trait object, resolved by name at startup
//! - Inactive injectors are skipped without being called
//! - Injector failures are reported as `error` events and count as "no answer"
//! - Settings change only through `set_options` / `set_active`

pub mod files;
pub mod har;
pub mod json;
pub mod options;
pub mod proxy;
pub mod script;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{InjectorConfig, ServerContext};
use crate::fixtures::FixtureError;
use crate::model::{Answer, NormalizedRequest};
use crate::websocket::SessionInfo;

pub use har::HarInjector;
pub use json::JsonInjector;
pub use options::{OptionField, OptionKind, OptionSet};
pub use proxy::ProxyInjector;
pub use script::ScriptInjector;
pub use store::StoreInjector;

/// Names `build_injector` resolves.
pub const KNOWN_INJECTORS: &[&str] = &["har", "json", "script", "proxy", "store"];

#[derive(Debug, Error)]
pub enum InjectorError {
    #[error("Unknown injector: {0}")]
    Unknown(String),

    #[error("Invalid value for option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("Fixture error: {0}")]
    Fixture(#[from] FixtureError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A pluggable response provider.
#[async_trait]
pub trait Injector: Send + Sync {
    fn name(&self) -> &str;

    fn is_active(&self) -> bool;

    fn set_active(&self, active: bool);

    /// Produce an answer, or decline with `None`.
    async fn handle(&self, request: &NormalizedRequest) -> Option<Answer>;

    fn options(&self) -> OptionSet;

    /// Apply recognized keys from a partial settings object.
    fn set_options(&self, options: &Map<String, Value>) -> Result<(), InjectorError>;

    /// Offered a new WebSocket session; `true` claims it.
    async fn connected(&self, _session: &SessionInfo) -> bool {
        false
    }

    /// A client message on a session this injector claimed.
    async fn message(&self, _session: &SessionInfo, _content: &str) -> Option<String> {
        None
    }

    async fn disconnected(&self, _session: &SessionInfo) {}

    /// Upstream WebSocket URL for a client upgrade, if this injector bridges it.
    fn websocket_upstream(&self, _request: &NormalizedRequest) -> Option<String> {
        None
    }

    /// Release watches and other resources.
    fn dispose(&self) {}
}

/// Resolve a configured injector by name.
pub fn build_injector(
    config: &InjectorConfig,
    ctx: &ServerContext,
) -> Result<Arc<dyn Injector>, InjectorError> {
    let dirs = match config.options.get(files::DIRECTORIES) {
        Some(value) => options::as_dirs(files::DIRECTORIES, value)?,
        None => ctx.config().source_dirs(),
    };

    let injector: Arc<dyn Injector> = match config.name.as_str() {
        "har" => Arc::new(HarInjector::new(ctx, dirs)),
        "json" => Arc::new(JsonInjector::new(ctx, dirs)),
        "script" => Arc::new(ScriptInjector::new(ctx, dirs)),
        "proxy" => Arc::new(ProxyInjector::new(ctx)?),
        "store" => Arc::new(StoreInjector::new(ctx)),
        other => return Err(InjectorError::Unknown(other.to_string())),
    };

    let mut rest = config.options.clone();
    rest.remove(files::DIRECTORIES);
    if !rest.is_empty() {
        injector.set_options(&rest)?;
    }
    injector.set_active(config.active);
    Ok(injector)
}

/// The ordered injector list consulted for every request.
#[derive(Clone, Default)]
pub struct InjectorChain {
    injectors: Vec<Arc<dyn Injector>>,
}

impl InjectorChain {
    pub fn new(injectors: Vec<Arc<dyn Injector>>) -> Self {
        Self { injectors }
    }

    /// Build every configured injector; failures are reported and skipped.
    pub fn from_context(ctx: &ServerContext) -> Self {
        let mut injectors = Vec::new();
        for config in &ctx.config().injectors {
            match build_injector(config, ctx) {
                Ok(injector) => {
                    tracing::info!(
                        injector = %config.name,
                        active = config.active,
                        "Injector registered"
                    );
                    injectors.push(injector);
                }
                Err(e) => {
                    tracing::error!(injector = %config.name, error = %e, "Injector not registered");
                    ctx.error("injectors", format!("{}: {e}", config.name));
                }
            }
        }
        Self { injectors }
    }

    /// Ask each active injector in order; the first answer wins.
    pub async fn handle(&self, request: &NormalizedRequest) -> Option<Answer> {
        for injector in &self.injectors {
            if !injector.is_active() {
                continue;
            }
            if let Some(mut answer) = injector.handle(request).await {
                if answer.injector.is_none() {
                    answer = answer.with_injector(injector.name());
                }
                return Some(answer);
            }
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Injector>> {
        self.injectors.iter().find(|i| i.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.injectors.iter().map(|i| i.name().to_string()).collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &Arc<dyn Injector>> {
        self.injectors.iter().filter(|i| i.is_active())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Injector>> {
        self.injectors.iter()
    }

    pub fn len(&self) -> usize {
        self.injectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }

    pub fn dispose(&self) {
        for injector in &self.injectors {
            injector.dispose();
        }
    }
}

impl std::fmt::Debug for InjectorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectorChain")
            .field("injectors", &self.names())
            .finish()
    }
}
