//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the interception server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Mount prefix → upstream address (or `false` for fixture-only mounts).
    pub map: BTreeMap<String, MountTarget>,

    /// Injector chain, in the order injectors are consulted.
    pub injectors: Vec<InjectorConfig>,

    /// Handle WebSocket upgrades (bridge, script or raw).
    pub ws: bool,

    /// Default fixture directories for file-backed injectors.
    pub sources: Vec<String>,

    /// Working directory (store logs live below it).
    pub directory: String,

    /// Maximum accepted request body, in bytes.
    pub upload_limit: usize,

    /// Request timeout (total time for request/response) in seconds.
    pub request_timeout_secs: u64,

    /// Delay before a closed upstream WebSocket is reconnected.
    pub reconnect_delay_ms: u64,

    /// Capacity of the event bus.
    pub event_capacity: usize,

    /// Recorder log sizes.
    pub recorder: RecorderConfig,

    /// Management API.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            map: BTreeMap::new(),
            injectors: ["har", "json", "script", "proxy", "store"]
                .into_iter()
                .map(InjectorConfig::named)
                .collect(),
            ws: true,
            sources: vec!["fixtures".to_string()],
            directory: ".".to_string(),
            upload_limit: 10 * 1024 * 1024, // 10MB
            request_timeout_secs: 60,
            reconnect_delay_ms: 5_000,
            event_capacity: 1024,
            recorder: RecorderConfig::default(),
            admin: AdminConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Upstream address configured for a mount, if any.
    pub fn upstream(&self, mount: &str) -> Option<&str> {
        self.map.get(mount).and_then(MountTarget::address)
    }

    /// Default fixture directories as paths.
    pub fn source_dirs(&self) -> Vec<PathBuf> {
        self.sources.iter().map(PathBuf::from).collect()
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Optional TLS material.
    pub ssl: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            ssl: None,
        }
    }
}

/// TLS material for the listener, already read into memory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Certificate chain (PEM).
    pub cert: String,

    /// Private key (PEM).
    pub key: String,
}

/// Where a mount forwards to.
///
/// `"/api" = "http://localhost:3000"` proxies, `"/mock" = false` only serves fixtures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MountTarget {
    Address(String),
    Disabled(bool),
}

impl MountTarget {
    pub fn address(&self) -> Option<&str> {
        match self {
            MountTarget::Address(addr) => Some(addr.as_str()),
            MountTarget::Disabled(_) => None,
        }
    }
}

/// One injector in the chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InjectorConfig {
    /// Injector kind (`har`, `json`, `script`, `proxy`, `store`).
    pub name: String,

    /// Whether the injector is consulted.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Injector-specific settings, applied through the option protocol.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl InjectorConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active: true,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Recorder log sizes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub max_requests: usize,
    pub max_errors: usize,
    pub max_messages: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_requests: 500,
            max_errors: 500,
            max_messages: 500,
        }
    }
}

/// Management API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the management API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Management API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this when exposing the API.
            api_key: "CHANGE_ME".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log format (`pretty` or `json`).
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
