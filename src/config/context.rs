//! Shared server context.
//!
//! The read-only view of the merged configuration plus the event bus, handed
//! to the dispatch core and to every injector at construction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::ServerConfig;
use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct ServerContext {
    config: Arc<ServerConfig>,
    bus: EventBus,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            config: Arc::new(config),
            bus,
        }
    }

    pub fn with_bus(config: ServerConfig, bus: EventBus) -> Self {
        Self {
            config: Arc::new(config),
            bus,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Configured mount keys.
    pub fn mounts(&self) -> impl Iterator<Item = &str> {
        self.config.map.keys().map(String::as_str)
    }

    /// Upstream address for a mount, `None` for fixture-only mounts.
    pub fn upstream(&self, mount: &str) -> Option<&str> {
        self.config.upstream(mount)
    }

    /// Mount whose upstream address contains `url`, preferring the longest address.
    pub fn mount_for_upstream_url(&self, url: &str) -> Option<(&str, &str)> {
        self.config
            .map
            .iter()
            .filter_map(|(mount, target)| target.address().map(|addr| (mount.as_str(), addr)))
            .filter(|(_, addr)| url.starts_with(addr.trim_end_matches('/')))
            .max_by_key(|(_, addr)| addr.len())
    }

    /// Root directory for files the server writes.
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.directory)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_delay_ms)
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.bus.error(source, message);
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.bus.info(source, message);
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.bus.debug(source, message);
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::MountTarget;

    #[test]
    fn finds_mount_containing_upstream_url() {
        let mut config = ServerConfig::default();
        config.map.insert(
            "/api".into(),
            MountTarget::Address("http://example.com/v1".into()),
        );
        config.map.insert(
            "/root".into(),
            MountTarget::Address("http://example.com".into()),
        );
        config.map.insert("/off".into(), MountTarget::Disabled(false));
        let ctx = ServerContext::new(config);

        assert_eq!(
            ctx.mount_for_upstream_url("http://example.com/v1/users"),
            Some(("/api", "http://example.com/v1"))
        );
        assert_eq!(
            ctx.mount_for_upstream_url("http://example.com/other"),
            Some(("/root", "http://example.com"))
        );
        assert_eq!(ctx.mount_for_upstream_url("http://elsewhere.org/"), None);
    }
}
