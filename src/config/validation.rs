//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Mount keys are absolute paths, upstream addresses are http(s) URLs
//! - Injector names resolve to a known injector kind
//! - Value ranges (limits and capacities > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::ServerConfig;
use crate::injectors::KNOWN_INJECTORS;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("mount '{0}' must start with '/'")]
    MountNotAbsolute(String),

    #[error("upstream '{address}' for mount '{mount}' is not a valid http(s) URL")]
    InvalidUpstream { mount: String, address: String },

    #[error("unknown injector '{0}'")]
    UnknownInjector(String),

    #[error("injector '{0}' is configured more than once")]
    DuplicateInjector(String),

    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    for (mount, target) in &config.map {
        if !mount.starts_with('/') {
            errors.push(ValidationError::MountNotAbsolute(mount.clone()));
        }
        if let Some(address) = target.address() {
            let valid = Url::parse(address)
                .map(|url| matches!(url.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !valid {
                errors.push(ValidationError::InvalidUpstream {
                    mount: mount.clone(),
                    address: address.to_string(),
                });
            }
        }
    }

    let mut seen = Vec::new();
    for injector in &config.injectors {
        if !KNOWN_INJECTORS.contains(&injector.name.as_str()) {
            errors.push(ValidationError::UnknownInjector(injector.name.clone()));
        } else if seen.contains(&injector.name.as_str()) {
            errors.push(ValidationError::DuplicateInjector(injector.name.clone()));
        }
        seen.push(injector.name.as_str());
    }

    if config.upload_limit == 0 {
        errors.push(ValidationError::Zero("upload_limit"));
    }
    if config.event_capacity == 0 {
        errors.push(ValidationError::Zero("event_capacity"));
    }
    if config.recorder.max_requests == 0
        || config.recorder.max_errors == 0
        || config.recorder.max_messages == 0
    {
        errors.push(ValidationError::Zero("recorder capacity"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{InjectorConfig, MountTarget};

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn rejects_bad_mounts_and_injectors() {
        let mut config = ServerConfig::default();
        config.map.insert("api".into(), MountTarget::Disabled(false));
        config.map.insert(
            "/ws".into(),
            MountTarget::Address("ftp://example.com".into()),
        );
        config.injectors.push(InjectorConfig::named("magic"));
        config.injectors.push(InjectorConfig::named("json"));

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::MountNotAbsolute("api".into())));
        assert!(errors.contains(&ValidationError::UnknownInjector("magic".into())));
        assert!(errors.contains(&ValidationError::DuplicateInjector("json".into())));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidUpstream { mount, .. } if mount == "/ws")));
    }
}
