//! Mount prefix lookup.
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Keys are scanned longest first, so the most specific mount wins
//! - A prefix only matches at a segment boundary: `/api` takes `/api`,
//!   `/api/x` and `/api?x`, never `/apix`
//! - `/` matches everything

use crate::config::ServerConfig;

pub const ROOT: &str = "/";

#[derive(Debug, Clone)]
pub struct MountTable {
    /// Sorted by descending length.
    keys: Vec<String>,
}

impl MountTable {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        keys.dedup();
        Self { keys }
    }

    /// Mounts from the `map` table; no mounts at all means one root mount.
    pub fn from_config(config: &ServerConfig) -> Self {
        if config.map.is_empty() {
            return Self::new([ROOT]);
        }
        Self::new(config.map.keys().cloned())
    }

    /// Mount key covering `path`, if any.
    pub fn resolve(&self, path: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|key| covers(key, path))
            .map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

fn covers(key: &str, path: &str) -> bool {
    let prefix = key.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountTarget;

    #[test]
    fn longest_prefix_wins() {
        let table = MountTable::new(["/", "/api", "/api/v2"]);
        assert_eq!(table.resolve("/api/v2/users"), Some("/api/v2"));
        assert_eq!(table.resolve("/api/v1/users"), Some("/api"));
        assert_eq!(table.resolve("/other"), Some("/"));
    }

    #[test]
    fn prefix_stops_at_segment_boundary() {
        let table = MountTable::new(["/api"]);
        assert_eq!(table.resolve("/api"), Some("/api"));
        assert_eq!(table.resolve("/api/"), Some("/api"));
        assert_eq!(table.resolve("/api?x=1"), Some("/api"));
        assert_eq!(table.resolve("/apix"), None);
        assert_eq!(table.resolve("/"), None);
    }

    #[test]
    fn trailing_slash_in_key_is_ignored_for_matching() {
        let table = MountTable::new(["/mock/"]);
        assert_eq!(table.resolve("/mock/a"), Some("/mock/"));
    }

    #[test]
    fn empty_map_mounts_root() {
        let config = ServerConfig::default();
        let table = MountTable::from_config(&config);
        assert_eq!(table.resolve("/anything"), Some("/"));

        let mut config = ServerConfig::default();
        config.map.insert("/api".into(), MountTarget::Disabled(false));
        let table = MountTable::from_config(&config);
        assert_eq!(table.resolve("/anything"), None);
    }
}
