//! Matching stored fixture requests against incoming ones.
//!
//! A fixture matches when the method is equal ignoring case, the target is
//! unset or equal (`""` and `/` are the same target), the path before `?` is
//! equal ignoring case, and every fixture query key is present in the request
//! with the same value. Extra request query keys are allowed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::fixtures::table::LoadedFile;
use crate::model::{Answer, NormalizedRequest};

/// The request half of a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub target: Option<String>,
}

impl FixtureRequest {
    /// Build from a method and a path with an optional query string.
    pub fn new(method: &str, url: &str, target: Option<String>) -> Self {
        let (path, raw_query) = match url.split_once('?') {
            Some((path, query)) => (path, query),
            None => (url, ""),
        };
        let query = url::form_urlencoded::parse(raw_query.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Self {
            method: method.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            target,
        }
    }

    pub fn matches(&self, request: &NormalizedRequest) -> bool {
        if !self.method.eq_ignore_ascii_case(&request.method) {
            return false;
        }

        if let Some(target) = &self.target {
            if normalize_target(target) != normalize_target(&request.target) {
                return false;
            }
        }

        if !self.path.eq_ignore_ascii_case(request.path()) {
            return false;
        }

        self.query
            .iter()
            .all(|(key, value)| request.query.get(key) == Some(value))
    }

    /// `GET /a?x=1` style label for listings.
    pub fn label(&self) -> String {
        if self.query.is_empty() {
            format!("{} {}", self.method.to_ascii_uppercase(), self.path)
        } else {
            let query: Vec<String> = self
                .query
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            format!(
                "{} {}?{}",
                self.method.to_ascii_uppercase(),
                self.path,
                query.join("&")
            )
        }
    }
}

fn normalize_target(target: &str) -> &str {
    if target.is_empty() {
        "/"
    } else {
        target
    }
}

/// A stored request with the answers it replays.
#[derive(Debug)]
pub struct Fixture {
    pub request: FixtureRequest,
    pub responses: Vec<Answer>,
    /// Recorded duration in milliseconds.
    pub time: u64,
    active: AtomicBool,
}

impl Fixture {
    pub fn new(request: FixtureRequest, responses: Vec<Answer>, time: u64) -> Self {
        Self {
            request,
            responses,
            time,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

/// The file and entry a request matched.
#[derive(Debug, Clone)]
pub struct FixtureHit {
    pub file: Arc<LoadedFile<Fixture>>,
    pub index: usize,
}

impl FixtureHit {
    pub fn fixture(&self) -> &Fixture {
        &self.file.entries[self.index]
    }
}

/// First active matching entry, files in load order, entries in array order.
pub fn find_fixture(
    files: &[Arc<LoadedFile<Fixture>>],
    request: &NormalizedRequest,
) -> Option<FixtureHit> {
    files.iter().find_map(|file| {
        file.entries
            .iter()
            .position(|fixture| fixture.is_active() && fixture.request.matches(request))
            .map(|index| FixtureHit {
                file: Arc::clone(file),
                index,
            })
    })
}
