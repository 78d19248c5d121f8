//! Request normalization.
//!
//! # Responsibilities
//! - Strip the matched mount target from the URL
//! - Drop the `_` cache-busting query key
//! - Collapse headers into single or repeated values
//! - Keep the body as text or bytes

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::http::request::Parts;
use base64::Engine as _;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Query key that is never part of a normalized request.
const CACHE_BUSTER: &str = "_";

/// A header with one or several values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::Single(value) => value,
            HeaderValue::Multiple(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderValue::Single(value) => vec![value.as_str()],
            HeaderValue::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// Request or response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Binary(Bytes),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    /// Text when the bytes are valid UTF-8, binary otherwise.
    pub fn from_bytes(bytes: Bytes) -> Self {
        match std::str::from_utf8(&bytes) {
            Ok(text) => Content::Text(text.to_string()),
            Err(_) => Content::Binary(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(text) => text.as_bytes(),
            Content::Binary(bytes) => bytes,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Content::Text(text) => Bytes::from(text.clone()),
            Content::Binary(bytes) => bytes.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn to_text_lossy(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Content::Text(text) => serializer.serialize_str(text),
            Content::Binary(bytes) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("encoding", "base64")?;
                map.serialize_entry(
                    "data",
                    &base64::engine::general_purpose::STANDARD.encode(bytes),
                )?;
                map.end()
            }
        }
    }
}

/// An inbound HTTP call as injectors see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedRequest {
    /// Path and query with the mount target stripped.
    pub url: String,
    /// Matched mount prefix (`/` if none).
    pub target: String,
    pub query: BTreeMap<String, String>,
    pub method: String,
    pub headers: BTreeMap<String, HeaderValue>,
    pub content: Content,
}

impl NormalizedRequest {
    /// Build from transport parts once the mount target is known.
    pub fn from_parts(parts: &Parts, body: Bytes, target: &str) -> Self {
        let path = strip_target(parts.uri.path(), target);
        let raw_query = parts.uri.query().unwrap_or("");

        let query: BTreeMap<String, String> = url::form_urlencoded::parse(raw_query.as_bytes())
            .filter(|(key, _)| key != CACHE_BUSTER)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        let kept: Vec<&str> = raw_query
            .split('&')
            .filter(|pair| !pair.is_empty() && !is_cache_buster(pair))
            .collect();
        let url = if kept.is_empty() {
            path
        } else {
            format!("{}?{}", path, kept.join("&"))
        };

        let mut headers = BTreeMap::new();
        for name in parts.headers.keys() {
            let values: Vec<String> = parts
                .headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            let value = if values.len() == 1 {
                HeaderValue::Single(values.into_iter().next().unwrap_or_default())
            } else {
                HeaderValue::Multiple(values)
            };
            headers.insert(name.as_str().to_string(), value);
        }

        Self {
            url,
            target: if target.is_empty() { "/".to_string() } else { target.to_string() },
            query,
            method: parts.method.as_str().to_string(),
            headers,
            content: Content::from_bytes(body),
        }
    }

    /// Path portion of `url` (without the query).
    pub fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or("/")
    }

    /// First value of a header, by lower-case name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(HeaderValue::first)
    }
}

fn strip_target(path: &str, target: &str) -> String {
    let rest = if target.is_empty() || target == "/" {
        path
    } else {
        path.strip_prefix(target.trim_end_matches('/')).unwrap_or(path)
    };

    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

fn is_cache_buster(pair: &str) -> bool {
    let key = pair.split('=').next().unwrap_or("");
    url::form_urlencoded::parse(key.as_bytes())
        .next()
        .map(|(k, _)| k == CACHE_BUSTER)
        .unwrap_or(false)
}
