//! Answers produced by injectors.
//!
//! # Responsibilities
//! - Canonical response shape (status, headers, content, provenance)
//! - Defaults applied before an answer leaves the server
//! - Conversion into an axum response
//!
//! # Design Decisions
//! - Invalid header names/values are skipped, never a panic
//! - Framing headers (content-length, transfer-encoding) are recomputed by hyper

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::model::request::Content;

pub const DEFAULT_CONTENT_TYPE: &str = "text/html";
pub const NO_INJECTOR: &str = "(none)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub code: u16,
    pub text: String,
}

impl Status {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            text: reason_phrase(code),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new(200)
    }
}

/// Fixture file that produced an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileTag {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<usize>,
}

/// Injector that produced an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InjectorTag {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileTag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub status: Status,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injector: Option<InjectorTag>,
}

impl Default for Answer {
    fn default() -> Self {
        Self {
            status: Status::default(),
            url: String::new(),
            redirect_url: None,
            headers: BTreeMap::new(),
            content: Content::default(),
            injector: None,
        }
    }
}

impl Answer {
    pub fn new(code: u16) -> Self {
        Self {
            status: Status::new(code),
            ..Self::default()
        }
    }

    /// The answer sent when no injector produced one.
    pub fn not_found(url: &str) -> Self {
        Self::new(404)
            .with_url(url)
            .with_header("content-type", "text/plain")
            .with_content("Not Found")
            .normalized()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_injector(mut self, name: &str) -> Self {
        self.injector = Some(InjectorTag {
            name: name.to_string(),
            file: None,
        });
        self
    }

    pub fn with_file(mut self, injector: &str, file: &str, entry: Option<usize>) -> Self {
        self.injector = Some(InjectorTag {
            name: injector.to_string(),
            file: Some(FileTag {
                name: file.to_string(),
                entry,
            }),
        });
        self
    }

    /// Apply the defaults every answer must carry.
    pub fn normalized(mut self) -> Self {
        if self.status.code == 0 {
            self.status.code = 200;
        }
        if self.status.text.is_empty() {
            self.status.text = reason_phrase(self.status.code);
        }
        self.headers
            .entry("content-type".to_string())
            .or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
        if self.injector.is_none() {
            self.injector = Some(InjectorTag {
                name: NO_INJECTOR.to_string(),
                file: None,
            });
        }
        self
    }

    pub fn injector_name(&self) -> &str {
        self.injector
            .as_ref()
            .map(|tag| tag.name.as_str())
            .unwrap_or(NO_INJECTOR)
    }
}

impl IntoResponse for Answer {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status.code).unwrap_or_else(|_| {
            tracing::debug!(code = self.status.code, "Invalid answer status, using 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });

        let mut response = Response::new(Body::from(self.content.to_bytes()));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                tracing::debug!(header = %name, "Skipping invalid header name");
                continue;
            };
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(_) => tracing::debug!(header = %name, "Skipping invalid header value"),
            }
        }

        if let Some(location) = &self.redirect_url {
            if !headers.contains_key(header::LOCATION) {
                if let Ok(value) = HeaderValue::from_str(location) {
                    headers.insert(header::LOCATION, value);
                }
            }
        }

        response
    }
}

fn reason_phrase(code: u16) -> String {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let answer = Answer::default().normalized();
        assert_eq!(answer.status.code, 200);
        assert_eq!(answer.status.text, "OK");
        assert_eq!(answer.headers["content-type"], "text/html");
        assert_eq!(answer.injector_name(), "(none)");
    }

    #[test]
    fn explicit_values_survive_normalization() {
        let answer = Answer::new(201)
            .with_header("Content-Type", "application/json")
            .with_injector("json")
            .normalized();
        assert_eq!(answer.status.text, "Created");
        assert_eq!(answer.headers["content-type"], "application/json");
        assert_eq!(answer.injector_name(), "json");
    }

    #[test]
    fn into_response_skips_bad_headers() {
        let answer = Answer::new(202)
            .with_header("x-ok", "yes")
            .with_header("bad header", "no")
            .with_header("content-length", "999")
            .with_content("body");
        let response = answer.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-ok"], "yes");
        assert!(response.headers().get("content-length").is_none());
    }

    #[test]
    fn not_found_is_plain_text() {
        let answer = Answer::not_found("/nothing");
        assert_eq!(answer.status.code, 404);
        assert_eq!(answer.headers["content-type"], "text/plain");
        assert_eq!(answer.injector_name(), "(none)");
    }
}
