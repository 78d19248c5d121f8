//! Permissive CORS for a development server.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;

const DEFAULT_METHODS: &str = "GET, HEAD, PUT, PATCH, POST, DELETE, OPTIONS";
const MAX_AGE: Duration = Duration::from_secs(86_400);

/// `204` answering a preflight with whatever the browser asked for.
pub fn preflight(headers: &HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;

    let origin = headers
        .get(header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    let methods = headers
        .get(header::ACCESS_CONTROL_REQUEST_METHOD)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_METHODS));
    let allowed_headers = headers
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    let out = response.headers_mut();
    out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    out.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
    out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allowed_headers);
    out.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    out.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(MAX_AGE.as_secs()));
    out.insert(header::VARY, HeaderValue::from_static("Origin"));
    response
}

/// Mirror the request origin onto a dispatched response.
pub fn allow_origin(response: &mut Response, origin: Option<&HeaderValue>) {
    let value = origin
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    if origin.is_some() {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_echoes_the_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://app.test"));
        headers.insert(
            header::ACCESS_CONTROL_REQUEST_METHOD,
            HeaderValue::from_static("PUT"),
        );
        headers.insert(
            header::ACCESS_CONTROL_REQUEST_HEADERS,
            HeaderValue::from_static("x-token"),
        );

        let response = preflight(&headers);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let out = response.headers();
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://app.test");
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_METHODS], "PUT");
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_HEADERS], "x-token");
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(out[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[test]
    fn preflight_defaults_are_permissive() {
        let response = preflight(&HeaderMap::new());
        let out = response.headers();
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_METHODS], DEFAULT_METHODS);
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_HEADERS], "*");
    }

    #[test]
    fn dispatched_responses_mirror_origin() {
        let mut response = Response::new(Body::empty());
        let origin = HeaderValue::from_static("http://app.test");
        allow_origin(&mut response, Some(&origin));
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://app.test"
        );
    }

    #[test]
    fn dispatched_responses_without_origin_allow_any() {
        let mut response = Response::new(Body::empty());
        allow_origin(&mut response, None);
        let out = response.headers();
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(!out.contains_key(header::ACCESS_CONTROL_ALLOW_CREDENTIALS));
    }
}
