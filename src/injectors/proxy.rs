//! Reverse proxy to the upstream mapped to the request's mount.
//!
//! # Responsibilities
//! - Resolve the upstream from the `targets` option, falling back to `map`
//! - Forward a curated header set, adjusted by `add_headers` / `remove_headers`
//! - Add static `inject_headers` and, optionally, `X-Forwarded-*`
//! - Return redirects as answers instead of following them
//! - Expose `ws://` / `wss://` upstream addresses for WebSocket bridging
//!
//! # Design Decisions
//! - Upstream failures are reported and decline, so later injectors still run
//! - Settings are swapped whole through ArcSwap; in-flight calls keep the old set

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::ServerContext;
use crate::injectors::options::{self, OptionField, OptionKind, OptionSet};
use crate::injectors::{Injector, InjectorError};
use crate::model::{Answer, Content, NormalizedRequest};

const NAME: &str = "proxy";

/// Request headers forwarded upstream by default.
pub const FORWARDED_HEADERS: &[&str] = &[
    "authorization",
    "accept",
    "content-type",
    "cookie",
    "accept-language",
    "user-agent",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
    "if-range",
    "pragma",
    "range",
];

/// Response headers that describe the upstream connection, not the answer.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

const TARGETS: &str = "targets";
const ADD_HEADERS: &str = "add_headers";
const REMOVE_HEADERS: &str = "remove_headers";
const INJECT_HEADERS: &str = "inject_headers";
const FORWARDED: &str = "forwarded";
const TIMEOUT_SECS: &str = "timeout_secs";

#[derive(Debug, Clone)]
struct ProxySettings {
    targets: BTreeMap<String, String>,
    add_headers: Vec<String>,
    remove_headers: Vec<String>,
    inject_headers: BTreeMap<String, String>,
    forwarded: bool,
    timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            add_headers: Vec::new(),
            remove_headers: Vec::new(),
            inject_headers: BTreeMap::new(),
            forwarded: false,
            timeout_secs: 30,
        }
    }
}

impl ProxySettings {
    /// Lower-cased names of the request headers to forward.
    fn forwarded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = FORWARDED_HEADERS.iter().map(|h| h.to_string()).collect();
        for extra in &self.add_headers {
            let extra = extra.to_ascii_lowercase();
            if !names.contains(&extra) {
                names.push(extra);
            }
        }
        names.retain(|name| {
            !self
                .remove_headers
                .iter()
                .any(|removed| removed.eq_ignore_ascii_case(name))
        });
        names
    }
}

/// Forwards requests to live upstreams.
pub struct ProxyInjector {
    active: AtomicBool,
    ctx: ServerContext,
    client: reqwest::Client,
    settings: ArcSwap<ProxySettings>,
}

impl ProxyInjector {
    pub fn new(ctx: &ServerContext) -> Result<Self, InjectorError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| InjectorError::Upstream(e.to_string()))?;

        Ok(Self {
            active: AtomicBool::new(true),
            ctx: ctx.clone(),
            client,
            settings: ArcSwap::from_pointee(ProxySettings::default()),
        })
    }

    /// Upstream address for a mount target.
    fn upstream_for(&self, settings: &ProxySettings, target: &str) -> Option<String> {
        settings
            .targets
            .get(target)
            .cloned()
            .or_else(|| self.ctx.upstream(target).map(str::to_string))
    }

    fn build_request(
        &self,
        settings: &ProxySettings,
        request: &NormalizedRequest,
        url: &str,
    ) -> Result<reqwest::RequestBuilder, InjectorError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| InjectorError::Upstream(format!("invalid method: {e}")))?;
        let mut builder = self
            .client
            .request(method.clone(), url)
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)));

        for name in settings.forwarded_names() {
            if let Some(value) = request.headers.get(&name) {
                for value in value.values() {
                    builder = builder.header(name.as_str(), value);
                }
            }
        }
        for (name, value) in &settings.inject_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if settings.forwarded {
            let proto = if self.ctx.config().listener.ssl.is_some() {
                "https"
            } else {
                "http"
            };
            if let Some(host) = request.header("host") {
                builder = builder.header("x-forwarded-host", host);
            }
            builder = builder.header("x-forwarded-proto", proto);
            if request.target != "/" {
                builder = builder.header("x-forwarded-prefix", request.target.as_str());
            }
            if let Some(client) = request
                .header("x-forwarded-for")
                .or_else(|| request.header("x-real-ip"))
            {
                builder = builder.header("x-forwarded-for", client);
            }
        }

        if method != reqwest::Method::GET && method != reqwest::Method::HEAD && !request.content.is_empty() {
            builder = builder.body(request.content.to_bytes());
        }
        Ok(builder)
    }

    async fn forward(
        &self,
        settings: &ProxySettings,
        request: &NormalizedRequest,
        upstream: &str,
    ) -> Result<Answer, InjectorError> {
        let url = format!("{}{}", upstream.trim_end_matches('/'), request.url);
        let response = self
            .build_request(settings, request, &url)?
            .send()
            .await
            .map_err(|e| InjectorError::Upstream(e.to_string()))?;

        let mut answer = Answer::new(response.status().as_u16());

        for name in response.headers().keys() {
            let lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lower.as_str()) {
                continue;
            }
            let values: Vec<String> = response
                .headers()
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            if lower == "location" {
                if let Some(location) = values.into_iter().next() {
                    answer.redirect_url = Some(rewrite_location(&location, upstream, &request.target));
                }
                continue;
            }
            answer.headers.insert(lower, values.join(", "));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| InjectorError::Upstream(e.to_string()))?;
        answer.content = Content::from_bytes(body);
        answer.url = url;
        Ok(answer.with_injector(NAME))
    }

    fn settings_value(settings: &ProxySettings) -> OptionSet {
        let mut set = OptionSet::new();
        set.insert(
            TARGETS.to_string(),
            OptionField::new(
                OptionKind::Json,
                "Targets",
                "Mount target to upstream address overrides",
                json!(settings.targets),
            ),
        );
        set.insert(
            ADD_HEADERS.to_string(),
            OptionField::new(
                OptionKind::Json,
                "Add headers",
                "Request headers forwarded in addition to the defaults",
                json!(settings.add_headers),
            ),
        );
        set.insert(
            REMOVE_HEADERS.to_string(),
            OptionField::new(
                OptionKind::Json,
                "Remove headers",
                "Default request headers that are not forwarded",
                json!(settings.remove_headers),
            ),
        );
        set.insert(
            INJECT_HEADERS.to_string(),
            OptionField::new(
                OptionKind::Json,
                "Inject headers",
                "Static headers added to every upstream request",
                json!(settings.inject_headers),
            ),
        );
        set.insert(
            FORWARDED.to_string(),
            OptionField::new(
                OptionKind::Checkbox,
                "X-Forwarded headers",
                "Send X-Forwarded-Host, -Proto, -Prefix and -For",
                json!(settings.forwarded),
            ),
        );
        set.insert(
            TIMEOUT_SECS.to_string(),
            OptionField::new(
                OptionKind::Text,
                "Timeout",
                "Upstream request timeout in seconds",
                json!(settings.timeout_secs),
            ),
        );
        set
    }
}

/// Map an absolute upstream redirect back under the mount target.
fn rewrite_location(location: &str, upstream: &str, target: &str) -> String {
    let base = upstream.trim_end_matches('/');
    match location.strip_prefix(base) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') => {
            let prefix = if target == "/" { "" } else { target.trim_end_matches('/') };
            let rest = if rest.is_empty() { "/" } else { rest };
            format!("{prefix}{rest}")
        }
        _ => location.to_string(),
    }
}

/// `http(s)://` upstream address as the matching `ws(s)://` address.
fn websocket_address(address: &str) -> Option<String> {
    let mut parsed = url::Url::parse(address).ok()?;
    let scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return None,
    };
    parsed.set_scheme(scheme).ok()?;
    Some(parsed.to_string())
}

#[async_trait]
impl Injector for ProxyInjector {
    fn name(&self) -> &str {
        NAME
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    async fn handle(&self, request: &NormalizedRequest) -> Option<Answer> {
        let settings: Arc<ProxySettings> = self.settings.load_full();
        let upstream = self.upstream_for(&settings, &request.target)?;

        match self.forward(&settings, request, &upstream).await {
            Ok(answer) => {
                tracing::debug!(
                    method = %request.method,
                    url = %answer.url,
                    status = answer.status.code,
                    "Proxied request"
                );
                Some(answer)
            }
            Err(e) => {
                tracing::warn!(method = %request.method, upstream = %upstream, error = %e, "Upstream request failed");
                self.ctx.error(
                    NAME,
                    format!("{} {}{}: {e}", request.method, upstream, request.url),
                );
                None
            }
        }
    }

    fn options(&self) -> OptionSet {
        Self::settings_value(&self.settings.load())
    }

    fn set_options(&self, options: &Map<String, Value>) -> Result<(), InjectorError> {
        let mut next = ProxySettings::clone(&self.settings.load());
        if let Some(value) = options.get(TARGETS) {
            next.targets = options::as_string_map(TARGETS, value)?;
        }
        if let Some(value) = options.get(ADD_HEADERS) {
            next.add_headers = options::as_string_list(ADD_HEADERS, value)?;
        }
        if let Some(value) = options.get(REMOVE_HEADERS) {
            next.remove_headers = options::as_string_list(REMOVE_HEADERS, value)?;
        }
        if let Some(value) = options.get(INJECT_HEADERS) {
            next.inject_headers = options::as_string_map(INJECT_HEADERS, value)?;
        }
        if let Some(value) = options.get(FORWARDED) {
            next.forwarded = options::as_bool(FORWARDED, value)?;
        }
        if let Some(value) = options.get(TIMEOUT_SECS) {
            next.timeout_secs = options::as_u64(TIMEOUT_SECS, value)?;
        }
        self.settings.store(Arc::new(next));
        Ok(())
    }

    fn websocket_upstream(&self, request: &NormalizedRequest) -> Option<String> {
        let settings = self.settings.load();
        let address = websocket_address(&self.upstream_for(&settings, &request.target)?)?;
        Some(format!("{}{}", address.trim_end_matches('/'), request.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountTarget, ServerConfig};
    use crate::model::HeaderValue;
    use axum::http::HeaderMap;
    use axum::routing::any;
    use axum::Router;

    async fn echo_backend() -> String {
        async fn echo(headers: HeaderMap, uri: axum::http::Uri) -> axum::Json<Value> {
            let headers: BTreeMap<String, String> = headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            axum::Json(json!({"uri": uri.to_string(), "headers": headers}))
        }
        async fn moved() -> axum::response::Response {
            axum::response::Response::builder()
                .status(302)
                .header("location", "/elsewhere")
                .body(axum::body::Body::empty())
                .unwrap()
        }

        let app = Router::new()
            .route("/v1/moved", any(moved))
            .route("/v1/{*rest}", any(echo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn context(upstream: &str) -> ServerContext {
        let mut config = ServerConfig::default();
        config
            .map
            .insert("/api".into(), MountTarget::Address(upstream.to_string()));
        config.map.insert("/mock".into(), MountTarget::Disabled(false));
        ServerContext::new(config)
    }

    fn request(url: &str, target: &str, headers: &[(&str, &str)]) -> NormalizedRequest {
        NormalizedRequest {
            url: url.into(),
            target: target.into(),
            query: BTreeMap::new(),
            method: "GET".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), HeaderValue::Single(v.to_string())))
                .collect(),
            content: Content::default(),
        }
    }

    #[tokio::test]
    async fn forwards_curated_headers() {
        let upstream = echo_backend().await;
        let injector = ProxyInjector::new(&context(&upstream)).unwrap();

        let mut settings = Map::new();
        settings.insert("remove_headers".into(), json!(["cookie"]));
        settings.insert("add_headers".into(), json!(["X-Trace"]));
        settings.insert("inject_headers".into(), json!({"x-env": "test"}));
        settings.insert("forwarded".into(), json!(true));
        injector.set_options(&settings).unwrap();

        let answer = injector
            .handle(&request(
                "/users?page=2",
                "/api",
                &[
                    ("accept", "application/json"),
                    ("cookie", "secret=1"),
                    ("x-trace", "abc"),
                    ("x-private", "no"),
                    ("host", "localhost:8080"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(answer.status.code, 200);
        assert_eq!(answer.injector_name(), "proxy");
        let body: Value = serde_json::from_str(&answer.content.to_text_lossy()).unwrap();
        assert_eq!(body["uri"], "/v1/users?page=2");
        let headers = &body["headers"];
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers["x-trace"], "abc");
        assert_eq!(headers["x-env"], "test");
        assert_eq!(headers["x-forwarded-host"], "localhost:8080");
        assert_eq!(headers["x-forwarded-prefix"], "/api");
        assert!(headers.get("cookie").is_none());
        assert!(headers.get("x-private").is_none());
    }

    #[tokio::test]
    async fn redirects_are_returned_not_followed() {
        let upstream = echo_backend().await;
        let injector = ProxyInjector::new(&context(&upstream)).unwrap();
        let answer = injector.handle(&request("/moved", "/api", &[])).await.unwrap();
        assert_eq!(answer.status.code, 302);
        assert_eq!(answer.redirect_url.as_deref(), Some("/elsewhere"));
        assert!(!answer.headers.contains_key("location"));
    }

    #[tokio::test]
    async fn failures_and_unmapped_targets_decline() {
        let ctx = context("http://127.0.0.1:1");
        let mut rx = ctx.bus().subscribe();
        let injector = ProxyInjector::new(&ctx).unwrap();

        assert!(injector.handle(&request("/x", "/mock", &[])).await.is_none());
        assert!(injector.handle(&request("/x", "/api", &[])).await.is_none());
        match rx.try_recv().unwrap() {
            crate::events::Event::Error { source, .. } => assert_eq!(source, "proxy"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn targets_option_overrides_map_and_feeds_websockets() {
        let injector = ProxyInjector::new(&context("https://backend.test/v1")).unwrap();
        assert_eq!(
            injector.websocket_upstream(&request("/socket?x=1", "/api", &[])).as_deref(),
            Some("wss://backend.test/v1/socket?x=1")
        );
        assert!(injector.websocket_upstream(&request("/s", "/mock", &[])).is_none());

        let mut settings = Map::new();
        settings.insert("targets".into(), json!({"/mock": "http://localhost:9000"}));
        injector.set_options(&settings).unwrap();
        assert_eq!(
            injector.websocket_upstream(&request("/s", "/mock", &[])).as_deref(),
            Some("ws://localhost:9000/s")
        );
        assert_eq!(injector.options(), injector.options());

        settings.insert("timeout_secs".into(), json!("soon"));
        assert!(injector.set_options(&settings).is_err());
    }

    #[test]
    fn locations_under_the_upstream_are_mapped_back() {
        assert_eq!(
            rewrite_location("http://up/v1/login?next=1", "http://up/v1", "/api"),
            "/api/login?next=1"
        );
        assert_eq!(rewrite_location("http://up/v1", "http://up/v1/", "/"), "/");
        assert_eq!(
            rewrite_location("https://other/x", "http://up/v1", "/api"),
            "https://other/x"
        );
    }
}
