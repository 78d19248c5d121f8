use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::admin::AdminState;
use crate::injectors::{Injector, InjectorError, OptionSet};
use crate::recorder::{RecordedError, RecordedMessage, RecordedRequest};
use crate::websocket::SessionSummary;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<InjectorError> for ApiError {
    fn from(e: InjectorError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub mounts: Vec<String>,
    pub injectors: Vec<String>,
    pub requests: usize,
    pub errors: usize,
    pub messages: usize,
    pub sessions: usize,
}

#[derive(Serialize)]
pub struct InjectorView {
    pub name: String,
    pub active: bool,
    pub options: OptionSet,
}

impl InjectorView {
    fn of(injector: &Arc<dyn Injector>) -> Self {
        Self {
            name: injector.name().to_string(),
            active: injector.is_active(),
            options: injector.options(),
        }
    }
}

#[derive(Deserialize)]
pub struct ActiveFlag {
    pub active: bool,
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid record id '{raw}'")))
}

fn injector(state: &AdminState, name: &str) -> Result<Arc<dyn Injector>, ApiError> {
    state
        .chain
        .get(name)
        .ok_or_else(|| ApiError::NotFound(format!("injector '{name}'")))
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        mounts: state.ctx.mounts().map(str::to_string).collect(),
        injectors: state.chain.names(),
        requests: state.recorder.requests().len(),
        errors: state.recorder.errors().len(),
        messages: state.recorder.messages().len(),
        sessions: state.sessions.len(),
    })
}

pub async fn list_requests(State(state): State<AdminState>) -> Json<Vec<RecordedRequest>> {
    Json(state.recorder.requests())
}

pub async fn get_request(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<RecordedRequest>, ApiError> {
    let id = parse_id(&id)?;
    state
        .recorder
        .find_request(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("request {id}")))
}

pub async fn list_errors(State(state): State<AdminState>) -> Json<Vec<RecordedError>> {
    Json(state.recorder.errors())
}

pub async fn list_messages(State(state): State<AdminState>) -> Json<Vec<RecordedMessage>> {
    Json(state.recorder.messages())
}

pub async fn clear_records(State(state): State<AdminState>) -> StatusCode {
    state.recorder.clear();
    tracing::info!("Recorder cleared");
    StatusCode::NO_CONTENT
}

pub async fn list_injectors(State(state): State<AdminState>) -> Json<Vec<InjectorView>> {
    Json(state.chain.iter().map(InjectorView::of).collect())
}

pub async fn get_injector(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<InjectorView>, ApiError> {
    Ok(Json(InjectorView::of(&injector(&state, &name)?)))
}

pub async fn set_injector_options(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(options): Json<Map<String, Value>>,
) -> Result<Json<InjectorView>, ApiError> {
    let injector = injector(&state, &name)?;
    // Directory changes rescan and recompile fixtures synchronously.
    let target = Arc::clone(&injector);
    let keys: Vec<String> = options.keys().cloned().collect();
    tokio::task::spawn_blocking(move || target.set_options(&options))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    tracing::info!(injector = %name, ?keys, "Injector options updated");
    Ok(Json(InjectorView::of(&injector)))
}

pub async fn set_injector_active(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(flag): Json<ActiveFlag>,
) -> Result<Json<InjectorView>, ApiError> {
    let injector = injector(&state, &name)?;
    injector.set_active(flag.active);
    tracing::info!(injector = %name, active = flag.active, "Injector toggled");
    Ok(Json(InjectorView::of(&injector)))
}

pub async fn list_sessions(State(state): State<AdminState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}

pub async fn dispose_session(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.dispose(&id) {
        tracing::info!(session = %id, "Session disposed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("session '{id}'")))
    }
}

pub async fn event_feed(State(state): State<AdminState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

/// Push every bus event to the socket as JSON until either side goes away.
async fn stream_events(socket: WebSocket, state: AdminState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.ctx.bus().subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::debug!(error = %e, "Unserializable event skipped");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event feed lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("Event feed closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::setup_admin_router;
    use crate::config::{ServerConfig, ServerContext};
    use crate::injectors::{InjectorChain, JsonInjector, StoreInjector};
    use crate::recorder::Recorder;
    use crate::websocket::{SessionInfo, SessionRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Instant;
    use tower::ServiceExt;

    fn state() -> AdminState {
        let mut config = ServerConfig::default();
        config.admin.api_key = "secret".into();
        let ctx = ServerContext::new(config);
        let chain = InjectorChain::new(vec![
            Arc::new(StoreInjector::new(&ctx)) as Arc<dyn Injector>,
            Arc::new(JsonInjector::new(&ctx, Vec::new())),
        ]);
        AdminState {
            recorder: Arc::new(Recorder::new(&ctx.config().recorder, ctx.bus().clone())),
            sessions: Arc::new(SessionRegistry::new()),
            chain,
            ctx,
            started: Instant::now(),
        }
    }

    fn call(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer secret");
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let response = setup_admin_router(state())
            .oneshot(Request::builder().uri("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_lists_injectors() {
        let response = setup_admin_router(state())
            .oneshot(call("GET", "/admin/status", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["injectors"], serde_json::json!(["store", "json"]));
        assert_eq!(body["status"], "operational");
    }

    #[tokio::test]
    async fn toggling_an_injector() {
        let state = state();
        let router = setup_admin_router(state.clone());
        let response = router
            .oneshot(call(
                "PUT",
                "/admin/injectors/store/active",
                Some(serde_json::json!({"active": false})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["active"], false);
        assert!(!state.chain.get("store").unwrap().is_active());
    }

    #[tokio::test]
    async fn invalid_options_are_bad_requests() {
        let response = setup_admin_router(state())
            .oneshot(call(
                "PUT",
                "/admin/injectors/store",
                Some(serde_json::json!({"pattern": "log-%!.jsonl"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_things_are_not_found() {
        let router = setup_admin_router(state());
        let missing_injector = router
            .clone()
            .oneshot(call("GET", "/admin/injectors/nope", None))
            .await
            .unwrap();
        assert_eq!(missing_injector.status(), StatusCode::NOT_FOUND);

        let missing_request = router
            .clone()
            .oneshot(call("GET", &format!("/admin/requests/{}", Uuid::new_v4()), None))
            .await
            .unwrap();
        assert_eq!(missing_request.status(), StatusCode::NOT_FOUND);

        let bad_id = router
            .oneshot(call("GET", "/admin/requests/xyz", None))
            .await
            .unwrap();
        assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sessions_can_be_disposed() {
        let state = state();
        let mut guard = state.sessions.register(SessionInfo::new("ws-9", "/chat", "/"));
        let router = setup_admin_router(state.clone());

        let listed = json(
            router
                .clone()
                .oneshot(call("GET", "/admin/sessions", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed[0]["id"], "ws-9");

        let response = router
            .oneshot(call("DELETE", "/admin/sessions/ws-9", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        tokio::time::timeout(std::time::Duration::from_secs(1), guard.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn changing_directories_reloads_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"request": {"url": "/a"}, "response": {"content": "a"}}"#,
        )
        .unwrap();

        let state = state();
        let response = setup_admin_router(state.clone())
            .oneshot(call(
                "PUT",
                "/admin/injectors/json",
                Some(serde_json::json!({"directories": [dir.path().to_string_lossy()]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let files = json(response).await["options"]["entries"]["value"].clone();
        assert_eq!(files.as_array().unwrap().len(), 1);
        assert!(files[0]["file"].as_str().unwrap().ends_with("a.json"));
        state.chain.dispose();
    }
}
