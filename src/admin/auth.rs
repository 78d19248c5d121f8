use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};

use crate::admin::handlers::ApiError;
use crate::admin::AdminState;

/// Browsers cannot set headers on a WebSocket handshake, so the key may
/// also come as `?token=`.
const TOKEN_PARAM: &str = "token";

pub async fn admin_auth_middleware(
    State(state): State<AdminState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.ctx.config().admin.api_key.as_str();

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let token = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == TOKEN_PARAM)
            .map(|(_, value)| value.into_owned())
    });

    let authorized = bearer.is_some_and(|key| key == expected)
        || token.as_deref().is_some_and(|key| key == expected);
    if !authorized {
        tracing::debug!(uri = %request.uri(), "Management request rejected");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}
