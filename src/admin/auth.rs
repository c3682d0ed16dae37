use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::admin::AdminState;

pub async fn admin_auth_middleware(
    State(state): State<AdminState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(api_key) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let authorized = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == api_key);

    if authorized {
        Ok(next.run(request).await)
    } else {
        tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated admin request");
        Err(StatusCode::UNAUTHORIZED)
    }
}
