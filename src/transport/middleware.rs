use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{common::errors::ApiError, server::AppState};

/// Requires the configured password in `Authorization`. Open when no
/// password is set.
pub async fn check_auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = state.config.server.password.as_deref() else {
        return next.run(req).await;
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok());

    let message = match auth_header {
        Some(auth) if auth == expected => return next.run(req).await,
        Some(_) => "Invalid password",
        None => "Missing Authorization header",
    };
    warn!("REST Authorization failed: {}", message);
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::unauthorized(message, req.uri().path())),
    )
        .into_response()
}

pub async fn add_response_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        "Partyline-Version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}
