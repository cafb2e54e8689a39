//! `X-Admin-Token` check for every route except `/health`.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use super::handlers::AppState;
use crate::tracking::constant_time_compare;

pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    match (provided, state.admin_token.as_deref()) {
        (Some(provided), Some(expected)) if constant_time_compare(provided, expected) => {}
        (None, Some(_)) => {
            warn!(path = %request.uri().path(), "admin_auth_missing");
            return unauthorized();
        }
        (Some(_), Some(_)) => {
            warn!(path = %request.uri().path(), "admin_auth_invalid");
            return unauthorized();
        }
        (_, None) => {
            // No token configured, allow through
        }
    }

    next.run(request).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}
