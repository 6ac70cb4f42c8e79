use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Extracted user ID from `X-User-Id` header, injected into extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub Uuid);

/// Middleware that validates `Authorization: Bearer <key>` against the
/// configured `CONTROL_PLANE_API_KEY` and extracts `X-User-Id`.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    match validate_request(&state.config.control_plane_api_key, &req) {
        Ok(user_id) => {
            req.extensions_mut().insert(user_id);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

fn validate_request(api_key: &str, req: &Request) -> Result<UserId, ApiError> {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if token != api_key {
        return Err(ApiError::Unauthorized);
    }

    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(ApiError::BadRequest(
            "missing or invalid X-User-Id header".into(),
        ))?;

    Ok(UserId(user_id))
}
