use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sbx_infra::hardware::ValidationErrors;

use crate::lifecycle::LifecycleError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    #[error("credential storage is disabled")]
    VaultDisabled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("infra error: {0}")]
    Infra(#[from] sbx_infra::Error),

    #[error("session error: {0}")]
    Session(#[from] sbx_ssh::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(_) => Self::NotFound,
            e @ (LifecycleError::InvalidState { .. } | LifecycleError::NoMachine(_)) => {
                Self::Conflict(e.to_string())
            }
            LifecycleError::InvalidHardware(e) => Self::Validation(e),
            LifecycleError::Infra(e) if e.is_timeout() => Self::Timeout(e.to_string()),
            LifecycleError::Infra(e) => Self::Infra(e),
            LifecycleError::Database(e) => Self::Database(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::VaultDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Infra(_) | ApiError::Session(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }

        let body = match &self {
            ApiError::Validation(errors) => serde_json::json!({
                "error": "invalid hardware configuration",
                "fields": errors.0,
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, axum::Json(body)).into_response()
    }
}
