use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};

use crate::auth::UserId;
use crate::dto::{CredentialResponse, PutCredentialRequest};
use crate::error::ApiError;
use crate::state::AppState;

const MAX_PROVIDER_LEN: usize = 32;

fn validate_provider(provider: &str) -> Result<(), ApiError> {
    let valid = !provider.is_empty()
        && provider.len() <= MAX_PROVIDER_LEN
        && provider
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "provider must be 1 to {MAX_PROVIDER_LEN} lowercase letters, digits, '-' or '_'"
        )))
    }
}

pub async fn list_credentials(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
) -> Result<Json<Vec<CredentialResponse>>, ApiError> {
    let stored = state.credentials.list_credentials(user_id.0).await?;
    Ok(Json(stored.into_iter().map(CredentialResponse::from).collect()))
}

pub async fn put_credential(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(provider): Path<String>,
    Json(req): Json<PutCredentialRequest>,
) -> Result<Json<CredentialResponse>, ApiError> {
    let vault = state.vault.as_ref().ok_or(ApiError::VaultDisabled)?;
    validate_provider(&provider)?;

    let api_key = req.api_key.trim();
    if api_key.is_empty() {
        return Err(ApiError::BadRequest("api_key must not be empty".into()));
    }

    let ciphertext = vault.encrypt(api_key, user_id.0).map_err(|e| {
        tracing::error!(user_id = %user_id.0, error = %e, "credential encryption failed");
        ApiError::Internal("credential could not be stored".into())
    })?;
    let stored = state
        .credentials
        .put_credential(user_id.0, &provider, &ciphertext)
        .await?;

    tracing::info!(user_id = %user_id.0, provider = %provider, "credential stored");
    Ok(Json(stored.into()))
}

pub async fn delete_credential(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(provider): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state
        .credentials
        .delete_credential(user_id.0, &provider)
        .await?
    {
        tracing::info!(user_id = %user_id.0, provider = %provider, "credential deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}
