use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use sbx_db::models::{NewProject, Project};
use sbx_infra::hardware::{FieldError, ValidationErrors};
use uuid::Uuid;

use crate::auth::UserId;
use crate::dto::{CreateProjectRequest, DeleteProjectParams, ProjectResponse};
use crate::error::ApiError;
use crate::state::AppState;

const MAX_NAME_LEN: usize = 64;

/// Load a project owned by `user_id`. Other users' projects look missing.
pub(crate) async fn owned_project(
    state: &AppState,
    user_id: UserId,
    id: Uuid,
) -> Result<Project, ApiError> {
    match state.projects.get_project(id).await? {
        Some(project) if project.user_id == user_id.0 => Ok(project),
        _ => Err(ApiError::NotFound),
    }
}

pub async fn create_project(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectResponse>), ApiError> {
    let name = req.name.trim();
    let hardware = req.hardware.validate();

    let mut errors = match &hardware {
        Ok(_) => Vec::new(),
        Err(ValidationErrors(fields)) => fields.clone(),
    };
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        errors.insert(
            0,
            FieldError {
                field: "name",
                message: format!("must be 1 to {MAX_NAME_LEN} characters"),
            },
        );
    }
    let hardware = match hardware {
        Ok(hw) if errors.is_empty() => hw,
        _ => return Err(ApiError::Validation(ValidationErrors(errors))),
    };

    let project = state
        .projects
        .insert_project(&NewProject {
            user_id: user_id.0,
            name: name.to_string(),
            cpu_kind: hardware.cpu_kind.as_str().into(),
            cpus: hardware.cpus as i32,
            memory_mb: hardware.memory_mb as i32,
            volume_size_gb: hardware.volume_size_gb as i32,
            gpu_kind: hardware.gpu_kind.map(|g| g.as_str().to_string()),
        })
        .await?;

    tracing::info!(project_id = %project.id, user_id = %user_id.0, "project created");
    Ok((StatusCode::CREATED, Json(project.into())))
}

pub async fn list_projects(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
) -> Result<Json<Vec<ProjectResponse>>, ApiError> {
    let projects = state.projects.list_projects(user_id.0).await?;
    Ok(Json(projects.into_iter().map(ProjectResponse::from).collect()))
}

pub async fn get_project(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectResponse>, ApiError> {
    let project = owned_project(&state, user_id, id).await?;
    Ok(Json(project.into()))
}

pub async fn start_project(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectResponse>, ApiError> {
    owned_project(&state, user_id, id).await?;
    let project = state.lifecycle.start(id).await?;
    Ok(Json(project.into()))
}

pub async fn stop_project(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectResponse>, ApiError> {
    owned_project(&state, user_id, id).await?;
    let project = state.lifecycle.stop(id).await?;
    Ok(Json(project.into()))
}

pub async fn delete_project(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteProjectParams>,
) -> Result<StatusCode, ApiError> {
    owned_project(&state, user_id, id).await?;
    state.lifecycle.delete(id, params.delete_volume).await?;
    Ok(StatusCode::NO_CONTENT)
}
