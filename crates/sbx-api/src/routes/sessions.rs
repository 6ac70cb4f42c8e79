use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::Extension;
use sbx_ssh::ProcessConfig;
use uuid::Uuid;

use crate::auth::UserId;
use crate::dto::TerminalParams;
use crate::error::ApiError;
use crate::routes::projects::owned_project;
use crate::session::{agent_bridge, agent_env, terminal_bridge};
use crate::state::AppState;

/// Interactive shell on the project machine.
pub async fn terminal(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(id): Path<Uuid>,
    Query(params): Query<TerminalParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let project = owned_project(&state, user_id, id).await?;
    let endpoint = state.lifecycle.endpoint(&project).await?;
    state.lifecycle.touch(id).await?;

    let config = ProcessConfig::terminal(state.config.shell_command.clone(), params.cols, params.rows);
    let opener = Arc::clone(&state.sessions);
    Ok(ws.on_upgrade(move |socket| terminal_bridge(socket, opener, endpoint, config, id)))
}

/// Agent conversation over JSON lines.
pub async fn agent(
    State(state): State<AppState>,
    Extension(user_id): Extension<UserId>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let project = owned_project(&state, user_id, id).await?;
    let endpoint = state.lifecycle.endpoint(&project).await?;
    state.lifecycle.touch(id).await?;

    let env = agent_env(&*state.credentials, state.vault.as_ref(), user_id.0, id).await?;
    let config = ProcessConfig::agent(state.config.agent_command.clone()).with_env(env);
    let agent_name = state.config.agent_name().to_string();
    let opener = Arc::clone(&state.sessions);
    let lifecycle = Arc::clone(&state.lifecycle);
    Ok(ws.on_upgrade(move |socket| {
        agent_bridge(socket, opener, endpoint, config, agent_name, lifecycle, id)
    }))
}
