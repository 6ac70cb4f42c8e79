pub mod credentials;
pub mod projects;
pub mod sessions;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        // Projects
        .route(
            "/projects",
            post(projects::create_project).get(projects::list_projects),
        )
        .route(
            "/projects/{id}",
            get(projects::get_project).delete(projects::delete_project),
        )
        .route("/projects/{id}/start", post(projects::start_project))
        .route("/projects/{id}/stop", post(projects::stop_project))
        // Sessions
        .route("/projects/{id}/terminal", get(sessions::terminal))
        .route("/projects/{id}/agent", get(sessions::agent))
        // Credentials
        .route("/credentials", get(credentials::list_credentials))
        .route(
            "/credentials/{provider}",
            put(credentials::put_credential).delete(credentials::delete_credential),
        )
        // Auth middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().merge(authed).with_state(state)
}
