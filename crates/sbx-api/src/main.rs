mod auth;
mod config;
mod dto;
mod error;
mod lifecycle;
mod protocol;
mod routes;
mod session;
mod state;
mod sweeper;
#[cfg(test)]
mod testing;
mod vault;

use std::sync::Arc;

use sbx_ssh::SshClient;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::lifecycle::{LifecycleManager, LifecycleSettings};
use crate::routes::api_router;
use crate::state::AppState;
use crate::sweeper::spawn_sweeper;
use crate::vault::CredentialVault;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "control plane exited");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    // Database
    let db = sbx_db::create_pool(&config.database_url).await?;
    sbx_db::run_migrations(&db).await?;

    // Machine providers
    let providers = sbx_infra::build_providers().await?;
    tracing::info!(mode = %providers.mode(), "machine providers ready");

    let ssh = SshClient::from_env()?;
    let vault = CredentialVault::from_env();

    let store = Arc::new(db.clone());
    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        &providers,
        LifecycleSettings {
            start_timeout: config.start_timeout,
            ssh_public_key: config.ssh_public_key.clone(),
        },
    ));

    // Background idle sweep
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        lifecycle.clone(),
        config.sweep_interval,
        config.idle_timeout,
        shutdown.clone(),
    );

    let state = AppState {
        projects: store.clone(),
        credentials: store,
        lifecycle,
        sessions: Arc::new(ssh),
        vault,
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "starting control plane API");

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
            signal.cancel();
        })
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "idle sweeper task failed");
    }
    db.close().await;
    tracing::info!("control plane stopped");

    served.map_err(Into::into)
}
