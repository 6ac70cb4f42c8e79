pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use models::{NewProject, Project, ProjectStatus, StoredCredential};

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Project persistence as seen by the lifecycle manager.
#[async_trait]
pub trait ProjectStore: Send + Sync + 'static {
    async fn insert_project(&self, project: &NewProject) -> sqlx::Result<Project>;
    async fn get_project(&self, id: Uuid) -> sqlx::Result<Option<Project>>;
    async fn list_projects(&self, user_id: Uuid) -> sqlx::Result<Vec<Project>>;
    async fn transition(
        &self,
        id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
    ) -> sqlx::Result<Option<Project>>;
    async fn set_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> sqlx::Result<()>;
    async fn set_provider_refs(
        &self,
        id: Uuid,
        machine_id: Option<&str>,
        volume_id: Option<&str>,
    ) -> sqlx::Result<()>;
    async fn mark_running(&self, id: Uuid, machine_address: &str) -> sqlx::Result<()>;
    async fn touch(&self, id: Uuid) -> sqlx::Result<()>;
    async fn list_idle(&self, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<Project>>;
    async fn delete_project(&self, id: Uuid) -> sqlx::Result<()>;
}

/// Encrypted credential persistence.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn put_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        ciphertext: &str,
    ) -> sqlx::Result<StoredCredential>;
    async fn list_credentials(&self, user_id: Uuid) -> sqlx::Result<Vec<StoredCredential>>;
    async fn delete_credential(&self, user_id: Uuid, provider: &str) -> sqlx::Result<bool>;
}

#[async_trait]
impl ProjectStore for PgPool {
    async fn insert_project(&self, project: &NewProject) -> sqlx::Result<Project> {
        Project::insert(self, project).await
    }

    async fn get_project(&self, id: Uuid) -> sqlx::Result<Option<Project>> {
        Project::get_by_id(self, id).await
    }

    async fn list_projects(&self, user_id: Uuid) -> sqlx::Result<Vec<Project>> {
        Project::list_for_user(self, user_id).await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
    ) -> sqlx::Result<Option<Project>> {
        Project::transition(self, id, from, to).await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> sqlx::Result<()> {
        Project::set_status(self, id, status, error_message).await
    }

    async fn set_provider_refs(
        &self,
        id: Uuid,
        machine_id: Option<&str>,
        volume_id: Option<&str>,
    ) -> sqlx::Result<()> {
        Project::update_provider_refs(self, id, machine_id, volume_id).await
    }

    async fn mark_running(&self, id: Uuid, machine_address: &str) -> sqlx::Result<()> {
        Project::mark_running(self, id, machine_address).await
    }

    async fn touch(&self, id: Uuid) -> sqlx::Result<()> {
        Project::touch(self, id).await
    }

    async fn list_idle(&self, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<Project>> {
        Project::list_idle(self, cutoff).await
    }

    async fn delete_project(&self, id: Uuid) -> sqlx::Result<()> {
        Project::delete(self, id).await
    }
}

#[async_trait]
impl CredentialStore for PgPool {
    async fn put_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        ciphertext: &str,
    ) -> sqlx::Result<StoredCredential> {
        StoredCredential::upsert(self, user_id, provider, ciphertext).await
    }

    async fn list_credentials(&self, user_id: Uuid) -> sqlx::Result<Vec<StoredCredential>> {
        StoredCredential::list_for_user(self, user_id).await
    }

    async fn delete_credential(&self, user_id: Uuid, provider: &str) -> sqlx::Result<bool> {
        StoredCredential::delete(self, user_id, provider).await
    }
}
