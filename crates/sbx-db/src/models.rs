use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

// ── Project ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "project_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    pub error_message: Option<String>,
    pub cpu_kind: String,
    pub cpus: i32,
    pub memory_mb: i32,
    pub volume_size_gb: i32,
    pub gpu_kind: Option<String>,
    pub fly_machine_id: Option<String>,
    pub fly_volume_id: Option<String>,
    pub machine_address: Option<String>,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub user_id: Uuid,
    pub name: String,
    pub cpu_kind: String,
    pub cpus: i32,
    pub memory_mb: i32,
    pub volume_size_gb: i32,
    pub gpu_kind: Option<String>,
}

impl Project {
    pub async fn insert(pool: &PgPool, project: &NewProject) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO projects (user_id, name, cpu_kind, cpus, memory_mb, volume_size_gb, gpu_kind)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(project.user_id)
        .bind(&project.name)
        .bind(&project.cpu_kind)
        .bind(project.cpus)
        .bind(project.memory_mb)
        .bind(project.volume_size_gb)
        .bind(&project.gpu_kind)
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM projects WHERE user_id = $1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(pool)
            .await
    }

    /// Move to `to` only if the current status is one of `from`. Returns the
    /// updated row, or `None` when the status did not match.
    pub async fn transition(
        pool: &PgPool,
        id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
    ) -> sqlx::Result<Option<Self>> {
        let from: Vec<&str> = from.iter().map(ProjectStatus::as_str).collect();
        sqlx::query_as(
            r#"UPDATE projects
               SET status = $1, error_message = NULL
               WHERE id = $2 AND status::text = ANY($3)
               RETURNING *"#,
        )
        .bind(to)
        .bind(id)
        .bind(&from)
        .fetch_optional(pool)
        .await
    }

    pub async fn set_status(
        pool: &PgPool,
        id: Uuid,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE projects SET status = $1, error_message = $2 WHERE id = $3")
            .bind(status)
            .bind(error_message)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update_provider_refs(
        pool: &PgPool,
        id: Uuid,
        fly_machine_id: Option<&str>,
        fly_volume_id: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE projects SET fly_machine_id = $1, fly_volume_id = $2 WHERE id = $3")
            .bind(fly_machine_id)
            .bind(fly_volume_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_running(pool: &PgPool, id: Uuid, machine_address: &str) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE projects
               SET status = 'running', machine_address = $1, error_message = NULL
               WHERE id = $2"#,
        )
        .bind(machine_address)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn touch(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE projects SET last_accessed_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Running projects nobody has used since `cutoff`.
    pub async fn list_idle(pool: &PgPool, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as(
            "SELECT * FROM projects WHERE status = 'running' AND last_accessed_at < $1 ORDER BY last_accessed_at",
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ── StoredCredential ────────────────────────────────────────────────

/// A third-party API key, encrypted with the owner's derived key. The nonce
/// is carried at the front of the decoded ciphertext.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StoredCredential {
    pub user_id: Uuid,
    pub provider: String,
    #[serde(skip_serializing)]
    pub ciphertext: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredCredential {
    pub async fn upsert(
        pool: &PgPool,
        user_id: Uuid,
        provider: &str,
        ciphertext: &str,
    ) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO credentials (user_id, provider, ciphertext)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id, provider) DO UPDATE SET ciphertext = EXCLUDED.ciphertext
               RETURNING *"#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(ciphertext)
        .fetch_one(pool)
        .await
    }

    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM credentials WHERE user_id = $1 ORDER BY provider")
            .bind(user_id)
            .fetch_all(pool)
            .await
    }

    /// Returns whether a row was removed.
    pub async fn delete(pool: &PgPool, user_id: Uuid, provider: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE user_id = $1 AND provider = $2")
            .bind(user_id)
            .bind(provider)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
