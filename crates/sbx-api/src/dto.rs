use chrono::{DateTime, Utc};
use sbx_db::models::{Project, ProjectStatus, StoredCredential};
use sbx_infra::hardware::HardwareSpec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(flatten)]
    pub hardware: HardwareSpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteProjectParams {
    #[serde(default)]
    pub delete_volume: bool,
}

#[derive(Debug, Deserialize)]
pub struct PutCredentialRequest {
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct TerminalParams {
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    pub error_message: Option<String>,
    pub cpu_kind: String,
    pub cpus: i32,
    pub memory_mb: i32,
    pub volume_size_gb: i32,
    pub gpu_kind: Option<String>,
    pub machine_address: Option<String>,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Project> for ProjectResponse {
    fn from(p: Project) -> Self {
        Self {
            id: p.id,
            name: p.name,
            status: p.status,
            error_message: p.error_message,
            cpu_kind: p.cpu_kind,
            cpus: p.cpus,
            memory_mb: p.memory_mb,
            volume_size_gb: p.volume_size_gb,
            gpu_kind: p.gpu_kind,
            machine_address: p.machine_address,
            last_accessed_at: p.last_accessed_at,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<StoredCredential> for CredentialResponse {
    fn from(c: StoredCredential) -> Self {
        Self {
            provider: c.provider,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}
