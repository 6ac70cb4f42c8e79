pub mod fly;
pub mod hardware;
pub mod local;
pub mod types;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{Endpoint, Machine, MachineId, MachineSpec, MachineState, Volume, VolumeId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fly provider error: {0}")]
    Fly(fly_api::Error),

    #[error("container runtime command `{command}` failed: {stderr}")]
    Runtime { command: String, stderr: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("machine {machine_id} did not reach {desired} within {waited:?} (last state: {last})")]
    Timeout {
        machine_id: String,
        desired: MachineState,
        last: MachineState,
        waited: Duration,
    },

    #[error("machine {machine_id} entered the error state while waiting for {desired}")]
    MachineFailed {
        machine_id: String,
        desired: MachineState,
    },

    #[error("no ssh endpoint for machine {machine_id}: {reason}")]
    Unreachable { machine_id: String, reason: String },

    #[error("invalid hardware configuration: {0}")]
    InvalidHardware(#[from] hardware::ValidationErrors),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a state wait ran out of time, as opposed to failing outright.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<fly_api::Error> for Error {
    fn from(err: fly_api::Error) -> Self {
        match err {
            fly_api::Error::Timeout {
                machine_id,
                desired,
                last,
                waited,
            } => Self::Timeout {
                machine_id,
                desired: desired.into(),
                last: last.into(),
                waited,
            },
            fly_api::Error::MachineFailed {
                machine_id,
                desired,
            } => Self::MachineFailed {
                machine_id,
                desired: desired.into(),
            },
            other => Self::Fly(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which backend hosts project machines. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Fly.io Machines API.
    Cloud,
    /// Containers on the local container runtime.
    Local,
}

impl ProviderMode {
    /// Read `LOCAL_MODE`; anything truthy selects the local runtime.
    pub fn from_env() -> Self {
        match std::env::var("LOCAL_MODE") {
            Ok(v) if matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") => {
                Self::Local
            }
            _ => Self::Cloud,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine operations, identical for every backend.
///
/// Implementations never retry on their own: creating a machine is not
/// idempotent, so a blind retry could leave a duplicate behind.
#[async_trait]
pub trait MachineManager: Send + Sync + 'static {
    /// Create and boot a machine with the given spec.
    async fn create_machine(&self, name: &str, spec: &MachineSpec) -> Result<Machine>;

    /// Get current machine status and metadata.
    async fn get_machine(&self, id: &MachineId) -> Result<Machine>;

    /// Start a stopped machine.
    async fn start_machine(&self, id: &MachineId) -> Result<()>;

    /// Stop a running machine.
    async fn stop_machine(&self, id: &MachineId) -> Result<()>;

    /// Destroy a machine permanently. Attached volumes are left alone.
    async fn delete_machine(&self, id: &MachineId) -> Result<()>;

    /// Block until the machine reports `desired`, it fails, or `timeout` passes.
    async fn wait_for_state(
        &self,
        id: &MachineId,
        desired: MachineState,
        timeout: Duration,
    ) -> Result<()>;
}

/// Volume operations. Volumes outlive machines; deleting one is always an
/// explicit caller decision.
#[async_trait]
pub trait VolumeManager: Send + Sync + 'static {
    async fn create_volume(&self, name: &str, size_gb: u32, region: Option<&str>)
    -> Result<Volume>;

    async fn get_volume(&self, id: &VolumeId) -> Result<Volume>;

    async fn delete_volume(&self, id: &VolumeId) -> Result<()>;
}

/// Maps a machine to the address its SSH daemon is reachable on.
#[async_trait]
pub trait ConnectionResolver: Send + Sync + 'static {
    async fn resolve(&self, id: &MachineId) -> Result<Endpoint>;
}

/// The provider implementations selected for this process.
///
/// Built once by [`build_providers`] and shared read-only afterwards.
#[derive(Clone)]
pub struct Providers {
    mode: ProviderMode,
    machines: Arc<dyn MachineManager>,
    volumes: Arc<dyn VolumeManager>,
    resolver: Arc<dyn ConnectionResolver>,
}

impl Providers {
    pub fn new(
        mode: ProviderMode,
        machines: Arc<dyn MachineManager>,
        volumes: Arc<dyn VolumeManager>,
        resolver: Arc<dyn ConnectionResolver>,
    ) -> Self {
        Self {
            mode,
            machines,
            volumes,
            resolver,
        }
    }

    pub fn mode(&self) -> ProviderMode {
        self.mode
    }

    pub fn machine_manager(&self) -> Arc<dyn MachineManager> {
        Arc::clone(&self.machines)
    }

    pub fn volume_manager(&self) -> Arc<dyn VolumeManager> {
        Arc::clone(&self.volumes)
    }

    pub fn connection_resolver(&self) -> Arc<dyn ConnectionResolver> {
        Arc::clone(&self.resolver)
    }
}

/// Build the providers for the mode selected by `LOCAL_MODE`.
///
/// Cloud mode fails when the Fly credentials are missing. Local mode adopts
/// containers left behind by a previous run before returning.
pub async fn build_providers() -> Result<Providers> {
    dotenvy::dotenv().ok();

    let mode = ProviderMode::from_env();
    match mode {
        ProviderMode::Cloud => {
            let fly = Arc::new(fly::FlyProvider::from_env()?);
            tracing::info!(app = fly.app(), "registered Fly.io machine provider");
            Ok(Providers {
                mode,
                machines: fly.clone(),
                volumes: fly.clone(),
                resolver: fly,
            })
        }
        ProviderMode::Local => {
            let runtime = Arc::new(local::LocalRuntime::from_env()?);
            match runtime.reconcile().await {
                Ok(adopted) => {
                    tracing::info!(adopted, "registered local container runtime provider")
                }
                Err(e) => tracing::warn!(error = %e, "local runtime reconciliation failed"),
            }
            Ok(Providers {
                mode,
                machines: runtime.clone(),
                volumes: runtime.clone(),
                resolver: runtime,
            })
        }
    }
}
