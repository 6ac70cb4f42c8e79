//! Project start, stop, delete and the idle sweep.
//!
//! Every status change goes through the store's compare-and-set transition,
//! so two concurrent starts of one project cannot both provision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use sbx_db::ProjectStore;
use sbx_db::models::{Project, ProjectStatus};
use sbx_infra::hardware::{HardwareConfig, HardwareSpec, ValidationErrors};
use sbx_infra::types::{
    Endpoint, MachineId, MachineSpec, MachineState, VolumeId, VolumeMount,
};
use sbx_infra::{ConnectionResolver, MachineManager, Providers, VolumeManager};
use uuid::Uuid;

/// Where the project volume is mounted inside every machine.
pub const PROJECT_ROOT: &str = sbx_ssh::command::WORKDIR;

/// Idle projects stopped at once by one sweep.
const SWEEP_CONCURRENCY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("project {0} not found")]
    NotFound(Uuid),

    #[error("cannot {action} project {id} while it is {status}")]
    InvalidState {
        id: Uuid,
        status: ProjectStatus,
        action: &'static str,
    },

    #[error("project {0} has no machine")]
    NoMachine(Uuid),

    #[error(transparent)]
    InvalidHardware(#[from] ValidationErrors),

    #[error(transparent)]
    Infra(#[from] sbx_infra::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Outcome of one idle sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub stopped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub start_timeout: Duration,
    pub ssh_public_key: Option<String>,
}

pub struct LifecycleManager {
    store: Arc<dyn ProjectStore>,
    machines: Arc<dyn MachineManager>,
    volumes: Arc<dyn VolumeManager>,
    resolver: Arc<dyn ConnectionResolver>,
    settings: LifecycleSettings,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        providers: &Providers,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            machines: providers.machine_manager(),
            volumes: providers.volume_manager(),
            resolver: providers.connection_resolver(),
            settings,
        }
    }

    async fn load(&self, id: Uuid) -> Result<Project> {
        self.store
            .get_project(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    /// Boot the project's machine, creating its volume and machine on first
    /// start. A running project is returned unchanged.
    pub async fn start(&self, id: Uuid) -> Result<Project> {
        let project = self.load(id).await?;
        if project.status == ProjectStatus::Running {
            return Ok(project);
        }

        let Some(project) = self
            .store
            .transition(
                id,
                &[ProjectStatus::Stopped, ProjectStatus::Error],
                ProjectStatus::Starting,
            )
            .await?
        else {
            let current = self.load(id).await?;
            return Err(LifecycleError::InvalidState {
                id,
                status: current.status,
                action: "start",
            });
        };

        tracing::info!(project_id = %id, "starting project");
        match self.bring_up(&project).await {
            Ok(address) => {
                self.store.mark_running(id, &address).await?;
                tracing::info!(project_id = %id, address = %address, "project running");
                self.load(id).await
            }
            Err(e) => {
                tracing::error!(project_id = %id, error = %e, "project start failed");
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, project: &Project) -> Result<String> {
        let hardware = hardware_of(project)?;

        let machine_id = match &project.fly_machine_id {
            Some(existing) => {
                let machine_id = MachineId(existing.clone());
                match self.machines.get_machine(&machine_id).await {
                    Ok(machine) if machine.state == MachineState::Started => {}
                    Ok(_) => self.machines.start_machine(&machine_id).await?,
                    Err(e) if is_gone(&e) => {
                        tracing::warn!(
                            project_id = %project.id,
                            machine_id = %machine_id,
                            "machine is gone, recreating"
                        );
                        self.store
                            .set_provider_refs(project.id, None, project.fly_volume_id.as_deref())
                            .await?;
                        return self.provision(project, hardware).await;
                    }
                    Err(e) => return Err(e.into()),
                }
                machine_id
            }
            None => return self.provision(project, hardware).await,
        };

        self.await_started(&machine_id).await
    }

    /// First boot: volume, then a machine with it mounted. Anything created
    /// here is deleted again if a later step cannot record it.
    async fn provision(&self, project: &Project, hardware: HardwareConfig) -> Result<String> {
        let region = hardware.pinned_region();

        let (volume_id, created_volume) = match &project.fly_volume_id {
            Some(id) => (VolumeId(id.clone()), false),
            None => {
                let volume = self
                    .volumes
                    .create_volume(&volume_name(project.id), hardware.volume_size_gb, region)
                    .await?;
                if let Err(e) = self
                    .store
                    .set_provider_refs(project.id, None, Some(&volume.id.0))
                    .await
                {
                    self.discard_volume(project.id, &volume.id).await;
                    return Err(e.into());
                }
                tracing::info!(project_id = %project.id, volume_id = %volume.id, "volume created");
                (volume.id, true)
            }
        };

        let spec = MachineSpec {
            image: None,
            hardware,
            env: self.machine_env(project),
            mounts: vec![VolumeMount {
                volume_id: volume_id.clone(),
                path: PROJECT_ROOT.into(),
            }],
            region: region.map(str::to_string),
        };

        let machine = match self
            .machines
            .create_machine(&machine_name(project.id), &spec)
            .await
        {
            Ok(machine) => machine,
            Err(e) => {
                if created_volume {
                    self.discard_volume(project.id, &volume_id).await;
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .store
            .set_provider_refs(project.id, Some(&machine.id.0), Some(&volume_id.0))
            .await
        {
            self.discard_machine(project.id, &machine.id).await;
            if created_volume {
                self.discard_volume(project.id, &volume_id).await;
            }
            return Err(e.into());
        }
        tracing::info!(project_id = %project.id, machine_id = %machine.id, "machine created");

        self.await_started(&machine.id).await
    }

    async fn discard_machine(&self, project_id: Uuid, machine_id: &MachineId) {
        match self.machines.delete_machine(machine_id).await {
            Ok(()) => tracing::info!(project_id = %project_id, machine_id = %machine_id, "rolled back machine"),
            Err(e) => tracing::error!(
                project_id = %project_id,
                machine_id = %machine_id,
                error = %e,
                "failed to roll back unrecorded machine"
            ),
        }
    }

    async fn discard_volume(&self, project_id: Uuid, volume_id: &VolumeId) {
        match self.volumes.delete_volume(volume_id).await {
            Ok(()) => {
                tracing::info!(project_id = %project_id, volume_id = %volume_id, "rolled back volume");
                if let Err(e) = self.store.set_provider_refs(project_id, None, None).await {
                    tracing::error!(project_id = %project_id, error = %e, "failed to clear volume ref");
                }
            }
            Err(e) => tracing::error!(
                project_id = %project_id,
                volume_id = %volume_id,
                error = %e,
                "failed to roll back volume, it stays recorded on the project"
            ),
        }
    }

    async fn await_started(&self, machine_id: &MachineId) -> Result<String> {
        self.machines
            .wait_for_state(machine_id, MachineState::Started, self.settings.start_timeout)
            .await?;
        let endpoint = self.resolver.resolve(machine_id).await?;
        Ok(endpoint.to_string())
    }

    fn machine_env(&self, project: &Project) -> HashMap<String, String> {
        let mut env = HashMap::from([("PROJECT_ID".to_string(), project.id.to_string())]);
        if let Some(key) = &self.settings.ssh_public_key {
            env.insert("SSH_AUTHORIZED_KEY".into(), key.clone());
        }
        env
    }

    async fn fail(&self, id: Uuid, error: &LifecycleError) {
        let message = error.to_string();
        if let Err(e) = self
            .store
            .set_status(id, ProjectStatus::Error, Some(&message))
            .await
        {
            tracing::error!(project_id = %id, error = %e, "failed to record project error");
        }
    }

    /// Stop the project's machine. The volume is kept.
    pub async fn stop(&self, id: Uuid) -> Result<Project> {
        let project = self.load(id).await?;
        if project.status == ProjectStatus::Stopped {
            return Ok(project);
        }

        let Some(project) = self
            .store
            .transition(
                id,
                &[ProjectStatus::Running, ProjectStatus::Error],
                ProjectStatus::Stopping,
            )
            .await?
        else {
            let current = self.load(id).await?;
            return Err(LifecycleError::InvalidState {
                id,
                status: current.status,
                action: "stop",
            });
        };

        tracing::info!(project_id = %id, "stopping project");
        if let Some(machine_id) = project.fly_machine_id.clone().map(MachineId) {
            if let Err(e) = self.halt(&machine_id).await {
                tracing::error!(project_id = %id, error = %e, "project stop failed");
                self.fail(id, &e).await;
                return Err(e);
            }
        }

        self.store
            .set_status(id, ProjectStatus::Stopped, None)
            .await?;
        tracing::info!(project_id = %id, "project stopped");
        self.load(id).await
    }

    async fn halt(&self, machine_id: &MachineId) -> Result<()> {
        match self.machines.stop_machine(machine_id).await {
            Ok(()) => {}
            Err(e) if is_gone(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.machines
            .wait_for_state(machine_id, MachineState::Stopped, self.settings.start_timeout)
            .await?;
        Ok(())
    }

    /// Stop if needed, destroy the machine, optionally the volume, then
    /// forget the project.
    pub async fn delete(&self, id: Uuid, delete_volume: bool) -> Result<()> {
        let mut project = self.load(id).await?;
        match project.status {
            ProjectStatus::Starting | ProjectStatus::Stopping => {
                return Err(LifecycleError::InvalidState {
                    id,
                    status: project.status,
                    action: "delete",
                });
            }
            ProjectStatus::Running => project = self.stop(id).await?,
            ProjectStatus::Stopped | ProjectStatus::Error => {}
        }

        if let Some(machine_id) = project.fly_machine_id.clone().map(MachineId) {
            match self.machines.delete_machine(&machine_id).await {
                Ok(()) => tracing::info!(project_id = %id, machine_id = %machine_id, "machine deleted"),
                Err(e) if is_gone(&e) => {}
                Err(e) => return Err(e.into()),
            }
            self.store
                .set_provider_refs(id, None, project.fly_volume_id.as_deref())
                .await?;
        }

        if let Some(volume_id) = project.fly_volume_id.clone().map(VolumeId) {
            if delete_volume {
                match self.volumes.delete_volume(&volume_id).await {
                    Ok(()) => tracing::info!(project_id = %id, volume_id = %volume_id, "volume deleted"),
                    Err(e) if is_gone(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                tracing::info!(project_id = %id, volume_id = %volume_id, "volume retained");
            }
        }

        self.store.delete_project(id).await?;
        tracing::info!(project_id = %id, "project deleted");
        Ok(())
    }

    /// Record activity on a project.
    pub async fn touch(&self, id: Uuid) -> Result<()> {
        self.store.touch(id).await?;
        Ok(())
    }

    /// SSH endpoint of a running project.
    pub async fn endpoint(&self, project: &Project) -> Result<Endpoint> {
        if project.status != ProjectStatus::Running {
            return Err(LifecycleError::InvalidState {
                id: project.id,
                status: project.status,
                action: "connect to",
            });
        }
        let machine_id = project
            .fly_machine_id
            .clone()
            .map(MachineId)
            .ok_or(LifecycleError::NoMachine(project.id))?;
        Ok(self.resolver.resolve(&machine_id).await?)
    }

    /// Stop every running project idle for longer than `idle_timeout`. Stops
    /// run concurrently, so one slow or failing project does not hold up the
    /// others. The sweep itself never counts as activity.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Result<SweepReport> {
        let idle_for = chrono::Duration::from_std(idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(idle_for)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let idle = self.store.list_idle(cutoff).await?;
        let outcomes: Vec<bool> = futures_util::stream::iter(idle)
            .map(|project| async move {
                match self.stop(project.id).await {
                    Ok(_) => {
                        tracing::info!(
                            project_id = %project.id,
                            last_accessed_at = %project.last_accessed_at,
                            "stopped idle project"
                        );
                        true
                    }
                    Err(e) => {
                        tracing::warn!(project_id = %project.id, error = %e, "failed to stop idle project");
                        false
                    }
                }
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        let stopped = outcomes.iter().filter(|ok| **ok).count();
        Ok(SweepReport {
            stopped,
            failed: outcomes.len() - stopped,
        })
    }
}

pub(crate) fn hardware_of(project: &Project) -> std::result::Result<HardwareConfig, ValidationErrors> {
    HardwareSpec {
        cpu_kind: project.cpu_kind.clone(),
        cpus: project.cpus.into(),
        memory_mb: project.memory_mb.into(),
        volume_size_gb: project.volume_size_gb.into(),
        gpu_kind: project.gpu_kind.clone(),
    }
    .validate()
}

fn machine_name(id: Uuid) -> String {
    format!("project-{id}")
}

fn volume_name(id: Uuid) -> String {
    format!("project-{}", id.simple())
}

fn is_gone(err: &sbx_infra::Error) -> bool {
    match err {
        sbx_infra::Error::MachineNotFound(_) | sbx_infra::Error::VolumeNotFound(_) => true,
        sbx_infra::Error::Fly(e) => e.status().is_some_and(|s| s.as_u16() == 404),
        _ => false,
    }
}
