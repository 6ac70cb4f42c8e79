use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::hardware::HardwareConfig;
use crate::types::{Endpoint, Machine, MachineId, MachineSpec, MachineState, Volume, VolumeId};
use crate::{ConnectionResolver, Error, MachineManager, Result, VolumeManager};

/// Port the machine image runs sshd on, reached over the private network.
pub const SSH_PORT: u16 = 22;

const DEFAULT_IMAGE: &str = "registry.fly.io/sandbox-vm:latest";
const MAX_VOLUME_NAME: usize = 30;

/// Fly.io Machines API provider.
///
/// Delegates to `fly_api::FlyClient` for all HTTP calls.
pub struct FlyProvider {
    client: fly_api::FlyClient,
    region: String,
    image: String,
}

impl FlyProvider {
    /// Create from env vars: `FLY_API_TOKEN` and `FLY_VMS_APP_NAME` (required),
    /// `FLY_REGION`, `FLY_MACHINE_IMAGE`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("FLY_API_TOKEN")
            .map_err(|_| Error::MissingEnv("FLY_API_TOKEN".into()))?;
        let app = std::env::var("FLY_VMS_APP_NAME")
            .map_err(|_| Error::MissingEnv("FLY_VMS_APP_NAME".into()))?;
        let region = std::env::var("FLY_REGION").unwrap_or_else(|_| "iad".into());
        let image = std::env::var("FLY_MACHINE_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.into());

        Ok(Self::new(fly_api::FlyClient::new(token, app), region, image))
    }

    pub fn new(client: fly_api::FlyClient, region: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
            image: image.into(),
        }
    }

    pub fn app(&self) -> &str {
        self.client.app()
    }

    /// GPU hardware only exists in one region, so it wins over everything.
    fn region_for(&self, hardware: Option<&HardwareConfig>, requested: Option<&str>) -> String {
        hardware
            .and_then(HardwareConfig::pinned_region)
            .or(requested)
            .unwrap_or(self.region.as_str())
            .to_string()
    }

    fn guest_config(hardware: &HardwareConfig) -> fly_api::GuestConfig {
        fly_api::GuestConfig {
            cpu_kind: hardware.cpu_kind.as_str().into(),
            cpus: hardware.cpus,
            memory_mb: hardware.memory_mb,
            gpu_kind: hardware.gpu_kind.map(|g| g.as_str().to_string()),
        }
    }

    fn machine_from(machine: fly_api::Machine) -> Machine {
        Machine {
            id: MachineId(machine.id),
            name: machine.name,
            state: machine.state.into(),
            private_ip: machine.private_ip,
            region: Some(machine.region).filter(|r| !r.is_empty()),
            created_at: machine.created_at,
            updated_at: machine.updated_at,
        }
    }

    fn volume_from(volume: fly_api::Volume) -> Volume {
        Volume {
            id: VolumeId(volume.id),
            name: volume.name,
            size_gb: volume.size_gb,
            region: Some(volume.region).filter(|r| !r.is_empty()),
            encrypted: volume.encrypted,
            attached_machine_id: volume.attached_machine_id.map(MachineId),
        }
    }
}

/// Fly volume names allow lowercase alphanumerics and underscores, 30 max.
pub(crate) fn volume_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_VOLUME_NAME);
    out
}

#[async_trait]
impl MachineManager for FlyProvider {
    async fn create_machine(&self, name: &str, spec: &MachineSpec) -> Result<Machine> {
        let mounts: Option<Vec<fly_api::MachineMount>> = if spec.mounts.is_empty() {
            None
        } else {
            Some(
                spec.mounts
                    .iter()
                    .map(|m| fly_api::MachineMount {
                        volume: m.volume_id.0.clone(),
                        path: m.path.clone(),
                    })
                    .collect(),
            )
        };

        let region = self.region_for(Some(&spec.hardware), spec.region.as_deref());
        let machine = self
            .client
            .create_machine(&fly_api::CreateMachineRequest {
                name: name.to_string(),
                region,
                config: fly_api::MachineConfig {
                    image: spec.image.clone().unwrap_or_else(|| self.image.clone()),
                    env: Some(spec.env.clone()),
                    guest: Self::guest_config(&spec.hardware),
                    mounts,
                    auto_destroy: Some(false),
                    restart: Some(fly_api::RestartPolicy {
                        policy: "no".into(),
                    }),
                },
            })
            .await?;

        info!(machine_id = %machine.id, state = %machine.state, region = %machine.region, "fly: machine created");
        Ok(Self::machine_from(machine))
    }

    async fn get_machine(&self, id: &MachineId) -> Result<Machine> {
        let machine = self.client.get_machine(&id.0).await?;
        Ok(Self::machine_from(machine))
    }

    async fn start_machine(&self, id: &MachineId) -> Result<()> {
        self.client.start_machine(&id.0).await?;
        info!(machine_id = %id, "fly: machine started");
        Ok(())
    }

    async fn stop_machine(&self, id: &MachineId) -> Result<()> {
        self.client.stop_machine(&id.0).await?;
        info!(machine_id = %id, "fly: machine stopped");
        Ok(())
    }

    async fn delete_machine(&self, id: &MachineId) -> Result<()> {
        self.client.delete_machine(&id.0, true).await?;
        info!(machine_id = %id, "fly: machine destroyed");
        Ok(())
    }

    async fn wait_for_state(
        &self,
        id: &MachineId,
        desired: MachineState,
        timeout: Duration,
    ) -> Result<()> {
        self.client
            .wait_for_state(&id.0, desired.into(), timeout)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VolumeManager for FlyProvider {
    async fn create_volume(
        &self,
        name: &str,
        size_gb: u32,
        region: Option<&str>,
    ) -> Result<Volume> {
        let volume = self
            .client
            .create_volume(&fly_api::CreateVolumeRequest {
                name: volume_name(name),
                region: self.region_for(None, region),
                size_gb,
                encrypted: true,
                fstype: "ext4".into(),
            })
            .await?;

        info!(volume_id = %volume.id, size_gb, region = %volume.region, "fly: volume created");
        Ok(Self::volume_from(volume))
    }

    async fn get_volume(&self, id: &VolumeId) -> Result<Volume> {
        let volume = self.client.get_volume(&id.0).await?;
        Ok(Self::volume_from(volume))
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<()> {
        self.client.delete_volume(&id.0).await?;
        info!(volume_id = %id, "fly: volume deleted");
        Ok(())
    }
}

#[async_trait]
impl ConnectionResolver for FlyProvider {
    async fn resolve(&self, id: &MachineId) -> Result<Endpoint> {
        let machine = self.client.get_machine(&id.0).await?;
        let app = self.client.app();
        let host = machine
            .private_ip
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| format!("{}.vm.{app}.internal", machine.id));

        Ok(Endpoint {
            host,
            port: SSH_PORT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareSpec;

    fn provider() -> FlyProvider {
        FlyProvider::new(fly_api::FlyClient::new("t", "sandboxes"), "iad", DEFAULT_IMAGE)
    }

    #[test]
    fn gpu_machines_ignore_requested_region() {
        let hardware = HardwareSpec {
            cpu_kind: "performance".into(),
            cpus: 8,
            memory_mb: 16384,
            volume_size_gb: 50,
            gpu_kind: Some("l40s".into()),
        }
        .validate()
        .unwrap();

        let p = provider();
        assert_eq!(p.region_for(Some(&hardware), Some("fra")), "ord");
    }

    #[test]
    fn cpu_machines_use_requested_then_default_region() {
        let hardware = HardwareSpec::default().validate().unwrap();
        let p = provider();
        assert_eq!(p.region_for(Some(&hardware), Some("fra")), "fra");
        assert_eq!(p.region_for(Some(&hardware), None), "iad");
    }

    #[test]
    fn guest_config_carries_gpu_kind() {
        let hardware = HardwareSpec {
            cpu_kind: "performance".into(),
            cpus: 8,
            memory_mb: 32768,
            volume_size_gb: 50,
            gpu_kind: Some("a100-40gb".into()),
        }
        .validate()
        .unwrap();

        let guest = FlyProvider::guest_config(&hardware);
        assert_eq!(guest.cpu_kind, "performance");
        assert_eq!(guest.gpu_kind.as_deref(), Some("a100-40gb"));
    }

    #[test]
    fn volume_names_are_sanitized() {
        assert_eq!(volume_name("Project-7f3a"), "project_7f3a");
        assert_eq!(volume_name(&"x".repeat(64)).len(), MAX_VOLUME_NAME);
    }
}
