//! Project machines as containers on the host's container runtime.
//!
//! Used for development without a Fly account. Volumes are plain directories
//! under the projects dir, bind-mounted into the container. SSH is published
//! on an ephemeral loopback port and looked up on every resolve.

mod runner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use runner::{CommandOutput, CommandRunner, ProcessRunner};

use crate::types::{Endpoint, Machine, MachineId, MachineSpec, MachineState, Volume, VolumeId};
use crate::{ConnectionResolver, Error, MachineManager, Result, VolumeManager};

const DEFAULT_IMAGE: &str = "sandbox-vm:latest";
const DEFAULT_RUNTIME: &str = "docker";
const DEFAULT_PROJECTS_DIR: &str = "./data/projects";
const MANAGED_LABEL: &str = "sandbox.managed=true";
const NAME_LABEL: &str = "sandbox.name";
const SERVICES_MOUNT: &str = "/opt/services";
const LOCAL_HOST: &str = "127.0.0.1";
const LOCAL_REGION: &str = "local";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How far past its deadline an `inspect` already in flight may run.
const POLL_GRACE: Duration = Duration::from_secs(2);

/// Local container runtime provider (docker or a CLI-compatible runtime).
pub struct LocalRuntime<R: CommandRunner = ProcessRunner> {
    runner: R,
    bin: String,
    image: String,
    projects_dir: PathBuf,
    services_dir: Option<PathBuf>,
    machines: RwLock<HashMap<String, Machine>>,
    volumes: RwLock<HashMap<String, Volume>>,
    poll_interval: Duration,
}

impl LocalRuntime<ProcessRunner> {
    /// Create from env vars: `LOCAL_BASE_IMAGE`, `LOCAL_CONTAINER_RUNTIME`,
    /// `LOCAL_PROJECTS_DIR`, `LOCAL_SERVICES_DIR`. All optional.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let image = std::env::var("LOCAL_BASE_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.into());
        let bin =
            std::env::var("LOCAL_CONTAINER_RUNTIME").unwrap_or_else(|_| DEFAULT_RUNTIME.into());
        let projects_dir =
            std::env::var("LOCAL_PROJECTS_DIR").unwrap_or_else(|_| DEFAULT_PROJECTS_DIR.into());
        let services_dir = std::env::var("LOCAL_SERVICES_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(std::path::absolute)
            .transpose()?;

        Ok(Self::new(
            ProcessRunner,
            bin,
            image,
            std::path::absolute(projects_dir)?,
            services_dir,
        ))
    }
}

impl<R: CommandRunner> LocalRuntime<R> {
    pub fn new(
        runner: R,
        bin: impl Into<String>,
        image: impl Into<String>,
        projects_dir: PathBuf,
        services_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            runner,
            bin: bin.into(),
            image: image.into(),
            projects_dir,
            services_dir,
            machines: RwLock::new(HashMap::new()),
            volumes: RwLock::new(HashMap::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Adopt containers labelled as ours that survived a restart of this
    /// process. Returns how many were adopted.
    pub async fn reconcile(&self) -> Result<usize> {
        let format = format!("{{{{.ID}}}}\t{{{{.Label \"{NAME_LABEL}\"}}}}\t{{{{.State}}}}");
        let out = self
            .exec(args(&[
                "ps",
                "-a",
                "--no-trunc",
                "--filter",
                &format!("label={MANAGED_LABEL}"),
                "--format",
                &format,
            ]))
            .await?;

        let mut machines = self.machines.write().await;
        let mut adopted = 0;
        for line in out.lines() {
            let mut parts = line.split('\t');
            let (Some(id), Some(name), Some(status)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let id = id.trim();
            if id.is_empty() {
                continue;
            }
            let state = container_state(status.trim());
            debug!(container_id = id, name, %state, "local: adopting container");
            machines.insert(
                id.to_string(),
                Machine {
                    id: MachineId(id.to_string()),
                    name: name.trim().to_string(),
                    state,
                    private_ip: Some(LOCAL_HOST.into()),
                    region: Some(LOCAL_REGION.into()),
                    created_at: None,
                    updated_at: Some(Utc::now()),
                },
            );
            adopted += 1;
        }
        Ok(adopted)
    }

    fn volume_path(&self, id: &str) -> PathBuf {
        self.projects_dir.join(id)
    }

    /// Run the runtime binary and return stdout, or a `Runtime` error with
    /// the trimmed stderr.
    async fn exec(&self, args: Vec<String>) -> Result<String> {
        let out = self.runner.run(&self.bin, &args).await?;
        if out.is_success() {
            Ok(out.stdout)
        } else {
            Err(Error::Runtime {
                command: format!("{} {}", self.bin, args.first().map_or("", String::as_str)),
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Like [`exec`](Self::exec), but "no such container" becomes `MachineNotFound`.
    async fn exec_on(&self, id: &MachineId, args: Vec<String>) -> Result<String> {
        match self.exec(args).await {
            Err(Error::Runtime { stderr, .. }) if is_missing(&stderr) => {
                self.machines.write().await.remove(&id.0);
                Err(Error::MachineNotFound(id.0.clone()))
            }
            other => other,
        }
    }

    async fn set_state(&self, id: &MachineId, state: MachineState) {
        if let Some(machine) = self.machines.write().await.get_mut(&id.0) {
            machine.state = state;
            machine.updated_at = Some(Utc::now());
        }
    }

    fn run_args(&self, container: &str, name: &str, spec: &MachineSpec) -> Vec<String> {
        let mut out = args(&[
            "run",
            "-d",
            "--name",
            container,
            "--hostname",
            container,
            "--label",
            MANAGED_LABEL,
            "--label",
            &format!("{NAME_LABEL}={name}"),
            "-p",
            &format!("{LOCAL_HOST}::22"),
        ]);

        for mount in &spec.mounts {
            out.push("-v".into());
            out.push(format!(
                "{}:{}",
                self.volume_path(&mount.volume_id.0).display(),
                mount.path
            ));
        }
        if let Some(services) = &self.services_dir {
            out.push("-v".into());
            out.push(format!("{}:{SERVICES_MOUNT}:ro", services.display()));
        }

        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            out.push("-e".into());
            out.push(format!("{key}={value}"));
        }

        out.push("--cpus".into());
        out.push(spec.hardware.cpus.to_string());
        out.push("--memory".into());
        out.push(format!("{}m", spec.hardware.memory_mb));
        out.push(spec.image.clone().unwrap_or_else(|| self.image.clone()));
        out
    }
}

#[async_trait]
impl<R: CommandRunner> MachineManager for LocalRuntime<R> {
    async fn create_machine(&self, name: &str, spec: &MachineSpec) -> Result<Machine> {
        let container = container_name(name);

        // A leftover container with the same name would make `run` fail.
        if let Err(e) = self.exec(args(&["rm", "-f", &container])).await {
            debug!(container = %container, error = %e, "local: no stale container removed");
        }
        self.machines.write().await.retain(|_, m| m.name != name);

        let out = self.exec(self.run_args(&container, name, spec)).await?;
        let id = parse_container_id(&out).ok_or_else(|| Error::Runtime {
            command: format!("{} run", self.bin),
            stderr: "runtime printed no container id".into(),
        })?;

        let now = Utc::now();
        let machine = Machine {
            id: MachineId(id),
            name: name.to_string(),
            state: MachineState::Started,
            private_ip: Some(LOCAL_HOST.into()),
            region: Some(LOCAL_REGION.into()),
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.machines
            .write()
            .await
            .insert(machine.id.0.clone(), machine.clone());

        info!(machine_id = %machine.id, container = %container, "local: container created");
        Ok(machine)
    }

    async fn get_machine(&self, id: &MachineId) -> Result<Machine> {
        let status = self
            .exec_on(id, args(&["inspect", "--format", "{{.State.Status}}", &id.0]))
            .await?;
        let state = container_state(status.trim());

        if let Some(machine) = self.machines.read().await.get(&id.0) {
            if machine.state == state {
                return Ok(machine.clone());
            }
        }

        let mut machines = self.machines.write().await;
        let machine = machines.entry(id.0.clone()).or_insert_with(|| Machine {
            id: id.clone(),
            name: String::new(),
            state,
            private_ip: Some(LOCAL_HOST.into()),
            region: Some(LOCAL_REGION.into()),
            created_at: None,
            updated_at: None,
        });
        if machine.state != state {
            machine.state = state;
            machine.updated_at = Some(Utc::now());
        }
        Ok(machine.clone())
    }

    async fn start_machine(&self, id: &MachineId) -> Result<()> {
        self.exec_on(id, args(&["start", &id.0])).await?;
        self.set_state(id, MachineState::Started).await;
        info!(machine_id = %id, "local: container started");
        Ok(())
    }

    async fn stop_machine(&self, id: &MachineId) -> Result<()> {
        self.exec_on(id, args(&["stop", &id.0])).await?;
        self.set_state(id, MachineState::Stopped).await;
        info!(machine_id = %id, "local: container stopped");
        Ok(())
    }

    async fn delete_machine(&self, id: &MachineId) -> Result<()> {
        self.exec_on(id, args(&["rm", "-f", &id.0])).await?;
        self.machines.write().await.remove(&id.0);
        info!(machine_id = %id, "local: container removed");
        Ok(())
    }

    async fn wait_for_state(
        &self,
        id: &MachineId,
        desired: MachineState,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(machine) = self.machines.read().await.get(&id.0) {
            if machine.state == desired {
                return Ok(());
            }
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut last = MachineState::Unknown;

        loop {
            let budget = deadline.saturating_duration_since(Instant::now()) + POLL_GRACE;
            let machine = match tokio::time::timeout(budget, self.get_machine(id)).await {
                Ok(polled) => polled?,
                Err(_) => {
                    return Err(Error::Timeout {
                        machine_id: id.0.clone(),
                        desired,
                        last,
                        waited: started.elapsed(),
                    });
                }
            };
            if machine.state == desired {
                return Ok(());
            }
            if machine.state == MachineState::Error {
                return Err(Error::MachineFailed {
                    machine_id: id.0.clone(),
                    desired,
                });
            }
            last = machine.state;

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    machine_id: id.0.clone(),
                    desired,
                    last,
                    waited: now - started,
                });
            }
            // The last poll lands on the deadline itself.
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl<R: CommandRunner> VolumeManager for LocalRuntime<R> {
    async fn create_volume(
        &self,
        name: &str,
        size_gb: u32,
        _region: Option<&str>,
    ) -> Result<Volume> {
        let id = format!("vol_{}", crate::fly::volume_name(name));
        let path = self.volume_path(&id);
        tokio::fs::create_dir_all(&path).await?;

        let volume = Volume {
            id: VolumeId(id.clone()),
            name: name.to_string(),
            size_gb,
            region: Some(LOCAL_REGION.into()),
            encrypted: false,
            attached_machine_id: None,
        };
        self.volumes.write().await.insert(id, volume.clone());

        info!(volume_id = %volume.id, path = %path.display(), "local: volume created");
        Ok(volume)
    }

    async fn get_volume(&self, id: &VolumeId) -> Result<Volume> {
        if let Some(volume) = self.volumes.read().await.get(&id.0) {
            return Ok(volume.clone());
        }
        // Directories outlive the process; treat an existing one as the volume.
        match tokio::fs::metadata(self.volume_path(&id.0)).await {
            Ok(meta) if meta.is_dir() => Ok(Volume {
                id: id.clone(),
                name: id.0.trim_start_matches("vol_").to_string(),
                size_gb: 0,
                region: Some(LOCAL_REGION.into()),
                encrypted: false,
                attached_machine_id: None,
            }),
            Ok(_) => Err(Error::VolumeNotFound(id.0.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::VolumeNotFound(id.0.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<()> {
        self.volumes.write().await.remove(&id.0);
        match tokio::fs::remove_dir_all(self.volume_path(&id.0)).await {
            Ok(()) => {
                info!(volume_id = %id, "local: volume deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<R: CommandRunner> ConnectionResolver for LocalRuntime<R> {
    async fn resolve(&self, id: &MachineId) -> Result<Endpoint> {
        let out = self.exec_on(id, args(&["port", &id.0, "22/tcp"])).await?;
        let port = parse_published_port(&out).ok_or_else(|| Error::Unreachable {
            machine_id: id.0.clone(),
            reason: format!("no published ssh port in {:?}", out.trim()),
        })?;

        Ok(Endpoint {
            host: LOCAL_HOST.into(),
            port,
        })
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

/// Container names allow `[a-zA-Z0-9_.-]`.
fn container_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("sandbox-{sanitized}")
}

/// `run -d` may print image pull progress before the id; take the last line
/// that looks like a container id.
fn parse_container_id(stdout: &str) -> Option<String> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|l| matches!(l.len(), 12 | 64) && l.chars().all(|c| c.is_ascii_hexdigit()))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
}

/// First port in `port` output such as `127.0.0.1:49153` or `[::]:49153`.
fn parse_published_port(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .filter_map(|l| l.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn container_state(status: &str) -> MachineState {
    match status {
        "created" => MachineState::Created,
        "restarting" => MachineState::Starting,
        "running" => MachineState::Started,
        "exited" | "paused" => MachineState::Stopped,
        "removing" => MachineState::Destroyed,
        "dead" => MachineState::Error,
        other => {
            warn!(status = other, "local: unrecognized container status");
            MachineState::Unknown
        }
    }
}
