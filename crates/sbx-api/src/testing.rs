//! In-memory stand-ins for the store and the machine provider.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sbx_db::models::{NewProject, Project, ProjectStatus, StoredCredential};
use sbx_db::{CredentialStore, ProjectStore};
use sbx_infra::types::{
    Endpoint, Machine, MachineId, MachineSpec, MachineState, Volume, VolumeId,
};
use sbx_infra::{
    ConnectionResolver, Error, MachineManager, ProviderMode, Providers, Result, VolumeManager,
};
use uuid::Uuid;

pub fn new_project(user_id: Uuid) -> Project {
    let now = Utc::now();
    Project {
        id: Uuid::new_v4(),
        user_id,
        name: "demo".into(),
        status: ProjectStatus::Stopped,
        error_message: None,
        cpu_kind: "shared".into(),
        cpus: 1,
        memory_mb: 1024,
        volume_size_gb: 10,
        gpu_kind: None,
        fly_machine_id: None,
        fly_volume_id: None,
        machine_address: None,
        last_accessed_at: now,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    projects: Mutex<HashMap<Uuid, Project>>,
    credentials: Mutex<BTreeMap<(Uuid, String), StoredCredential>>,
    ref_writes_left: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn seed(&self, project: Project) -> Project {
        self.projects
            .lock()
            .unwrap()
            .insert(project.id, project.clone());
        project
    }

    pub fn get(&self, id: Uuid) -> Option<Project> {
        self.projects.lock().unwrap().get(&id).cloned()
    }

    pub fn set_last_accessed(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(p) = self.projects.lock().unwrap().get_mut(&id) {
            p.last_accessed_at = at;
        }
    }

    pub fn ciphertext(&self, user_id: Uuid, provider: &str) -> Option<String> {
        self.credentials
            .lock()
            .unwrap()
            .get(&(user_id, provider.to_string()))
            .map(|c| c.ciphertext.clone())
    }

    /// Let `n` provider-ref writes succeed, then fail every later one.
    pub fn fail_provider_refs_after(&self, n: usize) {
        *self.ref_writes_left.lock().unwrap() = Some(n);
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Project)) {
        if let Some(p) = self.projects.lock().unwrap().get_mut(&id) {
            f(p);
            p.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn insert_project(&self, new: &NewProject) -> sqlx::Result<Project> {
        let mut project = new_project(new.user_id);
        project.name = new.name.clone();
        project.cpu_kind = new.cpu_kind.clone();
        project.cpus = new.cpus;
        project.memory_mb = new.memory_mb;
        project.volume_size_gb = new.volume_size_gb;
        project.gpu_kind = new.gpu_kind.clone();
        Ok(self.seed(project))
    }

    async fn get_project(&self, id: Uuid) -> sqlx::Result<Option<Project>> {
        Ok(self.get(id))
    }

    async fn list_projects(&self, user_id: Uuid) -> sqlx::Result<Vec<Project>> {
        let mut projects: Vec<_> = self
            .projects
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
    ) -> sqlx::Result<Option<Project>> {
        let mut projects = self.projects.lock().unwrap();
        match projects.get_mut(&id) {
            Some(p) if from.contains(&p.status) => {
                p.status = to;
                p.error_message = None;
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> sqlx::Result<()> {
        self.update(id, |p| {
            p.status = status;
            p.error_message = error_message.map(str::to_string);
        });
        Ok(())
    }

    async fn set_provider_refs(
        &self,
        id: Uuid,
        machine_id: Option<&str>,
        volume_id: Option<&str>,
    ) -> sqlx::Result<()> {
        if let Some(left) = self.ref_writes_left.lock().unwrap().as_mut() {
            if *left == 0 {
                return Err(sqlx::Error::PoolTimedOut);
            }
            *left -= 1;
        }
        self.update(id, |p| {
            p.fly_machine_id = machine_id.map(str::to_string);
            p.fly_volume_id = volume_id.map(str::to_string);
        });
        Ok(())
    }

    async fn mark_running(&self, id: Uuid, machine_address: &str) -> sqlx::Result<()> {
        self.update(id, |p| {
            p.status = ProjectStatus::Running;
            p.machine_address = Some(machine_address.to_string());
            p.error_message = None;
        });
        Ok(())
    }

    async fn touch(&self, id: Uuid) -> sqlx::Result<()> {
        self.update(id, |p| p.last_accessed_at = Utc::now());
        Ok(())
    }

    async fn list_idle(&self, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<Project>> {
        let mut idle: Vec<_> = self
            .projects
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.status == ProjectStatus::Running && p.last_accessed_at < cutoff)
            .cloned()
            .collect();
        idle.sort_by_key(|p| p.last_accessed_at);
        Ok(idle)
    }

    async fn delete_project(&self, id: Uuid) -> sqlx::Result<()> {
        self.projects.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn put_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        ciphertext: &str,
    ) -> sqlx::Result<StoredCredential> {
        let now = Utc::now();
        let mut credentials = self.credentials.lock().unwrap();
        let entry = credentials
            .entry((user_id, provider.to_string()))
            .or_insert_with(|| StoredCredential {
                user_id,
                provider: provider.to_string(),
                ciphertext: String::new(),
                created_at: now,
                updated_at: now,
            });
        entry.ciphertext = ciphertext.to_string();
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn list_credentials(&self, user_id: Uuid) -> sqlx::Result<Vec<StoredCredential>> {
        Ok(self
            .credentials
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_credential(&self, user_id: Uuid, provider: &str) -> sqlx::Result<bool> {
        Ok(self
            .credentials
            .lock()
            .unwrap()
            .remove(&(user_id, provider.to_string()))
            .is_some())
    }
}

#[derive(Default)]
struct ProviderState {
    calls: Vec<String>,
    machines: HashMap<String, MachineState>,
    next_machine: u32,
    next_volume: u32,
    fail_create_machine: bool,
    fail_wait: bool,
    fail_stop: HashSet<String>,
    hang_stop: HashSet<String>,
    last_spec: Option<MachineSpec>,
}

/// Records every call and keeps machine states in memory.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn providers(self: &Arc<Self>) -> Providers {
        Providers::new(ProviderMode::Local, self.clone(), self.clone(), self.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn last_spec(&self) -> Option<MachineSpec> {
        self.state.lock().unwrap().last_spec.clone()
    }

    pub fn fail_create_machine(&self) {
        self.state.lock().unwrap().fail_create_machine = true;
    }

    pub fn fail_wait(&self) {
        self.state.lock().unwrap().fail_wait = true;
    }

    pub fn fail_stop_for(&self, machine_id: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_stop
            .insert(machine_id.to_string());
    }

    /// `stop_machine` on this machine never returns.
    pub fn hang_stop_for(&self, machine_id: &str) {
        self.state
            .lock()
            .unwrap()
            .hang_stop
            .insert(machine_id.to_string());
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, ProviderState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

fn runtime_error(command: &str) -> Error {
    Error::Runtime {
        command: command.to_string(),
        stderr: "injected failure".into(),
    }
}

#[async_trait]
impl MachineManager for FakeProvider {
    async fn create_machine(&self, name: &str, spec: &MachineSpec) -> Result<Machine> {
        let mut state = self.record(format!("create_machine {name}"));
        state.last_spec = Some(spec.clone());
        if state.fail_create_machine {
            return Err(runtime_error("run"));
        }
        state.next_machine += 1;
        let id = format!("m-{}", state.next_machine);
        state.machines.insert(id.clone(), MachineState::Started);
        Ok(Machine {
            id: MachineId(id),
            name: name.to_string(),
            state: MachineState::Started,
            private_ip: None,
            region: spec.region.clone(),
            created_at: Some(Utc::now()),
            updated_at: None,
        })
    }

    async fn get_machine(&self, id: &MachineId) -> Result<Machine> {
        let state = self.record(format!("get_machine {id}"));
        let machine_state = state
            .machines
            .get(&id.0)
            .copied()
            .ok_or_else(|| Error::MachineNotFound(id.0.clone()))?;
        Ok(Machine {
            id: id.clone(),
            name: id.0.clone(),
            state: machine_state,
            private_ip: None,
            region: None,
            created_at: None,
            updated_at: None,
        })
    }

    async fn start_machine(&self, id: &MachineId) -> Result<()> {
        let mut state = self.record(format!("start_machine {id}"));
        match state.machines.get_mut(&id.0) {
            Some(s) => {
                *s = MachineState::Started;
                Ok(())
            }
            None => Err(Error::MachineNotFound(id.0.clone())),
        }
    }

    async fn stop_machine(&self, id: &MachineId) -> Result<()> {
        {
            let mut state = self.record(format!("stop_machine {id}"));
            if state.fail_stop.contains(&id.0) {
                return Err(runtime_error("stop"));
            }
            if !state.hang_stop.contains(&id.0) {
                return match state.machines.get_mut(&id.0) {
                    Some(s) => {
                        *s = MachineState::Stopped;
                        Ok(())
                    }
                    None => Err(Error::MachineNotFound(id.0.clone())),
                };
            }
        }
        std::future::pending().await
    }

    async fn delete_machine(&self, id: &MachineId) -> Result<()> {
        let mut state = self.record(format!("delete_machine {id}"));
        state.machines.remove(&id.0);
        Ok(())
    }

    async fn wait_for_state(
        &self,
        id: &MachineId,
        desired: MachineState,
        timeout: Duration,
    ) -> Result<()> {
        let state = self.record(format!("wait_for_state {id} {desired}"));
        let last = state
            .machines
            .get(&id.0)
            .copied()
            .unwrap_or(MachineState::Unknown);
        if state.fail_wait || last != desired {
            return Err(Error::Timeout {
                machine_id: id.0.clone(),
                desired,
                last,
                waited: timeout,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeManager for FakeProvider {
    async fn create_volume(&self, name: &str, size_gb: u32, region: Option<&str>) -> Result<Volume> {
        let mut state = self.record(format!("create_volume {name}"));
        state.next_volume += 1;
        Ok(Volume {
            id: VolumeId(format!("vol-{}", state.next_volume)),
            name: name.to_string(),
            size_gb,
            region: region.map(str::to_string),
            encrypted: true,
            attached_machine_id: None,
        })
    }

    async fn get_volume(&self, id: &VolumeId) -> Result<Volume> {
        let _state = self.record(format!("get_volume {id}"));
        Ok(Volume {
            id: id.clone(),
            name: id.0.clone(),
            size_gb: 10,
            region: None,
            encrypted: true,
            attached_machine_id: None,
        })
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<()> {
        let _state = self.record(format!("delete_volume {id}"));
        Ok(())
    }
}

#[async_trait]
impl ConnectionResolver for FakeProvider {
    async fn resolve(&self, id: &MachineId) -> Result<Endpoint> {
        let state = self.record(format!("resolve {id}"));
        if !state.machines.contains_key(&id.0) {
            return Err(Error::Unreachable {
                machine_id: id.0.clone(),
                reason: "no such machine".into(),
            });
        }
        Ok(Endpoint {
            host: "127.0.0.1".into(),
            port: 2222,
        })
    }
}

/// A session opener for routes that never reach a machine.
pub struct NoSessions;

#[async_trait]
impl crate::session::SessionOpener for NoSessions {
    async fn open(
        &self,
        _endpoint: &Endpoint,
        _config: sbx_ssh::ProcessConfig,
    ) -> sbx_ssh::Result<sbx_ssh::ProcessConnector> {
        Err(sbx_ssh::Error::Closed)
    }
}

pub fn test_state(
    vault: Option<crate::vault::CredentialVault>,
) -> (crate::state::AppState, Arc<MemoryStore>, Arc<FakeProvider>) {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(FakeProvider::default());
    let config = crate::config::test_config();
    let lifecycle = crate::lifecycle::LifecycleManager::new(
        store.clone(),
        &provider.providers(),
        crate::lifecycle::LifecycleSettings {
            start_timeout: config.start_timeout,
            ssh_public_key: config.ssh_public_key.clone(),
        },
    );
    let state = crate::state::AppState {
        projects: store.clone(),
        credentials: store.clone(),
        lifecycle: Arc::new(lifecycle),
        sessions: Arc::new(NoSessions),
        vault,
        config,
    };
    (state, store, provider)
}
