use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hardware::HardwareConfig;

/// Opaque provider-side machine identifier (Fly Machine ID or container ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(pub String);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque provider-side volume identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-agnostic machine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
    Destroyed,
    Unknown,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<fly_api::MachineState> for MachineState {
    fn from(state: fly_api::MachineState) -> Self {
        use fly_api::MachineState as Fly;
        match state {
            Fly::Created => Self::Created,
            Fly::Starting | Fly::Replacing => Self::Starting,
            Fly::Started => Self::Started,
            Fly::Stopping => Self::Stopping,
            Fly::Stopped | Fly::Suspended => Self::Stopped,
            Fly::Destroying | Fly::Destroyed => Self::Destroyed,
            Fly::Error => Self::Error,
            Fly::Unknown => Self::Unknown,
        }
    }
}

impl From<MachineState> for fly_api::MachineState {
    fn from(state: MachineState) -> Self {
        match state {
            MachineState::Created => Self::Created,
            MachineState::Starting => Self::Starting,
            MachineState::Started => Self::Started,
            MachineState::Stopping => Self::Stopping,
            MachineState::Stopped => Self::Stopped,
            MachineState::Error => Self::Error,
            MachineState::Destroyed => Self::Destroyed,
            MachineState::Unknown => Self::Unknown,
        }
    }
}

/// Everything a provider needs to create a project machine.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub image: Option<String>,
    pub hardware: HardwareConfig,
    pub env: HashMap<String, String>,
    pub mounts: Vec<VolumeMount>,
    pub region: Option<String>,
}

/// A volume mounted into a machine at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume_id: VolumeId,
    pub path: String,
}

/// Machine status and metadata returned from the provider.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub state: MachineState,
    pub private_ip: Option<String>,
    pub region: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persistent storage attached to a machine.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub size_gb: u32,
    pub region: Option<String>,
    pub encrypted: bool,
    pub attached_machine_id: Option<MachineId>,
}

/// Where to open an SSH connection for a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
