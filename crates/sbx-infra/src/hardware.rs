//! Machine size validation.
//!
//! Only the combinations in the table below are accepted. Anything else is
//! rejected with one [`FieldError`] per offending field, never coerced into the
//! nearest legal size.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Region GPU machines are pinned to, whatever the configured default.
pub const GPU_REGION: &str = "ord";

pub const MIN_VOLUME_GB: u32 = 1;
pub const MAX_VOLUME_GB: u32 = 500;

const SHARED_CPUS: &[u32] = &[1, 2, 4, 8];
const SHARED_MEMORY_PER_CPU: &[u32] = &[256, 512, 1024, 2048];
const PERFORMANCE_CPUS: &[u32] = &[1, 2, 4, 8, 16];
const PERFORMANCE_MEMORY_PER_CPU: &[u32] = &[2048, 4096, 8192];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuKind {
    Shared,
    Performance,
}

impl CpuKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Performance => "performance",
        }
    }

    fn cpu_options(&self) -> &'static [u32] {
        match self {
            Self::Shared => SHARED_CPUS,
            Self::Performance => PERFORMANCE_CPUS,
        }
    }

    fn memory_per_cpu(&self) -> &'static [u32] {
        match self {
            Self::Shared => SHARED_MEMORY_PER_CPU,
            Self::Performance => PERFORMANCE_MEMORY_PER_CPU,
        }
    }

    /// Legal memory sizes for `cpus` cores of this kind.
    pub fn memory_options(&self, cpus: u32) -> Vec<u32> {
        self.memory_per_cpu().iter().map(|mb| mb * cpus).collect()
    }
}

impl fmt::Display for CpuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "performance" => Ok(Self::Performance),
            other => Err(format!("unknown cpu kind `{other}` (expected shared or performance)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuKind {
    #[serde(rename = "a10")]
    A10,
    #[serde(rename = "l40s")]
    L40s,
    #[serde(rename = "a100-40gb")]
    A100Gb40,
    #[serde(rename = "a100-80gb")]
    A100Gb80,
}

impl GpuKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A10 => "a10",
            Self::L40s => "l40s",
            Self::A100Gb40 => "a100-40gb",
            Self::A100Gb80 => "a100-80gb",
        }
    }
}

impl fmt::Display for GpuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a10" => Ok(Self::A10),
            "l40s" => Ok(Self::L40s),
            "a100-40gb" => Ok(Self::A100Gb40),
            "a100-80gb" => Ok(Self::A100Gb80),
            other => Err(format!("unknown gpu kind `{other}`")),
        }
    }
}

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// All fields rejected by a validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|e| e.field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Unvalidated hardware request as it arrives from a client or a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub cpu_kind: String,
    pub cpus: i64,
    pub memory_mb: i64,
    pub volume_size_gb: i64,
    #[serde(default)]
    pub gpu_kind: Option<String>,
}

impl Default for HardwareSpec {
    fn default() -> Self {
        Self {
            cpu_kind: CpuKind::Shared.as_str().into(),
            cpus: 1,
            memory_mb: 1024,
            volume_size_gb: 10,
            gpu_kind: None,
        }
    }
}

impl HardwareSpec {
    pub fn validate(&self) -> Result<HardwareConfig, ValidationErrors> {
        let mut errors = Vec::new();

        let cpu_kind = match self.cpu_kind.parse::<CpuKind>() {
            Ok(kind) => Some(kind),
            Err(message) => {
                errors.push(FieldError {
                    field: "cpu_kind",
                    message,
                });
                None
            }
        };

        let cpus = u32::try_from(self.cpus).ok();
        let memory_mb = u32::try_from(self.memory_mb).ok();

        if let Some(kind) = cpu_kind {
            match cpus.filter(|c| kind.cpu_options().contains(c)) {
                Some(cpus) => {
                    let options = kind.memory_options(cpus);
                    if !memory_mb.is_some_and(|mb| options.contains(&mb)) {
                        errors.push(FieldError {
                            field: "memory_mb",
                            message: format!(
                                "{} MB is not offered for {cpus} {kind} cpu(s); allowed: {options:?}",
                                self.memory_mb
                            ),
                        });
                    }
                }
                None => errors.push(FieldError {
                    field: "cpus",
                    message: format!(
                        "{} is not a valid {kind} cpu count; allowed: {:?}",
                        self.cpus,
                        kind.cpu_options()
                    ),
                }),
            }
        }

        let volume_size_gb = u32::try_from(self.volume_size_gb)
            .ok()
            .filter(|gb| (MIN_VOLUME_GB..=MAX_VOLUME_GB).contains(gb));
        if volume_size_gb.is_none() {
            errors.push(FieldError {
                field: "volume_size_gb",
                message: format!(
                    "{} GB is outside [{MIN_VOLUME_GB}, {MAX_VOLUME_GB}]",
                    self.volume_size_gb
                ),
            });
        }

        let gpu_kind = match self.gpu_kind.as_deref() {
            None => None,
            Some(raw) => match raw.parse::<GpuKind>() {
                Ok(gpu) => {
                    if cpu_kind == Some(CpuKind::Shared) {
                        errors.push(FieldError {
                            field: "gpu_kind",
                            message: "gpu machines require performance cpus".into(),
                        });
                    }
                    Some(gpu)
                }
                Err(message) => {
                    errors.push(FieldError {
                        field: "gpu_kind",
                        message,
                    });
                    None
                }
            },
        };

        match (cpu_kind, cpus, memory_mb, volume_size_gb) {
            (Some(cpu_kind), Some(cpus), Some(memory_mb), Some(volume_size_gb))
                if errors.is_empty() =>
            {
                Ok(HardwareConfig {
                    cpu_kind,
                    cpus,
                    memory_mb,
                    volume_size_gb,
                    gpu_kind,
                })
            }
            _ => Err(ValidationErrors(errors)),
        }
    }
}

/// A machine size that passed [`HardwareSpec::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HardwareConfig {
    pub cpu_kind: CpuKind,
    pub cpus: u32,
    pub memory_mb: u32,
    pub volume_size_gb: u32,
    pub gpu_kind: Option<GpuKind>,
}

impl HardwareConfig {
    /// Region this hardware must run in, if availability constrains it.
    pub fn pinned_region(&self) -> Option<&'static str> {
        self.gpu_kind.map(|_| GPU_REGION)
    }
}

/// Every legal `(cpu_kind, cpus, memory_mb)` triple.
pub fn combinations() -> impl Iterator<Item = (CpuKind, u32, u32)> {
    [CpuKind::Shared, CpuKind::Performance]
        .into_iter()
        .flat_map(|kind| {
            kind.cpu_options().iter().flat_map(move |&cpus| {
                kind.memory_options(cpus)
                    .into_iter()
                    .map(move |mb| (kind, cpus, mb))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cpu_kind: &str, cpus: i64, memory_mb: i64) -> HardwareSpec {
        HardwareSpec {
            cpu_kind: cpu_kind.into(),
            cpus,
            memory_mb,
            volume_size_gb: 10,
            gpu_kind: None,
        }
    }

    #[test]
    fn every_table_entry_validates() {
        for (kind, cpus, mb) in combinations() {
            let config = spec(kind.as_str(), cpus.into(), mb.into())
                .validate()
                .unwrap_or_else(|e| panic!("{kind} {cpus} {mb} rejected: {e}"));
            assert_eq!((config.cpu_kind, config.cpus, config.memory_mb), (kind, cpus, mb));
        }
    }

    #[test]
    fn accepted_configs_are_table_members() {
        let table: Vec<_> = combinations().collect();
        for kind in ["shared", "performance"] {
            for cpus in 0..=20 {
                for mb in (0..=131_072).step_by(128) {
                    if let Ok(config) = spec(kind, cpus, mb).validate() {
                        assert!(
                            table.contains(&(config.cpu_kind, config.cpus, config.memory_mb)),
                            "{kind} {cpus} {mb} accepted but not in table"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn rejects_memory_not_offered_for_cpu_count() {
        let err = spec("shared", 2, 256).validate().unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["memory_mb"]);
    }

    #[test]
    fn reports_every_bad_field() {
        let err = HardwareSpec {
            cpu_kind: "shared".into(),
            cpus: 3,
            memory_mb: 1024,
            volume_size_gb: 501,
            gpu_kind: Some("h100".into()),
        }
        .validate()
        .unwrap_err();

        assert_eq!(
            err.fields().collect::<Vec<_>>(),
            vec!["cpus", "volume_size_gb", "gpu_kind"]
        );
    }

    #[test]
    fn unknown_cpu_kind_is_a_field_error() {
        let err = spec("burst", 1, 256).validate().unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["cpu_kind"]);
    }

    #[test]
    fn volume_bounds_are_inclusive() {
        for gb in [1, 500] {
            let mut s = spec("shared", 1, 256);
            s.volume_size_gb = gb;
            assert!(s.validate().is_ok());
        }
        let mut s = spec("shared", 1, 256);
        s.volume_size_gb = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn gpu_requires_performance_and_pins_region() {
        let mut shared = spec("shared", 8, 2048);
        shared.gpu_kind = Some("a10".into());
        assert_eq!(
            shared.validate().unwrap_err().fields().collect::<Vec<_>>(),
            vec!["gpu_kind"]
        );

        let mut perf = spec("performance", 8, 16384);
        perf.gpu_kind = Some("a100-80gb".into());
        let config = perf.validate().unwrap();
        assert_eq!(config.gpu_kind, Some(GpuKind::A100Gb80));
        assert_eq!(config.pinned_region(), Some(GPU_REGION));
    }

    #[test]
    fn negative_numbers_are_rejected_not_wrapped() {
        let err = spec("performance", -1, -2048).validate().unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["cpus"]);
    }
}
