//! Daemon-level configuration and the VM configuration JSON shape consumed by
//! `--config-file` direct boots.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Error loading or validating a [`DaemonConfig`]. Deliberately separate from
/// [`crate::error::ControllerError`]: this is ambient startup plumbing, not part of
/// the hypervisor-facing operational surface.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file `{}`: {source}", path.display())]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse configuration file `{}`: {source}", path.display())]
    Parse { path: PathBuf, #[source] source: serde_json::Error },
    #[error("configured path `{}` for `{field}` does not exist", path.display())]
    MissingResource { field: &'static str, path: PathBuf },
    #[error("configured path `{}` for `{field}` must be absolute", path.display())]
    RelativeResource { field: &'static str, path: PathBuf },
}

/// Daemon-wide configuration, mirroring the reference runtime's `Config` struct.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub log_level: String,
    pub base_path: PathBuf,
    pub images: Vec<PathBuf>,
    pub kernels: Vec<PathBuf>,
    pub executables: Vec<PathBuf>,
    pub redis_host: String,
    pub redis_passwd: String,
    #[serde(default)]
    pub faascale_mem_config: Option<FaascaleMemConfig>,
}

/// Daemon-wide defaults for the scalable-memory device, mirroring the reference
/// runtime's `FaascaleMemConfig` struct.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct FaascaleMemConfig {
    #[serde(rename = "pre_alloc_mem")]
    pub pre_alloc_memory: bool,
    pub pre_tdp_fault: bool,
    pub stats_polling_interval_s: u32,
}

impl DaemonConfig {
    /// Load and validate a [`DaemonConfig`] from a JSON file, mirroring the reference
    /// runtime's `verifyResource` checks: every referenced kernel/image/executable
    /// path must exist and be absolute.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: DaemonConfig = serde_json::from_slice(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

        verify_resource("base_path", std::slice::from_ref(&config.base_path)).await?;
        verify_resource("images", &config.images).await?;
        verify_resource("kernels", &config.kernels).await?;
        verify_resource("executables", &config.executables).await?;

        Ok(config)
    }
}

async fn verify_resource(field: &'static str, paths: &[PathBuf]) -> Result<(), ConfigError> {
    for path in paths {
        if !path.is_absolute() {
            return Err(ConfigError::RelativeResource { field, path: path.clone() });
        }
        if tokio::fs::metadata(path).await.is_err() {
            return Err(ConfigError::MissingResource { field, path: path.clone() });
        }
    }
    Ok(())
}

/// Boot source section of the direct-boot VM config: kernel image plus fixed boot args.
#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

impl BootSource {
    /// Fixed boot args used by every direct-boot VM.
    pub const DEFAULT_BOOT_ARGS: &'static str =
        "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on i8042.nokbd i8042.noaux";

    pub fn new(kernel_image_path: PathBuf) -> Self {
        Self {
            kernel_image_path,
            boot_args: Self::DEFAULT_BOOT_ARGS.to_string(),
        }
    }
}

/// A single block device attached to the VM; the core only ever attaches a single
/// read-only rootfs drive.
#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
    pub track_dirty_pages: bool,
}

impl MachineConfig {
    /// Memory size is floored at 512 MiB regardless of the requested amount.
    pub const MIN_MEM_SIZE_MIB: u64 = 512;

    pub fn new(vcpu_count: u32, requested_mem_size_mib: u64) -> Self {
        Self {
            vcpu_count,
            mem_size_mib: requested_mem_size_mib.max(Self::MIN_MEM_SIZE_MIB),
            track_dirty_pages: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Balloon {
    pub amount_mib: u64,
    pub deflate_on_oom: bool,
    pub stats_polling_interval_s: u32,
}

impl Balloon {
    /// `functionMemSize = max(512, function_mem_size)`, `amount_mib = max(0, mem_size -
    /// functionMemSize)`, `deflate_on_oom = false`, polling once a second. `mem_size_mib`
    /// is the raw requested VM memory size, not the already-512-floored machine-config value.
    pub fn new(mem_size_mib: u64, function_mem_size_mib: u64) -> Self {
        let function_mem_size_mib = function_mem_size_mib.max(MachineConfig::MIN_MEM_SIZE_MIB);
        Self {
            amount_mib: mem_size_mib.saturating_sub(function_mem_size_mib),
            deflate_on_oom: false,
            stats_polling_interval_s: 1,
        }
    }
}

/// Scalable-memory device section of the direct-boot VM config, populated from the
/// daemon's own [`FaascaleMemConfig`] defaults rather than anything per-request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FaascaleMem {
    pub pre_alloc_mem: bool,
    pub pre_tdp_fault: bool,
    pub stats_polling_interval_s: u32,
}

impl From<FaascaleMemConfig> for FaascaleMem {
    fn from(config: FaascaleMemConfig) -> Self {
        Self {
            pre_alloc_mem: config.pre_alloc_memory,
            pre_tdp_fault: config.pre_tdp_fault,
            stats_polling_interval_s: config.stats_polling_interval_s,
        }
    }
}

/// Top-level direct-boot VM configuration, marshalled to `vm_path/vm_config.json`.
///
/// Exactly one of `balloon` / `faascale_mem` may be set (§3 invariant); this is
/// enforced by the controller before construction, not by this type.
#[derive(Debug, Clone, Serialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balloon: Option<Balloon>,
    #[serde(rename = "faascale-mem", skip_serializing_if = "Option::is_none")]
    pub faascale_mem: Option<FaascaleMem>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use std::io::Write;

    #[test]
    fn machine_config_floors_memory_at_512_mib() {
        assert_eq!(MachineConfig::new(2, 128).mem_size_mib, 512);
        assert_eq!(MachineConfig::new(2, 1024).mem_size_mib, 1024);
    }

    #[test]
    fn balloon_amount_is_mem_size_minus_function_mem_size() {
        let balloon = Balloon::new(1024, 256);
        assert_eq!(balloon.amount_mib, 768);
        assert!(!balloon.deflate_on_oom);
    }

    #[test]
    fn balloon_amount_never_goes_negative() {
        let balloon = Balloon::new(256, 1024);
        assert_eq!(balloon.amount_mib, 0);
    }

    #[test]
    fn balloon_floors_function_mem_size_at_512_mib_before_subtracting() {
        // function_mem_size_mib (128) is floored to 512 before the subtraction, so the
        // raw, unfloored mem_size_mib (1024) yields 512, not 896.
        let balloon = Balloon::new(1024, 128);
        assert_eq!(balloon.amount_mib, 512);
    }

    #[test]
    fn boot_source_carries_fixed_boot_args() {
        let boot_source = BootSource::new(PathBuf::from("/kernels/vmlinux"));
        assert_eq!(boot_source.boot_args, BootSource::DEFAULT_BOOT_ARGS);
    }

    #[tokio::test]
    async fn load_rejects_relative_resource_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("daemon.json");
        let mut file = std::fs::File::create(&config_path).unwrap();
        write!(
            file,
            r#"{{"log_level":"info","base_path":"{base}","images":["relative/image.img"],"kernels":[],"executables":[],"redis_host":"h","redis_passwd":"p"}}"#,
            base = dir.path().display(),
        )
        .unwrap();

        let err = DaemonConfig::load(&config_path).await.unwrap_err();
        assert_matches!(err, ConfigError::RelativeResource { field: "images", .. });
    }

    #[tokio::test]
    async fn load_rejects_missing_resource_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("daemon.json");
        let missing = dir.path().join("nope.img");
        let mut file = std::fs::File::create(&config_path).unwrap();
        write!(
            file,
            r#"{{"log_level":"info","base_path":"{base}","images":["{missing}"],"kernels":[],"executables":[],"redis_host":"h","redis_passwd":"p"}}"#,
            base = dir.path().display(),
            missing = missing.display(),
        )
        .unwrap();

        let err = DaemonConfig::load(&config_path).await.unwrap_err();
        assert_matches!(err, ConfigError::MissingResource { field: "images", .. });
    }
}
