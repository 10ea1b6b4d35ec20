//! Machine specification: the declarative description of the one VM a driver owns.

use crate::error::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default hypervisor endpoint.
pub const DEFAULT_CONNECTION_URI: &str = "qemu:///system";

/// Default name of the isolated DHCP network shared by all machines.
pub const DEFAULT_PRIVATE_NETWORK: &str = "docker-machines";

/// Directory where the hypervisor's dnsmasq keeps `<network>.leases`.
pub const DEFAULT_LEASE_DIR: &str = "/var/lib/libvirt/dnsmasq";

/// File name of the cached boot media inside the store.
pub const BOOT_IMAGE_FILENAME: &str = "boot-image";

/// File name of the private SSH key inside the store.
pub const SSH_KEY_FILENAME: &str = "id_rsa";

/// Disk cache mode passed through to the hypervisor disk driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskCacheMode {
    #[default]
    Default,
    None,
    Writethrough,
    Writeback,
    Directsync,
    Unsafe,
}

impl DiskCacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::None => "none",
            Self::Writethrough => "writethrough",
            Self::Writeback => "writeback",
            Self::Directsync => "directsync",
            Self::Unsafe => "unsafe",
        }
    }
}

impl fmt::Display for DiskCacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskCacheMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "none" => Ok(Self::None),
            "writethrough" => Ok(Self::Writethrough),
            "writeback" => Ok(Self::Writeback),
            "directsync" => Ok(Self::Directsync),
            "unsafe" => Ok(Self::Unsafe),
            other => Err(DriverError::Config(format!(
                "unknown disk cache mode '{other}' \
                 (expected default, none, writethrough, writeback, directsync or unsafe)"
            ))),
        }
    }
}

/// Disk IO mode passed through to the hypervisor disk driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskIoMode {
    #[default]
    Threads,
    Native,
}

impl DiskIoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threads => "threads",
            Self::Native => "native",
        }
    }
}

impl fmt::Display for DiskIoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskIoMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "threads" => Ok(Self::Threads),
            "native" => Ok(Self::Native),
            other => Err(DriverError::Config(format!(
                "unknown disk IO mode '{other}' (expected threads or native)"
            ))),
        }
    }
}

/// Configuration for the single VM managed by a driver instance.
///
/// Immutable once `create` begins, except for `boot_image_path` and
/// `disk_path`, which are rewritten once if the images are relocated to
/// `host_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Unique machine name, also the hypervisor domain name
    pub machine_name: String,
    /// Per-machine store directory owned by the orchestrator
    pub store_path: PathBuf,
    /// Memory size in MB
    pub memory_mb: u32,
    /// Number of virtual CPUs
    pub cpu_count: u32,
    /// Disk size in MB (1 MB = 1_000_000 bytes)
    pub disk_size_mb: u64,
    /// Seconds to wait after power-on before polling for an IP
    pub boot_wait_secs: u64,
    /// Public-facing network, must already exist
    pub network: String,
    /// Isolated DHCP network, created on demand
    pub private_network: String,
    /// Boot media source handed to the boot media collaborator
    pub boot_image_source: Option<String>,
    /// Boot image on local storage
    pub boot_image_path: PathBuf,
    /// Raw disk image on local storage
    pub disk_path: PathBuf,
    /// Disk cache mode
    pub cache_mode: DiskCacheMode,
    /// Disk IO mode
    pub io_mode: DiskIoMode,
    /// SSH user inside the guest
    pub ssh_user: String,
    /// SSH port inside the guest
    pub ssh_port: u16,
    /// Persistent storage root on the hypervisor host (optional)
    pub host_path: Option<PathBuf>,
    /// Hypervisor endpoint
    pub connection_uri: String,
    /// Directory holding dnsmasq lease files
    pub lease_dir: PathBuf,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self::for_store("default", PathBuf::from("/tmp/machine-kvm/default"))
    }
}

impl MachineSpec {
    fn for_store(name: &str, store_path: PathBuf) -> Self {
        Self {
            machine_name: name.to_string(),
            boot_image_path: store_path.join(BOOT_IMAGE_FILENAME),
            disk_path: store_path.join(format!("{name}.img")),
            store_path,
            memory_mb: 1024,
            cpu_count: 1,
            disk_size_mb: 20_000,
            boot_wait_secs: 90,
            network: "default".into(),
            private_network: DEFAULT_PRIVATE_NETWORK.into(),
            boot_image_source: None,
            cache_mode: DiskCacheMode::Default,
            io_mode: DiskIoMode::Threads,
            ssh_user: "docker".into(),
            ssh_port: 22,
            host_path: None,
            connection_uri: DEFAULT_CONNECTION_URI.into(),
            lease_dir: PathBuf::from(DEFAULT_LEASE_DIR),
        }
    }

    /// Create a new spec builder for `name`, storing local assets under `store_path`.
    pub fn builder(name: impl Into<String>, store_path: impl Into<PathBuf>) -> MachineSpecBuilder {
        let name = name.into();
        MachineSpecBuilder {
            spec: Self::for_store(&name, store_path.into()),
        }
    }

    /// Load a spec previously persisted with [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Serialize the spec for the orchestrator's machine config file.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.machine_name.is_empty() {
            return Err(DriverError::Config("machine_name is required".into()));
        }
        if self.machine_name.contains('/') || self.machine_name.contains('\\') {
            return Err(DriverError::Config(format!(
                "machine_name must not contain path separators, got {}",
                self.machine_name
            )));
        }
        if self.memory_mb == 0 {
            return Err(DriverError::Config("memory_mb must be > 0".into()));
        }
        if self.cpu_count == 0 {
            return Err(DriverError::Config("cpu_count must be > 0".into()));
        }
        if self.disk_size_mb == 0 {
            return Err(DriverError::Config("disk_size_mb must be > 0".into()));
        }
        if self.disk_size_mb.checked_mul(1_000_000).is_none() {
            return Err(DriverError::Config(format!(
                "disk_size_mb is too large, got {}",
                self.disk_size_mb
            )));
        }
        if self.network.is_empty() || self.private_network.is_empty() {
            return Err(DriverError::Config("network names must not be empty".into()));
        }
        if self.network == self.private_network {
            return Err(DriverError::Config(format!(
                "public and private network must differ, both are {}",
                self.network
            )));
        }
        if self.connection_uri.is_empty() {
            return Err(DriverError::Config("connection_uri is required".into()));
        }
        Ok(())
    }

    /// Exact size of the disk image in bytes.
    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_mb.saturating_mul(1_000_000)
    }

    /// Grace period between power-on and the first IP probe.
    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }

    /// Path of the private SSH key.
    pub fn ssh_key_path(&self) -> PathBuf {
        self.store_path.join(SSH_KEY_FILENAME)
    }

    /// Path of the public SSH key.
    pub fn public_key_path(&self) -> PathBuf {
        self.store_path.join(format!("{SSH_KEY_FILENAME}.pub"))
    }

    /// Lease file of the private network.
    pub fn lease_file(&self) -> PathBuf {
        self.lease_dir.join(format!("{}.leases", self.private_network))
    }

    /// Directory the images are relocated into when `host_path` is set.
    pub fn persistent_dir(&self) -> Option<PathBuf> {
        self.host_path
            .as_deref()
            .map(|root| persistent_dir_in(root, &self.machine_name))
    }
}

/// `<root>/<machine>_persistent`
pub(crate) fn persistent_dir_in(root: &Path, machine_name: &str) -> PathBuf {
    root.join(format!("{machine_name}_persistent"))
}

/// Builder for [`MachineSpec`].
#[derive(Debug, Clone)]
pub struct MachineSpecBuilder {
    spec: MachineSpec,
}

impl MachineSpecBuilder {
    /// Set memory in MB.
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.spec.memory_mb = mb;
        self
    }

    /// Set vCPU count.
    pub fn cpu_count(mut self, count: u32) -> Self {
        self.spec.cpu_count = count;
        self
    }

    /// Set disk size in MB.
    pub fn disk_size_mb(mut self, mb: u64) -> Self {
        self.spec.disk_size_mb = mb;
        self
    }

    /// Set the post power-on grace period.
    pub fn boot_wait(mut self, wait: Duration) -> Self {
        self.spec.boot_wait_secs = wait.as_secs();
        self
    }

    /// Set the public-facing network name.
    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.spec.network = name.into();
        self
    }

    /// Set the private DHCP network name.
    pub fn private_network(mut self, name: impl Into<String>) -> Self {
        self.spec.private_network = name.into();
        self
    }

    /// Set the boot media source identifier.
    pub fn boot_image_source(mut self, source: impl Into<String>) -> Self {
        self.spec.boot_image_source = Some(source.into());
        self
    }

    /// Set the disk cache mode.
    pub fn cache_mode(mut self, mode: DiskCacheMode) -> Self {
        self.spec.cache_mode = mode;
        self
    }

    /// Set the disk IO mode.
    pub fn io_mode(mut self, mode: DiskIoMode) -> Self {
        self.spec.io_mode = mode;
        self
    }

    /// Set the SSH user.
    pub fn ssh_user(mut self, user: impl Into<String>) -> Self {
        self.spec.ssh_user = user.into();
        self
    }

    /// Relocate images to `<path>/<machine>_persistent` on create.
    pub fn host_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.host_path = Some(path.into());
        self
    }

    /// Set the hypervisor endpoint.
    pub fn connection_uri(mut self, uri: impl Into<String>) -> Self {
        self.spec.connection_uri = uri.into();
        self
    }

    /// Set the dnsmasq lease directory.
    pub fn lease_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.lease_dir = dir.into();
        self
    }

    /// Build the specification, validating all fields.
    pub fn build(self) -> Result<MachineSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec = MachineSpec::builder("dev", "/store/dev").build().unwrap();
        assert_eq!(spec.memory_mb, 1024);
        assert_eq!(spec.disk_size_mb, 20_000);
        assert_eq!(spec.cpu_count, 1);
        assert_eq!(spec.boot_wait(), Duration::from_secs(90));
        assert_eq!(spec.private_network, "docker-machines");
        assert_eq!(spec.connection_uri, "qemu:///system");
        assert_eq!(spec.boot_image_path, PathBuf::from("/store/dev/boot-image"));
        assert_eq!(spec.disk_path, PathBuf::from("/store/dev/dev.img"));
        assert_eq!(spec.ssh_key_path(), PathBuf::from("/store/dev/id_rsa"));
        assert_eq!(spec.public_key_path(), PathBuf::from("/store/dev/id_rsa.pub"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(MachineSpec::builder("", "/s").build().is_err());
        assert!(MachineSpec::builder("a/b", "/s").build().is_err());
        assert!(MachineSpec::builder("dev", "/s").memory_mb(0).build().is_err());
        assert!(MachineSpec::builder("dev", "/s").cpu_count(0).build().is_err());
        assert!(MachineSpec::builder("dev", "/s").disk_size_mb(0).build().is_err());
        assert!(MachineSpec::builder("dev", "/s")
            .network("docker-machines")
            .build()
            .is_err());
    }

    #[test]
    fn test_disk_size_bytes_is_decimal() {
        let spec = MachineSpec::builder("dev", "/s").disk_size_mb(20_000).build().unwrap();
        assert_eq!(spec.disk_size_bytes(), 20_000_000_000);
    }

    #[test]
    fn test_validate_rejects_disk_size_overflowing_bytes() {
        let err = MachineSpec::builder("dev", "/s")
            .disk_size_mb(u64::MAX / 1000)
            .build()
            .unwrap_err();
        assert!(matches!(err, DriverError::Config(msg) if msg.contains("disk_size_mb")));
        assert!(MachineSpec::builder("dev", "/s")
            .disk_size_mb(u64::MAX / 1_000_000)
            .build()
            .is_ok());
    }

    #[test]
    fn test_lease_file_and_persistent_dir() {
        let spec = MachineSpec::builder("dev", "/s")
            .lease_dir("/leases")
            .host_path("/srv/vms")
            .build()
            .unwrap();
        assert_eq!(spec.lease_file(), PathBuf::from("/leases/docker-machines.leases"));
        assert_eq!(spec.persistent_dir(), Some(PathBuf::from("/srv/vms/dev_persistent")));
        assert_eq!(MachineSpec::default().persistent_dir(), None);
    }

    #[test]
    fn test_modes_parse_and_display() {
        assert_eq!("WriteBack".parse::<DiskCacheMode>().unwrap(), DiskCacheMode::Writeback);
        assert_eq!(DiskCacheMode::Directsync.to_string(), "directsync");
        assert_eq!("native".parse::<DiskIoMode>().unwrap(), DiskIoMode::Native);
        assert!("async".parse::<DiskIoMode>().is_err());
        assert!("fast".parse::<DiskCacheMode>().is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_modes_lowercase() {
        let spec = MachineSpec::builder("dev", "/s")
            .cache_mode(DiskCacheMode::Unsafe)
            .io_mode(DiskIoMode::Native)
            .build()
            .unwrap();
        let json = spec.to_json().unwrap();
        assert!(json.contains("\"cache_mode\": \"unsafe\""));
        assert!(json.contains("\"io_mode\": \"native\""));
        assert_eq!(MachineSpec::from_json(&json).unwrap(), spec);
    }
}
