//! # machine-kvm
//!
//! KVM driver for host provisioning tools.
//! Manages the lifecycle of a single VM through libvirt and finds the guest's
//! IP address once it has booted.
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "libvirt")]
//! # async fn example(provisioners: machine_kvm::Provisioners) -> machine_kvm::Result<()> {
//! use machine_kvm::{libvirt::LibvirtConnector, DomainState, Machine, MachineSpec};
//!
//! let spec = MachineSpec::builder("dev", "/var/lib/machines/dev")
//!     .memory_mb(2048)
//!     .cpu_count(2)
//!     .build()?;
//!
//! let mut machine = Machine::new(spec, LibvirtConnector, provisioners)?;
//! machine.pre_create_check().await?;
//!
//! // Defines the domain, powers it on and waits for an IP
//! machine.create().await?;
//! assert_eq!(machine.state().await?, DomainState::Running);
//! println!("engine at {:?}", machine.url().await?);
//!
//! // Cleanup
//! machine.stop().await?;
//! machine.remove().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle Management**: Create, start, stop, restart, kill and remove a VM
//! - **Private Network**: An isolated DHCP network is created on first use and shared
//! - **IP Discovery**: dnsmasq lease file first, libvirt's lease table as fallback
//! - **Persistent Storage**: Optional relocation of the images to a host path
//! - **Test Doubles**: [`mock`] provides an in-memory hypervisor
//!
//! The real backend lives behind the `libvirt` cargo feature, since it links
//! against the libvirt client library.

mod config;
mod connection;
mod descriptor;
mod discovery;
mod error;
mod hypervisor;
mod machine;
mod network;
mod poll;
mod storage;
mod xml;

#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod mock;

pub use config::{
    DiskCacheMode, DiskIoMode, MachineSpec, MachineSpecBuilder, BOOT_IMAGE_FILENAME,
    DEFAULT_CONNECTION_URI, DEFAULT_LEASE_DIR, DEFAULT_PRIVATE_NETWORK, SSH_KEY_FILENAME,
};
pub use connection::Connection;
pub use descriptor::{parse_interfaces, render_domain, InterfaceInfo, PRIVATE_INTERFACE_INDEX};
pub use discovery::{ip_from_dhcp_leases, ip_from_leases, resolve_ip};
pub use error::{DriverError, Result};
pub use hypervisor::{
    Connector, DhcpLease, DomainHandle, DomainState, NativeState, NetworkHandle, Session,
};
pub use machine::{Driver, Machine, DRIVER_NAME, ENGINE_PORT};
pub use network::{ensure_private_network, ensure_public_network, NetworkLayout};
pub use poll::{poll_until, PollPolicy};
pub use storage::{
    BootMediaSource, DiskImageBuilder, KeyPairGenerator, Provisioners, RelocatedImages,
};
