//! Hypervisor management API seam.
//!
//! The driver only talks to the hypervisor through these traits. The
//! `libvirt` feature provides the real implementation; [`crate::mock`]
//! provides an in-memory one.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

/// Opens sessions to a hypervisor endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Session: Session;

    /// Open a new session to `uri`.
    ///
    /// # Errors
    /// Returns [`DriverError::Connection`](crate::DriverError::Connection)
    /// if the endpoint is unreachable or the caller is not authorized.
    async fn connect(&self, uri: &str) -> Result<Self::Session>;
}

/// An open session to the hypervisor.
#[async_trait]
pub trait Session: Send + Sync {
    /// Handle to a domain record.
    type Domain: DomainHandle;
    /// Handle to a virtual network.
    type Network: NetworkHandle;

    /// Version of the hypervisor management library.
    async fn lib_version(&self) -> Result<u64>;

    /// Look a domain up by name; `None` if no such domain is defined.
    async fn lookup_domain(&self, name: &str) -> Result<Option<Self::Domain>>;

    /// Register a persistent domain from its descriptor.
    async fn define_domain(&self, xml: &str) -> Result<Self::Domain>;

    /// Look a network up by name; `None` if no such network is defined.
    async fn lookup_network(&self, name: &str) -> Result<Option<Self::Network>>;

    /// Register a persistent network from its descriptor.
    async fn define_network(&self, xml: &str) -> Result<Self::Network>;
}

/// Hypervisor record of a single VM.
#[async_trait]
pub trait DomainHandle: Clone + Send + Sync {
    /// Power on.
    async fn create(&self) -> Result<()>;

    /// Request a graceful (ACPI) shutdown. Returns before the guest is off.
    async fn shutdown(&self) -> Result<()>;

    /// Forced power-off.
    async fn destroy(&self) -> Result<()>;

    /// Remove the domain record.
    async fn undefine(&self) -> Result<()>;

    /// Current native state.
    async fn state(&self) -> Result<NativeState>;

    /// Live descriptor as the hypervisor reports it.
    async fn xml_desc(&self) -> Result<String>;
}

/// Hypervisor record of a virtual network.
#[async_trait]
pub trait NetworkHandle: Send + Sync {
    /// Network name.
    async fn name(&self) -> Result<String>;

    /// Live descriptor as the hypervisor reports it.
    async fn xml_desc(&self) -> Result<String>;

    /// Whether the network is running.
    async fn is_active(&self) -> Result<bool>;

    /// Start the network.
    async fn create(&self) -> Result<()>;

    /// Start the network together with the hypervisor daemon.
    async fn set_autostart(&self, autostart: bool) -> Result<()>;

    /// Current DHCP leases handed out on this network.
    async fn dhcp_leases(&self) -> Result<Vec<DhcpLease>>;
}

/// One DHCP lease as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    /// Client MAC address
    pub mac: String,
    /// Leased IP address
    pub ip_addr: String,
    /// Client hostname, if it sent one
    pub hostname: Option<String>,
}

/// Domain state codes as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl NativeState {
    /// Decode a libvirt `virDomainState` value. Unknown codes decode to `NoState`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }
}

/// Driver-level view of a domain's state.
///
/// Always read fresh from the hypervisor, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    None,
    Running,
    Paused,
    Stopped,
    Error,
    Saved,
}

impl From<NativeState> for DomainState {
    fn from(native: NativeState) -> Self {
        match native {
            NativeState::NoState => DomainState::None,
            NativeState::Running => DomainState::Running,
            // Blocked is not really an error, but callers never needed the difference.
            NativeState::Blocked | NativeState::Crashed => DomainState::Error,
            NativeState::Paused => DomainState::Paused,
            NativeState::Shutdown | NativeState::Shutoff => DomainState::Stopped,
            NativeState::PmSuspended => DomainState::Saved,
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainState::None => write!(f, "none"),
            DomainState::Running => write!(f, "running"),
            DomainState::Paused => write!(f, "paused"),
            DomainState::Stopped => write!(f, "stopped"),
            DomainState::Error => write!(f, "error"),
            DomainState::Saved => write!(f, "saved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(DomainState::from(NativeState::NoState), DomainState::None);
        assert_eq!(DomainState::from(NativeState::Running), DomainState::Running);
        assert_eq!(DomainState::from(NativeState::Blocked), DomainState::Error);
        assert_eq!(DomainState::from(NativeState::Crashed), DomainState::Error);
        assert_eq!(DomainState::from(NativeState::Paused), DomainState::Paused);
        assert_eq!(DomainState::from(NativeState::Shutdown), DomainState::Stopped);
        assert_eq!(DomainState::from(NativeState::Shutoff), DomainState::Stopped);
        assert_eq!(DomainState::from(NativeState::PmSuspended), DomainState::Saved);
    }

    #[test]
    fn test_native_from_code() {
        assert_eq!(NativeState::from_code(1), NativeState::Running);
        assert_eq!(NativeState::from_code(5), NativeState::Shutoff);
        assert_eq!(NativeState::from_code(7), NativeState::PmSuspended);
        assert_eq!(NativeState::from_code(42), NativeState::NoState);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(DomainState::Stopped.to_string(), "stopped");
        assert_eq!(DomainState::Saved.to_string(), "saved");
    }
}
