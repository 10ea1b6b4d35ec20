//! Error types for machine-kvm.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for machine-kvm operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while driving a VM through the hypervisor.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The hypervisor endpoint could not be opened.
    #[error(
        "unable to connect to the hypervisor at {uri}: {message} \
         (is the current user a member of the libvirt group?)"
    )]
    Connection {
        /// Endpoint that was dialed
        uri: String,
        /// Backend message
        message: String,
    },

    /// The private network exists but carries no usable DHCP setup
    #[error("network {0} doesn't have DHCP configured properly")]
    MisconfiguredNetwork(String),

    /// A network this driver never creates is missing
    #[error("network {0} not found")]
    NetworkNotFound(String),

    /// Disk or relocation target already exists and cannot be reused
    #[error("storage conflict at {}: {reason}", path.display())]
    StorageConflict {
        /// Offending path
        path: PathBuf,
        /// Why it can't be reused
        reason: String,
    },

    /// The live domain descriptor lacks the private network interface
    #[error("VM doesn't have enough network interfaces: expected at least 2, found {found}")]
    Topology {
        /// Number of interfaces present
        found: usize,
    },

    /// A lease file line could not be split into its fields
    #[error("malformed lease file {}: line {line} has fewer than 3 fields", path.display())]
    MalformedLeaseFile {
        /// Lease file path
        path: PathBuf,
        /// 1-based line number
        line: usize,
    },

    /// Graceful shutdown did not finish in time
    #[error("VM {name} failed to gracefully shutdown after {waited:?}, try the kill command")]
    ShutdownTimeout {
        /// Machine name
        name: String,
        /// How long the driver waited
        waited: Duration,
    },

    /// The domain record could not be removed
    #[error("failed to undefine VM {name}: {message} (remove any disk snapshots first)")]
    Undefine {
        /// Machine name
        name: String,
        /// Backend message
        message: String,
    },

    /// No domain with this name is known to the hypervisor
    #[error("VM {0} not found")]
    DomainNotFound(String),

    /// VM is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A descriptor returned by the hypervisor could not be parsed
    #[error("malformed descriptor: {0}")]
    Descriptor(String),

    /// Any other hypervisor call failure
    #[error("hypervisor call '{op}' failed: {message}")]
    Hypervisor {
        /// Call that failed
        op: &'static str,
        /// Backend message
        message: String,
    },

    /// A boot media, key or disk image collaborator failed
    #[error("{step} failed: {message}")]
    Provision {
        /// Provisioning sub-step
        step: &'static str,
        /// Collaborator message
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Build a [`DriverError::Hypervisor`] from any displayable backend error.
    pub fn hypervisor(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Hypervisor {
            op,
            message: err.to_string(),
        }
    }

    /// Build a [`DriverError::Provision`] from any displayable collaborator error.
    pub fn provision(step: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Provision {
            step,
            message: err.to_string(),
        }
    }

    /// Check if the operator can recover without fixing the environment.
    ///
    /// Only a stuck shutdown qualifies: escalating to `kill` resolves it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DriverError::ShutdownTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_mentions_group() {
        let err = DriverError::Connection {
            uri: "qemu:///system".into(),
            message: "permission denied".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("qemu:///system"));
        assert!(msg.contains("libvirt group"));
    }

    #[test]
    fn test_shutdown_timeout_mentions_kill() {
        let err = DriverError::ShutdownTimeout {
            name: "dev".into(),
            waited: Duration::from_secs(90),
        };
        assert!(err.to_string().contains("kill"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(!DriverError::Topology { found: 1 }.is_recoverable());
        assert!(!DriverError::NetworkNotFound("default".into()).is_recoverable());
    }

    #[test]
    fn test_hypervisor_helper() {
        let err = DriverError::hypervisor("define domain", "boom");
        assert_eq!(err.to_string(), "hypervisor call 'define domain' failed: boom");
    }
}
