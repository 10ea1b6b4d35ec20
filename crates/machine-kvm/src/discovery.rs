//! Guest IP discovery.
//!
//! The guest's private interface MAC is read from the live domain descriptor
//! and looked up in two places, in order:
//!
//! 1. the dnsmasq lease file of the private network
//! 2. the hypervisor's own DHCP lease table for that network
//!
//! Neither source having an entry is the normal state right after power-on
//! and is reported as `None`, not as an error.

use crate::descriptor;
use crate::error::{DriverError, Result};
use crate::hypervisor::{DhcpLease, DomainHandle, NetworkHandle, Session};
use std::path::Path;

/// MAC address of the domain's private network interface.
///
/// # Errors
/// Returns [`DriverError::Topology`] if the live descriptor has fewer than
/// two interfaces.
pub async fn private_mac<D: DomainHandle>(domain: &D) -> Result<String> {
    let desc = domain.xml_desc().await?;
    descriptor::private_mac(&desc)
}

/// Look `mac` up in dnsmasq lease file contents.
///
/// Each non-empty line reads `<expiry> <mac> <ip> [hostname] [client-id]`.
/// MACs compare case-insensitively.
///
/// # Errors
/// Returns [`DriverError::MalformedLeaseFile`] for a line with fewer than
/// three fields; the whole file is distrusted rather than the line skipped.
pub fn ip_from_leases(contents: &str, mac: &str, path: &Path) -> Result<Option<String>> {
    for (index, line) in contents.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 3 {
            tracing::warn!(
                path = %path.display(),
                line = index + 1,
                "Malformed dnsmasq lease line"
            );
            return Err(DriverError::MalformedLeaseFile {
                path: path.to_path_buf(),
                line: index + 1,
            });
        }
        if fields[1].eq_ignore_ascii_case(mac) {
            tracing::debug!(mac = %mac, ip = %fields[2], "Found lease in lease file");
            return Ok(Some(fields[2].to_string()));
        }
    }
    Ok(None)
}

/// Look `mac` up in the lease file at `path`.
///
/// A missing or unreadable file yields `None` so the caller can fall back.
pub async fn ip_from_lease_file(path: &Path, mac: &str) -> Result<Option<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Failed to read dnsmasq leases");
            return Ok(None);
        }
    };
    ip_from_leases(&contents, mac, path)
}

/// First lease whose MAC matches `mac` exactly.
pub fn ip_from_dhcp_leases(leases: &[DhcpLease], mac: &str) -> Option<String> {
    leases
        .iter()
        .find(|lease| lease.mac == mac)
        .map(|lease| lease.ip_addr.clone())
}

/// Ask the hypervisor for the leases of `network_name` and look `mac` up.
///
/// # Errors
/// Returns an error if the network can't be found or its leases can't be read.
pub async fn ip_from_network<S: Session>(
    session: &S,
    network_name: &str,
    mac: &str,
) -> Result<Option<String>> {
    let network = session.lookup_network(network_name).await?.ok_or_else(|| {
        tracing::warn!(network = %network_name, "Failed to find network");
        DriverError::NetworkNotFound(network_name.to_string())
    })?;
    let leases = network.dhcp_leases().await.map_err(|e| {
        tracing::warn!(network = %network_name, error = %e, "Failed to get DHCP leases");
        e
    })?;
    tracing::trace!(network = %network_name, count = leases.len(), "Fetched DHCP leases");
    Ok(ip_from_dhcp_leases(&leases, mac))
}

/// Resolve the guest IP of `domain`, lease file first, hypervisor second.
///
/// Returns `None` while neither source knows the guest yet.
pub async fn resolve_ip<S: Session>(
    session: &S,
    domain: &S::Domain,
    network_name: &str,
    lease_file: &Path,
) -> Result<Option<String>> {
    let mac = private_mac(domain).await?;

    if let Some(ip) = ip_from_lease_file(lease_file, &mac).await? {
        return Ok(Some(ip));
    }
    ip_from_network(session, network_name, &mac).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn path() -> PathBuf {
        PathBuf::from("/var/lib/libvirt/dnsmasq/docker-machines.leases")
    }

    const LEASES: &str = "\
1700000000 52:54:00:11:22:33 192.168.42.17 guest-a *
1700000100 AA:BB:CC:DD:EE:FF 192.168.42.23 guest-b 01:aa:bb:cc:dd:ee:ff
";

    #[test]
    fn test_lease_match_is_case_insensitive() {
        let ip = ip_from_leases(LEASES, "aa:bb:cc:dd:ee:ff", &path()).unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.42.23"));
    }

    #[test]
    fn test_lease_no_match() {
        assert_eq!(ip_from_leases(LEASES, "52:54:00:99:99:99", &path()).unwrap(), None);
        assert_eq!(ip_from_leases("", "52:54:00:99:99:99", &path()).unwrap(), None);
    }

    #[test]
    fn test_empty_lines_are_skipped() {
        let contents = "\n\n   \n1700000000 52:54:00:11:22:33 192.168.42.17 a *\n\n";
        let ip = ip_from_leases(contents, "52:54:00:11:22:33", &path()).unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.42.17"));
    }

    #[test]
    fn test_short_line_is_fatal() {
        let contents =
            "1700000000 52:54:00:11:22:33 192.168.42.17 a *\n1700000001 52:54:00:44:55:66\n";
        let err = ip_from_leases(contents, "52:54:00:ff:ff:ff", &path()).unwrap_err();
        assert!(matches!(err, DriverError::MalformedLeaseFile { line: 2, .. }));
    }

    #[test]
    fn test_short_line_after_match_is_not_reached() {
        let contents = "1700000000 52:54:00:11:22:33 192.168.42.17\ngarbage\n";
        let ip = ip_from_leases(contents, "52:54:00:11:22:33", &path()).unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.42.17"));
    }

    #[test]
    fn test_dhcp_leases_first_exact_match() {
        let leases = vec![
            DhcpLease {
                mac: "52:54:00:AA:00:01".into(),
                ip_addr: "192.168.42.9".into(),
                hostname: None,
            },
            DhcpLease {
                mac: "52:54:00:aa:00:01".into(),
                ip_addr: "192.168.42.10".into(),
                hostname: Some("first".into()),
            },
            DhcpLease {
                mac: "52:54:00:aa:00:01".into(),
                ip_addr: "192.168.42.11".into(),
                hostname: Some("second".into()),
            },
        ];
        assert_eq!(
            ip_from_dhcp_leases(&leases, "52:54:00:aa:00:01").as_deref(),
            Some("192.168.42.10")
        );
        assert_eq!(ip_from_dhcp_leases(&leases, "52:54:00:aa:00:02"), None);
    }

    #[tokio::test]
    async fn test_missing_lease_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ip = ip_from_lease_file(&dir.path().join("absent.leases"), "52:54:00:11:22:33")
            .await
            .unwrap();
        assert_eq!(ip, None);
    }

    #[tokio::test]
    async fn test_lease_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("docker-machines.leases");
        std::fs::write(&file, LEASES).unwrap();
        let ip = ip_from_lease_file(&file, "52:54:00:11:22:33").await.unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.42.17"));
    }
}
