//! Virtual network provisioning.
//!
//! The private network is an isolated, DHCP-enabled network shared by every
//! machine on the host. It is created on first use and reused afterwards.
//! The public network is never created here, only checked for.

use crate::error::{DriverError, Result};
use crate::hypervisor::{NetworkHandle, Session};
use crate::xml::{self, XmlWriter};
use std::net::Ipv4Addr;

/// Addressing of an IPv4 network with a DHCP range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkLayout {
    /// Host-side gateway address
    pub gateway: Ipv4Addr,
    /// Network mask
    pub netmask: Ipv4Addr,
    /// First address handed out by DHCP
    pub dhcp_start: Ipv4Addr,
    /// Last address handed out by DHCP
    pub dhcp_end: Ipv4Addr,
}

impl NetworkLayout {
    /// Layout used when the private network has to be created.
    pub const PRIVATE: NetworkLayout = NetworkLayout {
        gateway: Ipv4Addr::new(192, 168, 42, 1),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        dhcp_start: Ipv4Addr::new(192, 168, 42, 2),
        dhcp_end: Ipv4Addr::new(192, 168, 42, 254),
    };

    /// Render an isolated network descriptor (no `<forward>`) named `name`.
    pub fn render(&self, name: &str) -> String {
        let gateway = self.gateway.to_string();
        let netmask = self.netmask.to_string();
        let start = self.dhcp_start.to_string();
        let end = self.dhcp_end.to_string();

        let mut w = XmlWriter::new();
        w.open("network", &[]);
        w.text("name", &[], name);
        w.open("ip", &[("address", gateway.as_str()), ("netmask", netmask.as_str())]);
        w.open("dhcp", &[]);
        w.empty("range", &[("start", start.as_str()), ("end", end.as_str())]);
        w.close();
        w.close();
        w.finish()
    }

    /// Find the first IPv4 `<ip>` block with a DHCP range in a network descriptor.
    ///
    /// Returns `None` if the network has no DHCP range.
    ///
    /// # Errors
    /// Returns [`DriverError::Descriptor`] if the document can't be parsed or
    /// holds an address that isn't IPv4.
    pub fn parse(xml: &str) -> Result<Option<Self>> {
        let root = xml::parse(xml)?;
        for ip in root.children_named("ip") {
            if ip.attr("family").is_some_and(|f| f != "ipv4") {
                continue;
            }
            let Some(range) = ip.child("dhcp").and_then(|d| d.child("range")) else {
                continue;
            };
            let (Some(gateway), Some(start), Some(end)) =
                (ip.attr("address"), range.attr("start"), range.attr("end"))
            else {
                continue;
            };
            let netmask = match (ip.attr("netmask"), ip.attr("prefix")) {
                (Some(mask), _) => parse_addr(mask)?,
                (None, Some(prefix)) => prefix_to_netmask(prefix)?,
                (None, None) => continue,
            };
            return Ok(Some(Self {
                gateway: parse_addr(gateway)?,
                netmask,
                dhcp_start: parse_addr(start)?,
                dhcp_end: parse_addr(end)?,
            }));
        }
        Ok(None)
    }
}

fn parse_addr(raw: &str) -> Result<Ipv4Addr> {
    raw.parse()
        .map_err(|_| DriverError::Descriptor(format!("invalid IPv4 address '{raw}'")))
}

fn prefix_to_netmask(raw: &str) -> Result<Ipv4Addr> {
    let prefix: u32 = raw
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| DriverError::Descriptor(format!("invalid network prefix '{raw}'")))?;
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok(Ipv4Addr::from(mask))
}

/// Make sure the private network `name` exists, has DHCP and is running.
///
/// Safe to call on every create: an existing network is reused as is.
///
/// # Errors
/// Returns [`DriverError::MisconfiguredNetwork`] if an existing network has
/// no DHCP range, or the hypervisor error if defining or starting a new
/// network fails.
pub async fn ensure_private_network<S: Session>(session: &S, name: &str) -> Result<NetworkLayout> {
    tracing::debug!(network = %name, "Validating private network");

    if let Some(network) = session.lookup_network(name).await? {
        let desc = network.xml_desc().await?;
        let layout = NetworkLayout::parse(&desc)?.ok_or_else(|| {
            tracing::error!(network = %name, "Private network has no DHCP range");
            DriverError::MisconfiguredNetwork(name.to_string())
        })?;

        // Corner case, but might happen after a host reboot without autostart.
        if !network.is_active().await? {
            tracing::debug!(network = %name, "Reactivating private network");
            if let Err(e) = network.create().await {
                tracing::warn!(network = %name, error = %e, "Failed to start private network");
            }
        }
        return Ok(layout);
    }

    tracing::info!(network = %name, "Creating private network");
    let layout = NetworkLayout::PRIVATE;
    let network = session.define_network(&layout.render(name)).await.map_err(|e| {
        tracing::error!(network = %name, error = %e, "Failed to define private network");
        e
    })?;
    if let Err(e) = network.set_autostart(true).await {
        tracing::warn!(network = %name, error = %e, "Failed to set private network to autostart");
    }
    network.create().await?;
    tracing::info!(
        network = %name,
        gateway = %layout.gateway,
        dhcp_start = %layout.dhcp_start,
        dhcp_end = %layout.dhcp_end,
        "Private network created"
    );
    Ok(layout)
}

/// Make sure the public network `name` exists. It is never created here.
///
/// # Errors
/// Returns [`DriverError::NetworkNotFound`] if it doesn't.
pub async fn ensure_public_network<S: Session>(session: &S, name: &str) -> Result<()> {
    tracing::debug!(network = %name, "Validating network");
    match session.lookup_network(name).await? {
        Some(_) => Ok(()),
        None => {
            tracing::error!(network = %name, "Unable to locate network");
            Err(DriverError::NetworkNotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::Connector;
    use crate::mock::MockHypervisor;

    #[test]
    fn test_render_then_parse_reports_dhcp_range() {
        let doc = NetworkLayout::PRIVATE.render("docker-machines");
        let layout = NetworkLayout::parse(&doc).unwrap().unwrap();
        assert_eq!(layout, NetworkLayout::PRIVATE);
        assert_eq!(layout.dhcp_start.to_string(), "192.168.42.2");
        assert!(doc.contains("<name>docker-machines</name>"));
        assert!(!doc.contains("forward"));
    }

    #[test]
    fn test_parse_hypervisor_output_with_prefix() {
        let desc = r#"<network connections='1'>
  <name>default</name>
  <uuid>2f2c1c9e-7f36-4d0c-9a0b-2a5d1e7a8b9c</uuid>
  <forward mode='nat'/>
  <bridge name='virbr0' stp='on' delay='0'/>
  <mac address='52:54:00:0a:0b:0c'/>
  <ip family='ipv6' address='fd00::1' prefix='64'>
    <dhcp><range start='fd00::10' end='fd00::ff'/></dhcp>
  </ip>
  <ip address='10.0.0.1' prefix='16'>
    <dhcp>
      <range start='10.0.0.2' end='10.0.255.254'/>
    </dhcp>
  </ip>
</network>"#;
        let layout = NetworkLayout::parse(desc).unwrap().unwrap();
        assert_eq!(layout.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(layout.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(layout.dhcp_end, Ipv4Addr::new(10, 0, 255, 254));
    }

    #[test]
    fn test_parse_without_dhcp() {
        let desc =
            "<network><name>n</name><ip address='10.1.0.1' netmask='255.255.255.0'/></network>";
        assert_eq!(NetworkLayout::parse(desc).unwrap(), None);
    }

    #[tokio::test]
    async fn test_ensure_private_network_is_idempotent() {
        let hv = MockHypervisor::new();
        let session = hv.connect("test:///default").await.unwrap();

        ensure_private_network(&session, "docker-machines").await.unwrap();
        assert_eq!(hv.network_active("docker-machines"), Some(true));
        ensure_private_network(&session, "docker-machines").await.unwrap();

        assert_eq!(hv.network_defines(), 1);
        assert_eq!(hv.network_active("docker-machines"), Some(true));
        assert_eq!(hv.network_autostart("docker-machines"), Some(true));
    }

    #[tokio::test]
    async fn test_new_private_network_start_failure_propagates() {
        let hv = MockHypervisor::new();
        hv.fail_network_start("address already in use");
        let session = hv.connect("test:///default").await.unwrap();

        let err = ensure_private_network(&session, "docker-machines")
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Hypervisor { .. }));
        assert!(err.to_string().contains("address already in use"));
        assert_eq!(hv.network_defines(), 1);
        assert_eq!(hv.network_active("docker-machines"), Some(false));
    }

    #[tokio::test]
    async fn test_new_private_network_survives_autostart_failure() {
        let hv = MockHypervisor::new();
        hv.fail_network_autostart("permission denied");
        let session = hv.connect("test:///default").await.unwrap();

        let layout = ensure_private_network(&session, "docker-machines").await.unwrap();

        assert_eq!(layout, NetworkLayout::PRIVATE);
        assert_eq!(hv.network_active("docker-machines"), Some(true));
        assert_eq!(hv.network_autostart("docker-machines"), Some(false));
    }

    #[tokio::test]
    async fn test_ensure_private_network_reactivates_inactive() {
        let hv = MockHypervisor::new();
        hv.add_network("docker-machines", &NetworkLayout::PRIVATE.render("docker-machines"), false);
        let session = hv.connect("test:///default").await.unwrap();

        ensure_private_network(&session, "docker-machines").await.unwrap();
        assert_eq!(hv.network_active("docker-machines"), Some(true));
        assert_eq!(hv.network_defines(), 0);
    }

    #[tokio::test]
    async fn test_ensure_private_network_survives_failed_reactivation() {
        let hv = MockHypervisor::new();
        hv.add_network("docker-machines", &NetworkLayout::PRIVATE.render("docker-machines"), false);
        hv.fail_network_start("address already in use");
        let session = hv.connect("test:///default").await.unwrap();

        let layout = ensure_private_network(&session, "docker-machines").await.unwrap();
        assert_eq!(layout, NetworkLayout::PRIVATE);
        assert_eq!(hv.network_active("docker-machines"), Some(false));
    }

    #[tokio::test]
    async fn test_ensure_private_network_rejects_missing_dhcp() {
        let hv = MockHypervisor::new();
        hv.add_network(
            "docker-machines",
            "<network><name>docker-machines</name><ip address='10.1.0.1' netmask='255.255.255.0'/></network>",
            true,
        );
        let session = hv.connect("test:///default").await.unwrap();

        let err = ensure_private_network(&session, "docker-machines").await.unwrap_err();
        assert!(
            matches!(err, DriverError::MisconfiguredNetwork(name) if name == "docker-machines")
        );
    }

    #[tokio::test]
    async fn test_ensure_public_network() {
        let hv = MockHypervisor::new();
        let session = hv.connect("test:///default").await.unwrap();

        let err = ensure_public_network(&session, "public").await.unwrap_err();
        assert!(matches!(err, DriverError::NetworkNotFound(_)));
        assert_eq!(hv.network_defines(), 0);

        hv.add_network("public", "<network><name>public</name></network>", true);
        ensure_public_network(&session, "public").await.unwrap();
    }
}
