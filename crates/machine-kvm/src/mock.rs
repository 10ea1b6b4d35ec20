//! In-memory hypervisor and provisioning collaborators for tests.
//!
//! [`MockHypervisor`] is cheap to clone; every clone and every session,
//! domain and network handle it hands out share one state, so a test can keep
//! a clone around to inspect or steer what the driver sees.

use crate::error::{DriverError, Result};
use crate::hypervisor::{Connector, DhcpLease, DomainHandle, NativeState, NetworkHandle, Session};
use crate::storage::{BootMediaSource, DiskImageBuilder, KeyPairGenerator, Provisioners};
use crate::xml;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Library version reported by [`MockSession::lib_version`] (8.0.0).
pub const MOCK_LIB_VERSION: u64 = 8_000_000;

#[derive(Debug)]
struct DomainRecord {
    xml: String,
    macs: Vec<String>,
    state: NativeState,
    live_xml: Option<String>,
    shutdown_requests: usize,
}

#[derive(Debug)]
struct NetworkRecord {
    xml: String,
    active: bool,
    autostart: bool,
    leases: Vec<DhcpLease>,
}

#[derive(Debug, Default)]
struct MockState {
    connects: usize,
    refuse_connections: Option<String>,
    domains: HashMap<String, DomainRecord>,
    networks: HashMap<String, NetworkRecord>,
    domain_lookups: usize,
    domain_defines: usize,
    network_defines: usize,
    next_mac: u32,
    stall_shutdown: bool,
    fail_define: Option<String>,
    fail_state: Option<String>,
    fail_destroy: Option<String>,
    fail_undefine: Option<String>,
    fail_network_start: Option<String>,
    fail_network_autostart: Option<String>,
}

impl MockState {
    fn domain(&mut self, name: &str) -> Result<&mut DomainRecord> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| DriverError::DomainNotFound(name.to_string()))
    }

    fn network(&mut self, name: &str) -> Result<&mut NetworkRecord> {
        self.networks
            .get_mut(name)
            .ok_or_else(|| DriverError::NetworkNotFound(name.to_string()))
    }

    fn allocate_mac(&mut self) -> String {
        self.next_mac += 1;
        let n = self.next_mac;
        format!("52:54:00:00:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff)
    }
}

type Shared = Arc<Mutex<MockState>>;

fn lock(state: &Shared) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory stand-in for a hypervisor endpoint.
#[derive(Debug, Clone, Default)]
pub struct MockHypervisor {
    state: Shared,
}

impl MockHypervisor {
    /// Create an empty hypervisor with no domains and no networks.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Number of sessions opened so far.
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Make every following connection attempt fail with `message`.
    pub fn refuse_connections(&self, message: &str) {
        self.state().refuse_connections = Some(message.to_string());
    }

    /// Register a network as if an administrator had defined it.
    pub fn add_network(&self, name: &str, xml: &str, active: bool) {
        self.state().networks.insert(
            name.to_string(),
            NetworkRecord {
                xml: xml.to_string(),
                active,
                autostart: false,
                leases: Vec::new(),
            },
        );
    }

    /// Whether network `name` is running; `None` if it isn't defined.
    pub fn network_active(&self, name: &str) -> Option<bool> {
        self.state().networks.get(name).map(|n| n.active)
    }

    /// Whether network `name` autostarts; `None` if it isn't defined.
    pub fn network_autostart(&self, name: &str) -> Option<bool> {
        self.state().networks.get(name).map(|n| n.autostart)
    }

    /// Number of networks defined through a session.
    pub fn network_defines(&self) -> usize {
        self.state().network_defines
    }

    /// Replace the DHCP lease table of network `name`.
    pub fn set_network_leases(&self, name: &str, leases: Vec<DhcpLease>) {
        if let Some(network) = self.state().networks.get_mut(name) {
            network.leases = leases;
        }
    }

    /// Make starting any network fail with `message`.
    pub fn fail_network_start(&self, message: &str) {
        self.state().fail_network_start = Some(message.to_string());
    }

    /// Whether a domain named `name` is defined.
    pub fn domain_exists(&self, name: &str) -> bool {
        self.state().domains.contains_key(name)
    }

    /// Native state of domain `name`; `None` if it isn't defined.
    pub fn domain_state(&self, name: &str) -> Option<NativeState> {
        self.state().domains.get(name).map(|d| d.state)
    }

    /// Force domain `name` into `state`.
    pub fn set_domain_state(&self, name: &str, state: NativeState) {
        if let Some(domain) = self.state().domains.get_mut(name) {
            domain.state = state;
        }
    }

    /// Descriptor domain `name` was defined with.
    pub fn domain_xml(&self, name: &str) -> Option<String> {
        self.state().domains.get(name).map(|d| d.xml.clone())
    }

    /// MAC addresses assigned to the interfaces of domain `name`, in order.
    pub fn domain_macs(&self, name: &str) -> Vec<String> {
        self.state()
            .domains
            .get(name)
            .map(|d| d.macs.clone())
            .unwrap_or_default()
    }

    /// Serve `xml` as the live descriptor of domain `name`.
    pub fn set_live_xml(&self, name: &str, xml: &str) {
        if let Some(domain) = self.state().domains.get_mut(name) {
            domain.live_xml = Some(xml.to_string());
        }
    }

    /// Number of domain lookups by name.
    pub fn domain_lookups(&self) -> usize {
        self.state().domain_lookups
    }

    /// Number of domains defined through a session.
    pub fn domain_defines(&self) -> usize {
        self.state().domain_defines
    }

    /// Number of graceful shutdown requests domain `name` received.
    pub fn shutdown_requests(&self, name: &str) -> usize {
        self.state()
            .domains
            .get(name)
            .map(|d| d.shutdown_requests)
            .unwrap_or_default()
    }

    /// Ignore graceful shutdown requests, like a guest without ACPI support.
    pub fn stall_shutdown(&self) {
        self.state().stall_shutdown = true;
    }

    /// Make defining a domain fail with `message`.
    pub fn fail_define(&self, message: &str) {
        self.state().fail_define = Some(message.to_string());
    }

    /// Make domain state queries fail with `message`.
    pub fn fail_state_query(&self, message: &str) {
        self.state().fail_state = Some(message.to_string());
    }

    /// Make forced power-off fail with `message`.
    pub fn fail_destroy(&self, message: &str) {
        self.state().fail_destroy = Some(message.to_string());
    }

    /// Make removing a domain record fail with `message`.
    pub fn fail_undefine(&self, message: &str) {
        self.state().fail_undefine = Some(message.to_string());
    }

    /// Make enabling network autostart fail with `message`.
    pub fn fail_network_autostart(&self, message: &str) {
        self.state().fail_network_autostart = Some(message.to_string());
    }

    /// Drop every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.refuse_connections = None;
        state.stall_shutdown = false;
        state.fail_define = None;
        state.fail_state = None;
        state.fail_destroy = None;
        state.fail_undefine = None;
        state.fail_network_start = None;
        state.fail_network_autostart = None;
    }
}

#[async_trait]
impl Connector for MockHypervisor {
    type Session = MockSession;

    async fn connect(&self, uri: &str) -> Result<MockSession> {
        let mut state = self.state();
        if let Some(message) = &state.refuse_connections {
            return Err(DriverError::Connection {
                uri: uri.to_string(),
                message: message.clone(),
            });
        }
        state.connects += 1;
        Ok(MockSession {
            state: Arc::clone(&self.state),
        })
    }
}

/// Session handed out by [`MockHypervisor`].
#[derive(Debug, Clone)]
pub struct MockSession {
    state: Shared,
}

#[async_trait]
impl Session for MockSession {
    type Domain = MockDomain;
    type Network = MockNetwork;

    async fn lib_version(&self) -> Result<u64> {
        Ok(MOCK_LIB_VERSION)
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<MockDomain>> {
        let mut state = lock(&self.state);
        state.domain_lookups += 1;
        Ok(state.domains.contains_key(name).then(|| MockDomain {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn define_domain(&self, xml: &str) -> Result<MockDomain> {
        let name = descriptor_name(xml)?;
        let interfaces = crate::descriptor::parse_interfaces(xml)?.len();

        let mut state = lock(&self.state);
        if let Some(message) = &state.fail_define {
            return Err(DriverError::hypervisor("define domain", message));
        }
        state.domain_defines += 1;
        // Redefining keeps the hardware identity and power state.
        let existing = state.domains.get(&name).map(|d| (d.macs.clone(), d.state));
        let (macs, power) = match existing {
            Some(existing) => existing,
            None => (
                (0..interfaces).map(|_| state.allocate_mac()).collect(),
                NativeState::Shutoff,
            ),
        };
        state.domains.insert(
            name.clone(),
            DomainRecord {
                xml: xml.to_string(),
                macs,
                state: power,
                live_xml: None,
                shutdown_requests: 0,
            },
        );
        Ok(MockDomain {
            name,
            state: Arc::clone(&self.state),
        })
    }

    async fn lookup_network(&self, name: &str) -> Result<Option<MockNetwork>> {
        let state = lock(&self.state);
        Ok(state.networks.contains_key(name).then(|| MockNetwork {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn define_network(&self, xml: &str) -> Result<MockNetwork> {
        let name = descriptor_name(xml)?;
        let mut state = lock(&self.state);
        state.network_defines += 1;
        state.networks.insert(
            name.clone(),
            NetworkRecord {
                xml: xml.to_string(),
                active: false,
                autostart: false,
                leases: Vec::new(),
            },
        );
        Ok(MockNetwork {
            name,
            state: Arc::clone(&self.state),
        })
    }
}

fn descriptor_name(doc: &str) -> Result<String> {
    let root = xml::parse(doc)?;
    root.child("name")
        .map(|n| n.text().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| DriverError::Descriptor(format!("<{}> has no name", root.name)))
}

/// Insert a `<mac>` element as first child of every `<interface>`.
fn with_macs(doc: &str, macs: &[String]) -> String {
    let mut out = String::with_capacity(doc.len() + macs.len() * 40);
    let mut rest = doc;
    let mut macs = macs.iter();
    while let Some(start) = rest.find("<interface") {
        let Some(end) = rest[start..].find('>').map(|i| start + i + 1) else {
            break;
        };
        let tag = &rest[start..end];
        out.push_str(&rest[..start]);
        match (macs.next(), tag.strip_suffix("/>")) {
            (Some(mac), Some(open)) => {
                out.push_str(&format!("{open}><mac address='{mac}'/></interface>"));
            }
            (Some(mac), None) => out.push_str(&format!("{tag}<mac address='{mac}'/>")),
            (None, _) => out.push_str(tag),
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

/// Domain handle handed out by [`MockSession`].
#[derive(Debug, Clone)]
pub struct MockDomain {
    name: String,
    state: Shared,
}

#[async_trait]
impl DomainHandle for MockDomain {
    async fn create(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let domain = state.domain(&self.name)?;
        if domain.state == NativeState::Running {
            return Err(DriverError::hypervisor("create domain", "domain is already running"));
        }
        domain.state = NativeState::Running;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let stall = state.stall_shutdown;
        let domain = state.domain(&self.name)?;
        if domain.state != NativeState::Running {
            return Err(DriverError::hypervisor("shutdown domain", "domain is not running"));
        }
        domain.shutdown_requests += 1;
        if !stall {
            domain.state = NativeState::Shutoff;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_destroy.clone() {
            return Err(DriverError::hypervisor("destroy domain", message));
        }
        let domain = state.domain(&self.name)?;
        if domain.state == NativeState::Shutoff {
            return Err(DriverError::hypervisor("destroy domain", "domain is not running"));
        }
        domain.state = NativeState::Shutoff;
        Ok(())
    }

    async fn undefine(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_undefine.clone() {
            return Err(DriverError::hypervisor("undefine domain", message));
        }
        state
            .domains
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| DriverError::DomainNotFound(self.name.clone()))
    }

    async fn state(&self) -> Result<NativeState> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_state.clone() {
            return Err(DriverError::hypervisor("get domain state", message));
        }
        Ok(state.domain(&self.name)?.state)
    }

    async fn xml_desc(&self) -> Result<String> {
        let mut state = lock(&self.state);
        let domain = state.domain(&self.name)?;
        Ok(match &domain.live_xml {
            Some(live) => live.clone(),
            None => with_macs(&domain.xml, &domain.macs),
        })
    }
}

/// Network handle handed out by [`MockSession`].
#[derive(Debug, Clone)]
pub struct MockNetwork {
    name: String,
    state: Shared,
}

#[async_trait]
impl NetworkHandle for MockNetwork {
    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn xml_desc(&self) -> Result<String> {
        Ok(lock(&self.state).network(&self.name)?.xml.clone())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(lock(&self.state).network(&self.name)?.active)
    }

    async fn create(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_network_start.clone() {
            return Err(DriverError::hypervisor("start network", message));
        }
        let network = state.network(&self.name)?;
        if network.active {
            return Err(DriverError::hypervisor("start network", "network is already active"));
        }
        network.active = true;
        Ok(())
    }

    async fn set_autostart(&self, autostart: bool) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_network_autostart.clone() {
            return Err(DriverError::hypervisor("set network autostart", message));
        }
        state.network(&self.name)?.autostart = autostart;
        Ok(())
    }

    async fn dhcp_leases(&self) -> Result<Vec<DhcpLease>> {
        Ok(lock(&self.state).network(&self.name)?.leases.clone())
    }
}

#[derive(Debug, Default)]
struct ProvisionState {
    boot_media_fetches: usize,
    key_generations: usize,
    disk_builds: usize,
    fail_boot_media: Option<String>,
    fail_key_generation: Option<String>,
    fail_disk_build: Option<String>,
}

/// Collaborators that write small placeholder files instead of real images.
#[derive(Debug, Clone, Default)]
pub struct MockProvisioners {
    state: Arc<Mutex<ProvisionState>>,
}

impl MockProvisioners {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProvisionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bundle these doubles for a machine.
    pub fn provisioners(&self) -> Provisioners {
        Provisioners {
            boot_media: Arc::new(self.clone()),
            keys: Arc::new(self.clone()),
            disk: Arc::new(self.clone()),
        }
    }

    pub fn boot_media_fetches(&self) -> usize {
        self.state().boot_media_fetches
    }

    pub fn key_generations(&self) -> usize {
        self.state().key_generations
    }

    pub fn disk_builds(&self) -> usize {
        self.state().disk_builds
    }

    pub fn fail_boot_media(&self, message: &str) {
        self.state().fail_boot_media = Some(message.to_string());
    }

    pub fn fail_key_generation(&self, message: &str) {
        self.state().fail_key_generation = Some(message.to_string());
    }

    pub fn fail_disk_build(&self, message: &str) {
        self.state().fail_disk_build = Some(message.to_string());
    }
}

#[async_trait]
impl BootMediaSource for MockProvisioners {
    async fn fetch(&self, source: Option<&str>, dest: &Path) -> Result<()> {
        {
            let mut state = self.state();
            if let Some(message) = &state.fail_boot_media {
                return Err(DriverError::provision("boot media preparation", message));
            }
            state.boot_media_fetches += 1;
        }
        let label = source.unwrap_or("default");
        tokio::fs::write(dest, format!("boot image from {label}\n")).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyPairGenerator for MockProvisioners {
    async fn generate(&self, private_key: &Path) -> Result<()> {
        {
            let mut state = self.state();
            if let Some(message) = &state.fail_key_generation {
                return Err(DriverError::provision("ssh key generation", message));
            }
            state.key_generations += 1;
        }
        let mut public_key = private_key.as_os_str().to_owned();
        public_key.push(".pub");
        tokio::fs::write(private_key, "mock private key\n").await?;
        tokio::fs::write(public_key, "ssh-rsa AAAAmock machine-kvm\n").await?;
        Ok(())
    }
}

#[async_trait]
impl DiskImageBuilder for MockProvisioners {
    async fn build(&self, public_key: &Path, dest: &Path, _size_mb: u64) -> Result<()> {
        {
            let mut state = self.state();
            if let Some(message) = &state.fail_disk_build {
                return Err(DriverError::provision("disk image construction", message));
            }
            state.disk_builds += 1;
        }
        let key = tokio::fs::read(public_key).await?;
        tokio::fs::write(dest, key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_macs_injects_in_order() {
        let doc = "<domain><devices><interface type='network'><source network='a'/></interface>\
                   <interface type='network'><source network='b'/></interface></devices></domain>";
        let macs = vec!["52:54:00:00:00:01".to_string(), "52:54:00:00:00:02".to_string()];
        let live = with_macs(doc, &macs);
        let interfaces = crate::descriptor::parse_interfaces(&live).unwrap();
        assert_eq!(interfaces[0].mac.as_deref(), Some("52:54:00:00:00:01"));
        assert_eq!(interfaces[1].mac.as_deref(), Some("52:54:00:00:00:02"));
        assert_eq!(interfaces[1].network.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_domain_power_transitions() {
        let hv = MockHypervisor::new();
        let session = hv.connect("test:///default").await.unwrap();
        let domain = session
            .define_domain("<domain><name>vm</name><devices/></domain>")
            .await
            .unwrap();

        assert_eq!(domain.state().await.unwrap(), NativeState::Shutoff);
        assert!(domain.destroy().await.is_err());
        domain.create().await.unwrap();
        assert!(domain.create().await.is_err());
        domain.shutdown().await.unwrap();
        assert_eq!(hv.domain_state("vm"), Some(NativeState::Shutoff));
        domain.undefine().await.unwrap();
        assert!(!hv.domain_exists("vm"));
        assert!(matches!(domain.state().await, Err(DriverError::DomainNotFound(_))));
    }

    #[tokio::test]
    async fn test_redefine_keeps_macs() {
        let hv = MockHypervisor::new();
        let session = hv.connect("test:///default").await.unwrap();
        let doc = "<domain><name>vm</name><devices><interface type='network'/>\
                   <interface type='network'/></devices></domain>";
        session.define_domain(doc).await.unwrap();
        let first = hv.domain_macs("vm");
        session.define_domain(doc).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_ne!(first[0], first[1]);
        assert_eq!(hv.domain_macs("vm"), first);
        assert_eq!(hv.domain_defines(), 2);
    }
}
