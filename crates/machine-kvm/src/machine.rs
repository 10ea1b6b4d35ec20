//! Machine type: lifecycle controller for the one VM a driver instance owns.

use crate::config::MachineSpec;
use crate::connection::Connection;
use crate::descriptor;
use crate::discovery;
use crate::error::{DriverError, Result};
use crate::hypervisor::{Connector, DomainHandle, DomainState, NativeState, Session};
use crate::network;
use crate::poll::{poll_until, PollPolicy};
use crate::storage::{self, Provisioners};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Name under which the orchestrator registers this driver.
pub const DRIVER_NAME: &str = "kvm";

/// Port of the container engine API inside the guest.
pub const ENGINE_PORT: u16 = 2376;

/// Pause after the first IP shows up, so guest services can come up.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

type DomainOf<C> = <<C as Connector>::Session as Session>::Domain;

/// Lifecycle capabilities the orchestrator drives.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short backend name.
    fn driver_name(&self) -> &'static str;

    /// Name of the managed machine.
    fn machine_name(&self) -> &str;

    /// Validate the host before `create`.
    async fn pre_create_check(&self) -> Result<()>;

    /// Build storage, define the VM and start it.
    async fn create(&mut self) -> Result<()>;

    /// Power on and wait for the guest to obtain an IP.
    async fn start(&self) -> Result<()>;

    /// Gracefully shut down.
    async fn stop(&self) -> Result<()>;

    /// Stop, then start.
    async fn restart(&self) -> Result<()>;

    /// Forcibly power off.
    async fn kill(&self) -> Result<()>;

    /// Delete storage and the hypervisor record.
    async fn remove(&self) -> Result<()>;

    /// Current state, read from the hypervisor.
    async fn state(&self) -> Result<DomainState>;

    /// Guest IP on the private network, `None` while unknown.
    async fn ip(&self) -> Result<Option<String>>;

    /// Container engine endpoint, `None` while the IP is unknown.
    async fn url(&self) -> Result<Option<String>>;
}

/// A single VM managed through the hypervisor.
///
/// One instance owns one hypervisor session and is meant to be driven by a
/// single caller; operations run one after another.
///
/// The domain handle is cached after definition or the first successful
/// lookup by name. Every operation except [`create`](Self::create) goes
/// through that cache, so an instance reconstructed from a persisted
/// [`MachineSpec`] finds its domain again.
pub struct Machine<C: Connector> {
    /// Configuration this machine was created from
    spec: MachineSpec,
    /// Lazily opened hypervisor session
    connection: Connection<C>,
    /// Boot media, key and disk image collaborators
    provisioners: Provisioners,
    /// Cached domain handle, `None` until loaded
    domain: Mutex<Option<DomainOf<C>>>,
    /// Last IP address resolved for the guest
    last_ip: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Connector> Machine<C> {
    /// Create a controller for the machine described by `spec`.
    ///
    /// Nothing is contacted yet; the hypervisor session opens on first use.
    ///
    /// # Errors
    /// Returns an error if `spec` doesn't validate.
    pub fn new(spec: MachineSpec, connector: C, provisioners: Provisioners) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            connection: Connection::new(spec.connection_uri.clone(), connector),
            spec,
            provisioners,
            domain: Mutex::new(None),
            last_ip: Mutex::new(None),
        })
    }

    /// Get the configuration of this machine.
    ///
    /// After a `create` with a host path, the image paths point at the
    /// relocated files.
    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn machine_name(&self) -> &str {
        &self.spec.machine_name
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.spec.ssh_key_path()
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.spec.public_key_path()
    }

    pub fn ssh_username(&self) -> &str {
        &self.spec.ssh_user
    }

    pub fn ssh_port(&self) -> u16 {
        self.spec.ssh_port
    }

    /// Address to SSH into; the guest IP.
    pub async fn ssh_hostname(&self) -> Result<Option<String>> {
        self.ip().await
    }

    /// Last IP returned by [`ip`](Self::ip), without asking anyone.
    pub fn last_known_ip(&self) -> Option<String> {
        lock(&self.last_ip).clone()
    }

    /// Whether a domain handle is cached.
    pub fn is_loaded(&self) -> bool {
        lock(&self.domain).is_some()
    }

    fn cached_domain(&self) -> Option<DomainOf<C>> {
        lock(&self.domain).clone()
    }

    fn forget_domain(&self) {
        lock(&self.domain).take();
    }

    /// Return the domain handle, looking it up by name if it isn't cached.
    ///
    /// This is the only place a handle is fetched after `create`; each call
    /// does at most one lookup.
    ///
    /// # Errors
    /// Returns [`DriverError::DomainNotFound`] if the hypervisor doesn't know
    /// the machine, or the session/lookup error.
    pub async fn ensure_domain(&self) -> Result<DomainOf<C>> {
        if let Some(domain) = self.cached_domain() {
            return Ok(domain);
        }

        let name = &self.spec.machine_name;
        tracing::debug!(machine = %name, "Fetching VM");
        let session = self.connection.session().await?;
        match session.lookup_domain(name).await {
            Ok(Some(domain)) => {
                *lock(&self.domain) = Some(domain.clone());
                Ok(domain)
            }
            Ok(None) => {
                tracing::warn!(machine = %name, "Failed to fetch machine");
                Err(DriverError::DomainNotFound(name.clone()))
            }
            Err(e) => {
                tracing::warn!(machine = %name, error = %e, "Failed to fetch machine");
                Err(e)
            }
        }
    }

    /// Check the hypervisor is usable before `create`.
    ///
    /// Opens the session, reads the library version, makes sure the private
    /// network is ready and that the public network exists.
    ///
    /// # Errors
    /// Returns the first failing check's error.
    pub async fn pre_create_check(&self) -> Result<()> {
        let session = self.connection.session().await?;

        tracing::debug!("About to check hypervisor library version");
        let version = session.lib_version().await.map_err(|e| {
            tracing::warn!(error = %e, "Unable to get hypervisor library version");
            e
        })?;
        tracing::debug!(version, "Hypervisor library version");

        network::ensure_private_network(session, &self.spec.private_network).await?;
        network::ensure_public_network(session, &self.spec.network).await
    }

    /// Create the machine and start it.
    ///
    /// This will:
    /// 1. Make sure the private network exists and is active
    /// 2. Prepare boot media, SSH key and disk image
    /// 3. Relocate the images to the host path, if one is configured
    /// 4. Define the domain from the rendered descriptor
    /// 5. [`start`](Self::start) it
    ///
    /// # Errors
    /// Returns [`DriverError::InvalidState`] if a domain with this name is
    /// already defined, [`DriverError::StorageConflict`] if existing storage
    /// is in the way, or the error of the failing step.
    pub async fn create(&mut self) -> Result<()> {
        let name = self.spec.machine_name.clone();
        let session = self.connection.session().await?;

        if self.cached_domain().is_some() || session.lookup_domain(&name).await?.is_some() {
            return Err(DriverError::InvalidState {
                expected: "undefined".into(),
                actual: "defined".into(),
            });
        }

        tracing::info!(machine = %name, "Creating VM");
        network::ensure_private_network(session, &self.spec.private_network).await?;

        storage::prepare(&self.spec, &self.provisioners).await?;
        let store_spec = self.spec.clone();
        let relocated = storage::relocate(&self.spec).await?;
        if let Some(moved) = &relocated {
            self.spec.boot_image_path = moved.boot_image_path.clone();
            self.spec.disk_path = moved.disk_path.clone();
        }

        tracing::debug!(machine = %name, "Defining VM");
        let xml = descriptor::render_domain(&self.spec);
        let session = self.connection.session().await?;
        let domain = match session.define_domain(&xml).await {
            Ok(domain) => domain,
            Err(e) => {
                tracing::warn!(machine = %name, error = %e, "Failed to create the VM");
                // Put the images back so a later create can reuse them
                if let Some(moved) = &relocated {
                    if let Err(restore_err) = storage::restore(&store_spec, moved).await {
                        tracing::warn!(
                            machine = %name,
                            error = %restore_err,
                            "Failed to restore images"
                        );
                    }
                    self.spec = store_spec;
                }
                return Err(e);
            }
        };
        *lock(&self.domain) = Some(domain);
        tracing::info!(machine = %name, "VM defined");

        self.start().await
    }

    /// Power the machine on and wait for it to report an IP address.
    ///
    /// Waits the configured boot grace period, then checks for an IP once a
    /// second for up to [`PollPolicy::BOOT`] attempts. Not finding an IP is
    /// logged and otherwise ignored: the guest may still be reachable
    /// through its console.
    ///
    /// # Errors
    /// Returns [`DriverError::InvalidState`] if the machine is running or
    /// paused, or the error of the power-on call.
    pub async fn start(&self) -> Result<()> {
        let name = &self.spec.machine_name;
        tracing::debug!(machine = %name, "Starting VM");
        let domain = self.ensure_domain().await?;

        let current = DomainState::from(domain.state().await?);
        if matches!(current, DomainState::Running | DomainState::Paused) {
            return Err(DriverError::InvalidState {
                expected: "defined or stopped".into(),
                actual: current.to_string(),
            });
        }

        domain.create().await.map_err(|e| {
            tracing::warn!(machine = %name, error = %e, "Failed to start");
            e
        })?;

        let started = Instant::now();
        tokio::time::sleep(self.spec.boot_wait()).await;

        let ip = poll_until(PollPolicy::BOOT, |attempt| async move {
            match self.ip().await {
                Ok(Some(ip)) => Some(ip),
                Ok(None) => {
                    tracing::debug!(machine = %name, attempt, "Waiting for the VM to come up");
                    None
                }
                Err(e) => {
                    // These won't clear up by waiting
                    if matches!(
                        e,
                        DriverError::Topology { .. } | DriverError::MalformedLeaseFile { .. }
                    ) {
                        tracing::warn!(machine = %name, attempt, error = %e, "IP lookup failed");
                    } else {
                        tracing::debug!(machine = %name, attempt, error = %e, "IP lookup failed");
                    }
                    None
                }
            }
        })
        .await;

        match ip {
            Some(ip) => {
                tokio::time::sleep(SETTLE_DELAY).await;
                tracing::info!(
                    machine = %name,
                    ip = %ip,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "VM started"
                );
            }
            None => {
                tracing::warn!(
                    machine = %name,
                    "Unable to determine VM's IP address, did it fail to boot?"
                );
            }
        }
        Ok(())
    }

    /// Gracefully shut the machine down.
    ///
    /// A stopped machine is left alone. Otherwise an ACPI shutdown is
    /// requested and the state is checked once a second for up to
    /// [`PollPolicy::SHUTDOWN`] attempts.
    ///
    /// # Errors
    /// Returns [`DriverError::ShutdownTimeout`] if the guest doesn't power
    /// off in time; [`kill`](Self::kill) is the remedy.
    pub async fn stop(&self) -> Result<()> {
        let name = &self.spec.machine_name;
        tracing::debug!(machine = %name, "Stopping VM");
        let domain = self.ensure_domain().await?;

        if self.state().await? == DomainState::Stopped {
            tracing::debug!(machine = %name, "VM already stopped");
            return Ok(());
        }

        domain.shutdown().await.map_err(|e| {
            tracing::warn!(machine = %name, error = %e, "Failed to gracefully shutdown VM");
            e
        })?;

        let policy = PollPolicy::SHUTDOWN;
        let stopped = poll_until(policy, |attempt| async move {
            match self.state().await {
                Ok(DomainState::Stopped) => Some(()),
                Ok(state) => {
                    tracing::debug!(
                        machine = %name,
                        attempt,
                        state = %state,
                        "Waiting for shutdown"
                    );
                    None
                }
                Err(e) => {
                    tracing::debug!(machine = %name, attempt, error = %e, "State query failed");
                    None
                }
            }
        })
        .await;

        if stopped.is_none() {
            tracing::error!(machine = %name, "VM failed to gracefully shutdown");
            return Err(DriverError::ShutdownTimeout {
                name: name.clone(),
                waited: policy.budget(),
            });
        }
        tracing::info!(machine = %name, "VM stopped");
        Ok(())
    }

    /// Stop the machine, then start it again.
    ///
    /// # Errors
    /// Fails without starting if the stop fails.
    pub async fn restart(&self) -> Result<()> {
        tracing::debug!(machine = %self.spec.machine_name, "Restarting VM");
        self.stop().await?;
        self.start().await
    }

    /// Force the machine off immediately, without waiting.
    ///
    /// Killing a powered-off machine does nothing. A guest that is still
    /// shutting down is active and gets powered off.
    pub async fn kill(&self) -> Result<()> {
        let name = &self.spec.machine_name;
        tracing::warn!(machine = %name, "Force killing VM");
        let domain = self.ensure_domain().await?;

        if domain.state().await? == NativeState::Shutoff {
            tracing::debug!(machine = %name, "VM already powered off");
            return Ok(());
        }
        domain.destroy().await
    }

    /// Delete the machine's persistent storage and its hypervisor record.
    ///
    /// A missing persistent directory is fine, and power-off errors are
    /// ignored since the machine may already be off.
    ///
    /// # Errors
    /// Returns [`DriverError::Undefine`] if the record can't be removed,
    /// for example because the disk has snapshots.
    pub async fn remove(&self) -> Result<()> {
        let name = &self.spec.machine_name;
        tracing::debug!(machine = %name, "Removing VM");
        let domain = self.ensure_domain().await?;

        storage::remove_persistent(&self.spec).await?;

        if let Err(e) = domain.destroy().await {
            tracing::debug!(machine = %name, error = %e, "Ignoring power-off failure");
        }
        domain.undefine().await.map_err(|e| {
            tracing::error!(machine = %name, error = %e, "Failed to undefine VM");
            DriverError::Undefine {
                name: name.clone(),
                message: e.to_string(),
            }
        })?;

        self.forget_domain();
        lock(&self.last_ip).take();
        tracing::info!(machine = %name, "VM removed");
        Ok(())
    }

    /// Read the machine's state from the hypervisor.
    ///
    /// An error stands for the `None` state: nothing is cached, and a
    /// missing handle costs exactly one lookup.
    pub async fn state(&self) -> Result<DomainState> {
        tracing::trace!(machine = %self.spec.machine_name, "Getting current state");
        let domain = self.ensure_domain().await?;
        let native = domain.state().await?;
        Ok(DomainState::from(native))
    }

    /// Resolve the guest's IP on the private network.
    ///
    /// `Ok(None)` means no lease is known yet, which is normal right after
    /// power-on.
    ///
    /// # Errors
    /// Returns an error if the domain can't be found, its descriptor lacks the
    /// private interface, or the lease file is malformed.
    pub async fn ip(&self) -> Result<Option<String>> {
        let domain = self.ensure_domain().await?;
        let session = self.connection.session().await?;
        let ip = discovery::resolve_ip(
            session,
            &domain,
            &self.spec.private_network,
            &self.spec.lease_file(),
        )
        .await?;

        if let Some(ip) = &ip {
            *lock(&self.last_ip) = Some(ip.clone());
        }
        Ok(ip)
    }

    /// Container engine endpoint, `tcp://<ip>:2376`.
    pub async fn url(&self) -> Result<Option<String>> {
        Ok(self
            .ip()
            .await?
            .map(|ip| format!("tcp://{ip}:{ENGINE_PORT}")))
    }
}

#[async_trait]
impl<C: Connector> Driver for Machine<C> {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn machine_name(&self) -> &str {
        &self.spec.machine_name
    }

    async fn pre_create_check(&self) -> Result<()> {
        Machine::pre_create_check(self).await
    }

    async fn create(&mut self) -> Result<()> {
        Machine::create(self).await
    }

    async fn start(&self) -> Result<()> {
        Machine::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        Machine::stop(self).await
    }

    async fn restart(&self) -> Result<()> {
        Machine::restart(self).await
    }

    async fn kill(&self) -> Result<()> {
        Machine::kill(self).await
    }

    async fn remove(&self) -> Result<()> {
        Machine::remove(self).await
    }

    async fn state(&self) -> Result<DomainState> {
        Machine::state(self).await
    }

    async fn ip(&self) -> Result<Option<String>> {
        Machine::ip(self).await
    }

    async fn url(&self) -> Result<Option<String>> {
        Machine::url(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHypervisor, MockProvisioners};

    fn machine(hv: &MockHypervisor, store: &std::path::Path) -> Machine<MockHypervisor> {
        let spec = MachineSpec::builder("dev", store)
            .disk_size_mb(1)
            .lease_dir(store)
            .build()
            .unwrap();
        Machine::new(spec, hv.clone(), MockProvisioners::new().provisioners()).unwrap()
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        let hv = MockHypervisor::new();
        let store = tempfile::tempdir().unwrap();
        let m = machine(&hv, store.path());
        assert_eq!(hv.connect_count(), 0);
        assert!(!m.is_loaded());
        assert_eq!(m.driver_name(), "kvm");
        assert_eq!(m.ssh_username(), "docker");
        assert_eq!(m.ssh_port(), 22);
    }

    #[tokio::test]
    async fn test_state_of_undefined_machine_costs_one_lookup() {
        let hv = MockHypervisor::new();
        let store = tempfile::tempdir().unwrap();
        let m = machine(&hv, store.path());

        let err = m.state().await.unwrap_err();
        assert!(matches!(err, DriverError::DomainNotFound(name) if name == "dev"));
        assert_eq!(hv.domain_lookups(), 1);
        assert!(!m.is_loaded());
    }

    #[tokio::test]
    async fn test_handle_is_cached_after_lookup() {
        let hv = MockHypervisor::new();
        let session = hv.connect("test:///default").await.unwrap();
        let spec = MachineSpec::builder("dev", "/s").build().unwrap();
        session
            .define_domain(&descriptor::render_domain(&spec))
            .await
            .unwrap();
        let store = tempfile::tempdir().unwrap();
        let m = machine(&hv, store.path());

        assert_eq!(m.state().await.unwrap(), DomainState::Stopped);
        hv.set_domain_state("dev", NativeState::Crashed);
        assert_eq!(m.state().await.unwrap(), DomainState::Error);
        assert_eq!(hv.domain_lookups(), 1);
        assert!(m.is_loaded());
    }

    #[tokio::test]
    async fn test_state_query_failure_surfaces() {
        let hv = MockHypervisor::new();
        let session = hv.connect("test:///default").await.unwrap();
        session
            .define_domain("<domain><name>dev</name></domain>")
            .await
            .unwrap();
        hv.fail_state_query("connection reset");
        let store = tempfile::tempdir().unwrap();
        let m = machine(&hv, store.path());

        let err = m.state().await.unwrap_err();
        assert!(matches!(err, DriverError::Hypervisor { .. }));
    }

    #[tokio::test]
    async fn test_url_is_none_without_ip() {
        let hv = MockHypervisor::new();
        hv.add_network(
            "docker-machines",
            &crate::network::NetworkLayout::PRIVATE.render("docker-machines"),
            true,
        );
        let session = hv.connect("test:///default").await.unwrap();
        let spec = MachineSpec::builder("dev", "/s").build().unwrap();
        session
            .define_domain(&descriptor::render_domain(&spec))
            .await
            .unwrap();
        let store = tempfile::tempdir().unwrap();
        let m = machine(&hv, store.path());

        assert_eq!(m.url().await.unwrap(), None);
        assert_eq!(m.last_known_ip(), None);
    }
}
