//! libvirt backend.
//!
//! Calls into libvirt are blocking round-trips made directly from the async
//! methods, the same way the rest of the driver treats the hypervisor: one
//! call at a time, in order.

use crate::error::{DriverError, Result};
use crate::hypervisor::{Connector, DhcpLease, DomainHandle, NativeState, NetworkHandle, Session};
use async_trait::async_trait;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::Arc;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::sys;

extern "C" {
    fn free(ptr: *mut c_void);
}

/// Opens libvirt connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibvirtConnector;

#[async_trait]
impl Connector for LibvirtConnector {
    type Session = LibvirtSession;

    async fn connect(&self, uri: &str) -> Result<LibvirtSession> {
        tracing::debug!(uri = %uri, "Connecting to libvirt");
        let conn = Connect::open(Some(uri)).map_err(|e| DriverError::Connection {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
        Ok(LibvirtSession { conn })
    }
}

/// An open libvirt connection.
pub struct LibvirtSession {
    conn: Connect,
}

#[async_trait]
impl Session for LibvirtSession {
    type Domain = LibvirtDomain;
    type Network = LibvirtNetwork;

    async fn lib_version(&self) -> Result<u64> {
        self.conn
            .get_lib_version()
            .map(u64::from)
            .map_err(|e| DriverError::hypervisor("get library version", e))
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<LibvirtDomain>> {
        match Domain::lookup_by_name(&self.conn, name) {
            Ok(domain) => Ok(Some(LibvirtDomain::new(domain))),
            Err(e) if e.code() == ErrorNumber::NoDomain => Ok(None),
            Err(e) => Err(DriverError::hypervisor("lookup domain", e)),
        }
    }

    async fn define_domain(&self, xml: &str) -> Result<LibvirtDomain> {
        Domain::define_xml(&self.conn, xml)
            .map(LibvirtDomain::new)
            .map_err(|e| DriverError::hypervisor("define domain", e))
    }

    async fn lookup_network(&self, name: &str) -> Result<Option<LibvirtNetwork>> {
        match Network::lookup_by_name(&self.conn, name) {
            Ok(network) => Ok(Some(LibvirtNetwork::new(network))),
            Err(e) if e.code() == ErrorNumber::NoNetwork => Ok(None),
            Err(e) => Err(DriverError::hypervisor("lookup network", e)),
        }
    }

    async fn define_network(&self, xml: &str) -> Result<LibvirtNetwork> {
        Network::define_xml(&self.conn, xml)
            .map(LibvirtNetwork::new)
            .map_err(|e| DriverError::hypervisor("define network", e))
    }
}

/// A libvirt domain.
#[derive(Clone)]
pub struct LibvirtDomain {
    inner: Arc<Domain>,
}

impl LibvirtDomain {
    fn new(domain: Domain) -> Self {
        Self {
            inner: Arc::new(domain),
        }
    }
}

#[async_trait]
impl DomainHandle for LibvirtDomain {
    async fn create(&self) -> Result<()> {
        self.inner
            .create()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("start domain", e))
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner
            .shutdown()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("shutdown domain", e))
    }

    async fn destroy(&self) -> Result<()> {
        self.inner
            .destroy()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("destroy domain", e))
    }

    async fn undefine(&self) -> Result<()> {
        self.inner
            .undefine()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("undefine domain", e))
    }

    async fn state(&self) -> Result<NativeState> {
        let (state, _reason) = self
            .inner
            .get_state()
            .map_err(|e| DriverError::hypervisor("get domain state", e))?;
        Ok(NativeState::from_code(state as u32))
    }

    async fn xml_desc(&self) -> Result<String> {
        self.inner
            .get_xml_desc(0)
            .map_err(|e| DriverError::hypervisor("get domain descriptor", e))
    }
}

/// A libvirt virtual network.
#[derive(Clone)]
pub struct LibvirtNetwork {
    inner: Arc<Network>,
}

impl LibvirtNetwork {
    fn new(network: Network) -> Self {
        Self {
            inner: Arc::new(network),
        }
    }
}

#[async_trait]
impl NetworkHandle for LibvirtNetwork {
    async fn name(&self) -> Result<String> {
        self.inner
            .get_name()
            .map_err(|e| DriverError::hypervisor("get network name", e))
    }

    async fn xml_desc(&self) -> Result<String> {
        self.inner
            .get_xml_desc(0)
            .map_err(|e| DriverError::hypervisor("get network descriptor", e))
    }

    async fn is_active(&self) -> Result<bool> {
        self.inner
            .is_active()
            .map_err(|e| DriverError::hypervisor("get network status", e))
    }

    async fn create(&self) -> Result<()> {
        self.inner
            .create()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("start network", e))
    }

    async fn set_autostart(&self, autostart: bool) -> Result<()> {
        self.inner
            .set_autostart(autostart)
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("set network autostart", e))
    }

    async fn dhcp_leases(&self) -> Result<Vec<DhcpLease>> {
        dhcp_leases(&self.inner)
    }
}

/// Owned copy of a C string, `None` for a null pointer.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn owned(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

// The safe bindings don't expose virNetworkGetDHCPLeases.
fn dhcp_leases(network: &Network) -> Result<Vec<DhcpLease>> {
    let mut raw: *mut sys::virNetworkDHCPLeasePtr = std::ptr::null_mut();
    // SAFETY: the network pointer is valid for the lifetime of `network`; a
    // null MAC asks for every lease.
    let count =
        unsafe { sys::virNetworkGetDHCPLeases(network.as_ptr(), std::ptr::null(), &mut raw, 0) };
    if count < 0 {
        return Err(DriverError::hypervisor(
            "get DHCP leases",
            virt::error::Error::last_error(),
        ));
    }

    let mut leases = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        // SAFETY: libvirt returned `count` valid lease pointers in `raw`; each
        // is freed exactly once after its fields are copied.
        unsafe {
            let lease = *raw.add(i);
            if let (Some(mac), Some(ip_addr)) = (owned((*lease).mac), owned((*lease).ipaddr)) {
                leases.push(DhcpLease {
                    mac,
                    ip_addr,
                    hostname: owned((*lease).hostname),
                });
            }
            sys::virNetworkDHCPLeaseFree(lease);
        }
    }
    if !raw.is_null() {
        // SAFETY: the array itself was allocated by libvirt with malloc.
        unsafe { free(raw.cast()) };
    }
    Ok(leases)
}
