//! Domain descriptor rendering and inspection.

use crate::config::MachineSpec;
use crate::error::{DriverError, Result};
use crate::xml::{self, XmlWriter};

/// Listen address of the local-only VNC console.
const CONSOLE_LISTEN: &str = "127.0.0.1";

/// Index of the private network interface in every descriptor we render.
///
/// Discovery relies on this: the interface at this index is the one whose
/// MAC address appears in the private network's DHCP leases.
pub const PRIVATE_INTERFACE_INDEX: usize = 1;

/// Render the domain descriptor for `spec`.
///
/// Pure and deterministic: the same spec always yields the same document.
pub fn render_domain(spec: &MachineSpec) -> String {
    let memory = spec.memory_mb.to_string();
    let vcpus = spec.cpu_count.to_string();
    let boot_image = spec.boot_image_path.to_string_lossy();
    let disk = spec.disk_path.to_string_lossy();

    let mut w = XmlWriter::new();
    w.open("domain", &[("type", "kvm")]);
    w.text("name", &[], &spec.machine_name);
    w.text("memory", &[("unit", "M")], &memory);
    w.text("vcpu", &[], &vcpus);

    w.open("features", &[]);
    w.empty("acpi", &[]);
    w.empty("apic", &[]);
    w.empty("pae", &[]);
    w.close();

    w.empty("cpu", &[("mode", "host-passthrough")]);

    w.open("os", &[]);
    w.text("type", &[], "hvm");
    w.empty("boot", &[("dev", "cdrom")]);
    w.empty("boot", &[("dev", "hd")]);
    w.empty("bootmenu", &[("enable", "no")]);
    w.close();

    w.open("devices", &[]);

    w.open("disk", &[("type", "file"), ("device", "cdrom")]);
    w.empty("source", &[("file", &*boot_image)]);
    w.empty("target", &[("dev", "hdc"), ("bus", "ide")]);
    w.empty("readonly", &[]);
    w.close();

    w.open("disk", &[("type", "file"), ("device", "disk")]);
    w.empty(
        "driver",
        &[
            ("name", "qemu"),
            ("type", "raw"),
            ("cache", spec.cache_mode.as_str()),
            ("io", spec.io_mode.as_str()),
        ],
    );
    w.empty("source", &[("file", &*disk)]);
    w.empty("target", &[("dev", "hda"), ("bus", "ide")]);
    w.close();

    w.open(
        "graphics",
        &[
            ("type", "vnc"),
            ("autoport", "yes"),
            ("websocket", "-1"),
            ("listen", CONSOLE_LISTEN),
        ],
    );
    w.empty("listen", &[("type", "address"), ("address", CONSOLE_LISTEN)]);
    w.close();

    // Order matters, see PRIVATE_INTERFACE_INDEX.
    for network in [&spec.network, &spec.private_network] {
        w.open("interface", &[("type", "network")]);
        w.empty("source", &[("network", network.as_str())]);
        w.empty("model", &[("type", "virtio")]);
        w.close();
    }

    w.finish()
}

/// A network interface as listed in a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceInfo {
    /// Interface type (`network`, `bridge`, ...)
    pub kind: String,
    /// MAC address, present once the hypervisor assigned one
    pub mac: Option<String>,
    /// Source network name, for `network` interfaces
    pub network: Option<String>,
}

/// List the interfaces of a domain descriptor in document order.
///
/// # Errors
/// Returns [`DriverError::Descriptor`] if `xml` is not a domain descriptor.
pub fn parse_interfaces(xml: &str) -> Result<Vec<InterfaceInfo>> {
    let root = xml::parse(xml)?;
    if root.name != "domain" {
        return Err(DriverError::Descriptor(format!(
            "expected <domain>, found <{}>",
            root.name
        )));
    }
    let Some(devices) = root.child("devices") else {
        return Ok(Vec::new());
    };
    Ok(devices
        .children_named("interface")
        .map(|iface| InterfaceInfo {
            kind: iface.attr("type").unwrap_or_default().to_string(),
            mac: iface
                .child("mac")
                .and_then(|m| m.attr("address"))
                .map(str::to_string),
            network: iface
                .child("source")
                .and_then(|s| s.attr("network"))
                .map(str::to_string),
        })
        .collect())
}

/// MAC address of the private network interface in a live domain descriptor.
///
/// # Errors
/// Returns [`DriverError::Topology`] if fewer than two interfaces are present,
/// or [`DriverError::Descriptor`] if the private interface carries no MAC.
pub fn private_mac(xml: &str) -> Result<String> {
    let interfaces = parse_interfaces(xml)?;
    if interfaces.len() <= PRIVATE_INTERFACE_INDEX {
        return Err(DriverError::Topology {
            found: interfaces.len(),
        });
    }
    interfaces[PRIVATE_INTERFACE_INDEX]
        .mac
        .clone()
        .ok_or_else(|| DriverError::Descriptor("private interface has no MAC address".into()))
}
