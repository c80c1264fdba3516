//! Host and device identities
//!
//! The [`Topology`] is built once by [`crate::manager::HostManager::start`]
//! and is read-only afterwards. Device lists are only populated on the
//! master, which is the only host that dispatches work.

use serde::{Deserialize, Serialize};

use crate::device::DeviceVendor;

/// Index of a host within its group (`0..host_count`)
pub type HostId = usize;

/// Host id of the master
pub const MASTER_HOST: HostId = 0;

// ─────────────────────────────────────────────────────────────────
// Device Identity
// ─────────────────────────────────────────────────────────────────

/// Globally unique device address: the owning host plus its local index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    /// Host that owns the device
    pub host_id: HostId,

    /// Device index on that host
    pub local_id: u32,
}

impl DeviceId {
    pub const fn new(host_id: HostId, local_id: u32) -> Self {
        Self { host_id, local_id }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host{}/dev{}", self.host_id, self.local_id)
    }
}

// ─────────────────────────────────────────────────────────────────
// Device Properties
// ─────────────────────────────────────────────────────────────────

/// Capabilities of one accelerator, reported by its host during discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Device name
    pub name: String,

    /// Device vendor
    pub vendor: DeviceVendor,

    /// PCI device ID
    pub pci_device_id: u32,

    /// Total device memory in MB
    pub total_memory_mb: u64,

    /// Driver version string
    pub driver_version: String,

    /// Whether this is a discrete device (vs integrated)
    pub is_discrete: bool,

    /// Whether compute workloads are supported
    pub compute_capable: bool,

    /// Created from configuration instead of real hardware
    pub simulated: bool,
}

impl DeviceProperties {
    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        let kind = if self.simulated {
            "simulated"
        } else if self.is_discrete {
            "discrete"
        } else {
            "integrated"
        };
        format!(
            "{} {} ({}MB, {})",
            self.vendor, self.name, self.total_memory_mb, kind
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Topology
// ─────────────────────────────────────────────────────────────────

/// Frozen view of the group as seen by one host
#[derive(Debug, Clone)]
pub struct Topology {
    host_id: HostId,
    host_count: usize,
    devices: Vec<DeviceId>,
    properties: Vec<DeviceProperties>,
    registered: Vec<bool>,
}

impl Topology {
    pub(crate) fn new(host_id: HostId, host_count: usize) -> Self {
        assert!(host_count > 0, "a group needs at least one host");
        assert!(
            host_id < host_count,
            "host id {host_id} is outside a group of {host_count} hosts"
        );
        Self {
            host_id,
            host_count,
            devices: Vec::new(),
            properties: Vec::new(),
            registered: vec![false; host_count],
        }
    }

    /// Append the devices of one host; local ids follow list order.
    pub(crate) fn register_host(&mut self, host_id: HostId, props: Vec<DeviceProperties>) {
        assert!(self.is_master(), "only the master registers devices");
        assert!(host_id < self.host_count, "unknown host {host_id}");
        assert!(
            !std::mem::replace(&mut self.registered[host_id], true),
            "devices of host {host_id} registered twice"
        );

        for (local_id, p) in props.into_iter().enumerate() {
            self.devices.push(DeviceId::new(host_id, local_id as u32));
            self.properties.push(p);
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn host_count(&self) -> usize {
        self.host_count
    }

    pub fn is_master(&self) -> bool {
        self.host_id == MASTER_HOST
    }

    pub const fn master_id() -> HostId {
        MASTER_HOST
    }

    /// All devices in the group, master only
    pub fn devices(&self) -> &[DeviceId] {
        assert!(self.is_master(), "device list is only available on the master");
        &self.devices
    }

    /// Properties in the same order as [`Topology::devices`], master only
    pub fn device_properties(&self) -> &[DeviceProperties] {
        assert!(
            self.is_master(),
            "device properties are only available on the master"
        );
        &self.properties
    }

    /// Devices owned by one host, master only
    pub fn devices_on_host(&self, host_id: HostId) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices().iter().copied().filter(move |d| d.host_id == host_id)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
