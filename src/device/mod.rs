//! Local accelerator discovery
//!
//! Provides:
//! - Vulkan-based enumeration of the host's devices (`gpu` feature)
//! - Simulated devices for machines without accelerators
//! - Vendor identification

mod detect;

pub use detect::*;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DeviceSettings;
use crate::error::Result;
use crate::tag::MAX_LOCAL_DEVICE_ID;
use crate::topology::DeviceProperties;

// ─────────────────────────────────────────────────────────────────
// Vendor Identification
// ─────────────────────────────────────────────────────────────────

/// Known device vendors identified by PCI vendor ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceVendor {
    /// AMD (vendor ID: 0x1002)
    Amd,
    /// NVIDIA (vendor ID: 0x10DE)
    Nvidia,
    /// Intel (vendor ID: 0x8086)
    Intel,
    /// Apple (vendor ID: 0x106B)
    Apple,
    /// Unknown vendor with raw ID
    Unknown(u32),
}

impl DeviceVendor {
    pub const AMD_VENDOR_ID: u32 = 0x1002;
    pub const NVIDIA_VENDOR_ID: u32 = 0x10DE;
    pub const INTEL_VENDOR_ID: u32 = 0x8086;
    pub const APPLE_VENDOR_ID: u32 = 0x106B;

    /// Create a vendor from its PCI vendor ID
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            Self::AMD_VENDOR_ID => DeviceVendor::Amd,
            Self::NVIDIA_VENDOR_ID => DeviceVendor::Nvidia,
            Self::INTEL_VENDOR_ID => DeviceVendor::Intel,
            Self::APPLE_VENDOR_ID => DeviceVendor::Apple,
            other => DeviceVendor::Unknown(other),
        }
    }

    pub fn vendor_id(&self) -> u32 {
        match self {
            DeviceVendor::Amd => Self::AMD_VENDOR_ID,
            DeviceVendor::Nvidia => Self::NVIDIA_VENDOR_ID,
            DeviceVendor::Intel => Self::INTEL_VENDOR_ID,
            DeviceVendor::Apple => Self::APPLE_VENDOR_ID,
            DeviceVendor::Unknown(id) => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceVendor::Amd => "AMD",
            DeviceVendor::Nvidia => "NVIDIA",
            DeviceVendor::Intel => "Intel",
            DeviceVendor::Apple => "Apple",
            DeviceVendor::Unknown(_) => "Unknown",
        }
    }
}

impl std::fmt::Display for DeviceVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ─────────────────────────────────────────────────────────────────
// Local Device List
// ─────────────────────────────────────────────────────────────────

/// Properties of a device that only exists in configuration
pub fn simulated_device(index: u32, memory_mb: u64) -> DeviceProperties {
    DeviceProperties {
        name: format!("Simulated Device {}", index),
        vendor: DeviceVendor::Unknown(0),
        pci_device_id: 0,
        total_memory_mb: memory_mb,
        driver_version: crate::version::VERSION.to_string(),
        is_discrete: true,
        compute_capable: true,
        simulated: true,
    }
}

/// Devices this host contributes to the group, in local-id order.
/// Hardware devices come first, then simulated ones.
pub fn local_devices(settings: &DeviceSettings) -> Result<Vec<DeviceProperties>> {
    let mut devices = Vec::new();

    if settings.detect {
        devices.extend(detect_devices()?.into_iter().filter(|d| d.compute_capable));
    }

    let first_simulated = devices.len() as u32;
    devices.extend(
        (0..settings.simulated).map(|i| simulated_device(first_simulated + i, settings.simulated_memory_mb)),
    );

    let limit = (MAX_LOCAL_DEVICE_ID + 1) as usize;
    if devices.len() > limit {
        warn!(
            found = devices.len(),
            limit,
            "More devices than inbox tags, ignoring the rest"
        );
        devices.truncate(limit);
    }

    info!(
        devices = devices.len(),
        simulated = devices.iter().filter(|d| d.simulated).count(),
        "Local devices ready"
    );
    Ok(devices)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
