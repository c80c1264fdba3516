//! Device detection via Vulkan
//!
//! Uses the Vulkan API (via ash crate) to enumerate accelerators
//! and gather their properties.

use crate::error::Result;
use crate::topology::DeviceProperties;

#[cfg(feature = "gpu")]
use super::DeviceVendor;
#[cfg(feature = "gpu")]
use crate::error::Error;

// ─────────────────────────────────────────────────────────────────
// Vulkan-based Detection (when feature enabled)
// ─────────────────────────────────────────────────────────────────

/// Enumerate all physical devices on this host
#[cfg(feature = "gpu")]
pub fn detect_devices() -> Result<Vec<DeviceProperties>> {
    use ash::vk;
    use tracing::{debug, info, warn};

    debug!("Enumerating devices via Vulkan");

    let entry = unsafe {
        ash::Entry::load().map_err(|e| Error::DeviceDetectionFailed {
            message: format!("Failed to load Vulkan: {}", e),
        })?
    };

    let api_version = match entry.try_enumerate_instance_version() {
        Ok(Some(version)) => version,
        Ok(None) => vk::API_VERSION_1_0,
        Err(e) => {
            warn!("Failed to get Vulkan version: {:?}", e);
            vk::API_VERSION_1_0
        }
    };

    let app_info = vk::ApplicationInfo::builder()
        .application_name(c"fleetlink")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"fleetlink")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(api_version);

    let create_info = vk::InstanceCreateInfo::builder().application_info(&app_info);

    let instance = unsafe {
        entry
            .create_instance(&create_info, None)
            .map_err(|e| Error::DeviceDetectionFailed {
                message: format!("Failed to create Vulkan instance: {:?}", e),
            })?
    };

    let physical_devices = unsafe { instance.enumerate_physical_devices() };
    let physical_devices = match physical_devices {
        Ok(devices) => devices,
        Err(e) => {
            unsafe { instance.destroy_instance(None) };
            return Err(Error::DeviceDetectionFailed {
                message: format!("Failed to enumerate devices: {:?}", e),
            });
        }
    };

    let mut devices = Vec::with_capacity(physical_devices.len());

    for (idx, device) in physical_devices.iter().enumerate() {
        let properties = unsafe { instance.get_physical_device_properties(*device) };
        let memory_props = unsafe { instance.get_physical_device_memory_properties(*device) };

        let name = unsafe {
            std::ffi::CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .to_string()
        };
        let vendor = DeviceVendor::from_vendor_id(properties.vendor_id);

        let props = DeviceProperties {
            name,
            vendor,
            pci_device_id: properties.device_id,
            total_memory_mb: device_local_memory_mb(&memory_props),
            driver_version: format_driver_version(properties.driver_version, vendor),
            is_discrete: properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
            compute_capable: has_compute_queue(&instance, *device),
            simulated: false,
        };

        debug!(
            index = idx,
            name = %props.name,
            vendor = %props.vendor,
            memory_mb = props.total_memory_mb,
            "Found device"
        );
        devices.push(props);
    }

    unsafe {
        instance.destroy_instance(None);
    }

    info!(count = devices.len(), "Vulkan device enumeration finished");
    Ok(devices)
}

/// Total device-local memory in MB
#[cfg(feature = "gpu")]
fn device_local_memory_mb(memory_props: &ash::vk::PhysicalDeviceMemoryProperties) -> u64 {
    use ash::vk;

    let total_bytes: u64 = memory_props.memory_heaps[..memory_props.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();

    total_bytes / (1024 * 1024)
}

/// Format driver version (vendor-specific encoding)
#[cfg(feature = "gpu")]
fn format_driver_version(version: u32, vendor: DeviceVendor) -> String {
    match vendor {
        DeviceVendor::Nvidia => {
            // NVIDIA: (major << 22) | (minor << 14) | patch
            let major = (version >> 22) & 0x3FF;
            let minor = (version >> 14) & 0xFF;
            let patch = version & 0x3FFF;
            format!("{}.{}.{}", major, minor, patch)
        }
        _ => format!(
            "{}.{}.{}",
            ash::vk::api_version_major(version),
            ash::vk::api_version_minor(version),
            ash::vk::api_version_patch(version)
        ),
    }
}

#[cfg(feature = "gpu")]
fn has_compute_queue(instance: &ash::Instance, device: ash::vk::PhysicalDevice) -> bool {
    use ash::vk;

    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    queue_families
        .iter()
        .any(|qf| qf.queue_flags.contains(vk::QueueFlags::COMPUTE))
}

// ─────────────────────────────────────────────────────────────────
// Fallback Detection (when feature disabled)
// ─────────────────────────────────────────────────────────────────

/// Enumerate devices (stub when the gpu feature is disabled)
#[cfg(not(feature = "gpu"))]
pub fn detect_devices() -> Result<Vec<DeviceProperties>> {
    use tracing::warn;

    warn!("Device detection disabled: compile with --features gpu");
    Ok(vec![])
}

/// Check if Vulkan is available on the system
pub fn is_vulkan_available() -> bool {
    #[cfg(feature = "gpu")]
    {
        unsafe { ash::Entry::load().is_ok() }
    }

    #[cfg(not(feature = "gpu"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_devices_no_panic() {
        let _ = detect_devices();
        let _ = is_vulkan_available();
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn test_stub_reports_nothing() {
        assert!(detect_devices().unwrap().is_empty());
        assert!(!is_vulkan_available());
    }

    #[cfg(feature = "gpu")]
    #[test]
    fn test_driver_version_nvidia() {
        let encoded = (537 << 22) | (42 << 14);
        let formatted = format_driver_version(encoded, DeviceVendor::Nvidia);
        assert!(formatted.starts_with("537.42"));
    }
}
