//! Physical device capability snapshots.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// One queue family as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
}

/// Immutable snapshot of a physical device taken at enumeration time.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceDescriptor {
    pub handle: vk::PhysicalDevice,
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    /// Heap types in driver order; the index is the memory type index.
    pub memory_types: Vec<vk::MemoryType>,
    pub memory_heaps: Vec<vk::MemoryHeap>,
    pub queue_families: Vec<QueueFamily>,
    pub extensions: HashSet<String>,
}

impl PhysicalDeviceDescriptor {
    /// Query a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let queue_families = instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .map(|family| QueueFamily {
                flags: family.queue_flags,
                queue_count: family.queue_count,
            })
            .collect();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Self {
            handle: physical_device,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            properties,
            features,
            memory_types: memory_properties.memory_types
                [..memory_properties.memory_type_count as usize]
                .to_vec(),
            memory_heaps: memory_properties.memory_heaps
                [..memory_properties.memory_heap_count as usize]
                .to_vec(),
            queue_families,
            extensions,
        }
    }

    /// Whether every named extension is supported.
    pub fn supports_extensions(&self, required: &[&CStr]) -> bool {
        required.iter().all(|name| {
            name.to_str()
                .is_ok_and(|name| self.extensions.contains(name))
        })
    }

    /// Total device-local heap size in MB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.memory_heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum()
    }

    /// Get a human-readable summary of the device.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb(),
        )
    }
}

#[cfg(test)]
pub(crate) fn test_descriptor(name: &str, extensions: &[&str]) -> PhysicalDeviceDescriptor {
    PhysicalDeviceDescriptor {
        handle: vk::PhysicalDevice::null(),
        vendor: GpuVendor::Other(0),
        device_name: name.to_string(),
        device_type: vk::PhysicalDeviceType::OTHER,
        api_version: vk::API_VERSION_1_2,
        properties: vk::PhysicalDeviceProperties::default(),
        features: vk::PhysicalDeviceFeatures::default(),
        memory_types: Vec::new(),
        memory_heaps: Vec::new(),
        queue_families: vec![QueueFamily {
            flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            queue_count: 1,
        }],
        extensions: extensions.iter().map(|e| e.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn extension_support_requires_all_names() {
        let desc = test_descriptor("gpu", &["VK_KHR_swapchain", "VK_KHR_maintenance1"]);

        assert!(desc.supports_extensions(&[c"VK_KHR_swapchain"]));
        assert!(desc.supports_extensions(&[]));
        assert!(!desc.supports_extensions(&[c"VK_KHR_swapchain", c"VK_KHR_ray_query"]));
    }

    #[test]
    fn device_local_memory_sums_only_device_local_heaps() {
        let mut desc = test_descriptor("gpu", &[]);
        desc.memory_heaps = vec![
            vk::MemoryHeap {
                size: 4096 * 1024 * 1024,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            },
            vk::MemoryHeap {
                size: 8192 * 1024 * 1024,
                flags: vk::MemoryHeapFlags::empty(),
            },
        ];

        assert_eq!(desc.device_local_memory_mb(), 4096);
    }
}
