//! GPU capability detection.

use crate::descriptors::DescriptorBufferProperties;
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
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    /// Dynamic rendering (VK 1.3 core)
    pub supports_dynamic_rendering: bool,
    /// Synchronization2 (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Variable-count, partially bound, update-after-bind descriptor arrays
    pub supports_bindless: bool,
    /// `VK_EXT_descriptor_buffer` with buffer device addresses, and its
    /// descriptor sizes
    pub descriptor_buffer: Option<DescriptorBufferProperties>,

    /// Largest array a bindless sampled-image binding may declare
    pub max_bindless_sampled_images: u32,
    pub max_bound_descriptor_sets: u32,
    pub max_push_constants_size: u32,
    pub device_local_memory_mb: u64,
    pub max_memory_allocation_count: u32,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: the caller guarantees the handles are valid.
        let (properties, memory_properties, extensions) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
                instance
                    .enumerate_device_extension_properties(physical_device)
                    .unwrap_or_default(),
            )
        };

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();

        let mut indexing_props = vk::PhysicalDeviceDescriptorIndexingProperties::default();
        let mut indexing_features = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
        {
            let mut props2 =
                vk::PhysicalDeviceProperties2::default().push_next(&mut indexing_props);
            let mut features2 =
                vk::PhysicalDeviceFeatures2::default().push_next(&mut indexing_features);
            // SAFETY: the caller guarantees the handles are valid.
            unsafe {
                instance.get_physical_device_properties2(physical_device, &mut props2);
                instance.get_physical_device_features2(physical_device, &mut features2);
            }
        }

        let descriptor_buffer = if available_extensions.contains(DESCRIPTOR_BUFFER_EXTENSION) {
            // SAFETY: the caller guarantees the handles are valid.
            unsafe { query_descriptor_buffer(instance, physical_device) }
        } else {
            None
        };

        let device_name = properties
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 = api_at_least_1_3(api_version);

        let supports_bindless = indexing_features.descriptor_binding_partially_bound == vk::TRUE
            && indexing_features.descriptor_binding_variable_descriptor_count == vk::TRUE
            && indexing_features.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
            && indexing_features.runtime_descriptor_array == vk::TRUE;

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: has_vulkan_1_3,
            supports_synchronization2: has_vulkan_1_3,
            supports_bindless,
            descriptor_buffer,

            max_bindless_sampled_images: indexing_props
                .max_descriptor_set_update_after_bind_sampled_images,
            max_bound_descriptor_sets: properties.limits.max_bound_descriptor_sets,
            max_push_constants_size: properties.limits.max_push_constants_size,
            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,

            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the renderer.
    pub fn meets_requirements(&self) -> bool {
        api_at_least_1_3(self.api_version)
            && self.supports_dynamic_rendering
            && self.supports_synchronization2
            && self.supports_bindless
            && self.max_bound_descriptor_sets >= 4
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

pub(crate) const DESCRIPTOR_BUFFER_EXTENSION: &str = "VK_EXT_descriptor_buffer";

/// Descriptor sizes, when both descriptor buffers and buffer device
/// addresses are supported.
///
/// # Safety
/// The instance and physical device must be valid and the device must
/// expose `VK_EXT_descriptor_buffer`.
unsafe fn query_descriptor_buffer(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<DescriptorBufferProperties> {
    let mut buffer_features = vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default();
    let mut address_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
    let mut buffer_props = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
    {
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut buffer_features)
            .push_next(&mut address_features);
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut buffer_props);
        // SAFETY: the caller guarantees the handles are valid.
        unsafe {
            instance.get_physical_device_features2(physical_device, &mut features2);
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }
    }

    (buffer_features.descriptor_buffer == vk::TRUE
        && address_features.buffer_device_address == vk::TRUE)
        .then(|| DescriptorBufferProperties::from_vk(&buffer_props))
}

pub(crate) const fn api_at_least_1_3(version: u32) -> bool {
    let major = vk::api_version_major(version);
    major > 1 || (major == 1 && vk::api_version_minor(version) >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 1,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_bindless: true,
            descriptor_buffer: None,
            max_bindless_sampled_images: 500_000,
            max_bound_descriptor_sets: 8,
            max_push_constants_size: 128,
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requirements() {
        assert!(capable().meets_requirements());

        let old = GpuCapabilities {
            api_version: vk::API_VERSION_1_2,
            ..capable()
        };
        assert!(!old.meets_requirements());

        let no_bindless = GpuCapabilities {
            supports_bindless: false,
            ..capable()
        };
        assert!(!no_bindless.meets_requirements());
    }

    #[test]
    fn api_version_comparison() {
        assert!(api_at_least_1_3(vk::make_api_version(0, 1, 3, 0)));
        assert!(api_at_least_1_3(vk::make_api_version(0, 2, 0, 0)));
        assert!(!api_at_least_1_3(vk::make_api_version(0, 1, 2, 198)));
    }

    #[test]
    fn summary_mentions_device() {
        let summary = capable().summary();
        assert!(summary.contains("Test GPU"));
        assert!(summary.contains("8192 MB"));
    }
}
