//! Vulkan instance creation.

use crate::capabilities::api_at_least_1_3;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions for headless rendering.
///
/// Debug utils is only requested with validation, where object names and
/// command labels show up in validation messages.
pub fn required_instance_extensions(enable_validation: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);
    extensions
}

/// A created instance and whether debug utils were enabled on it.
pub struct InstanceInfo {
    pub instance: ash::Instance,
    pub debug_utils: bool,
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<InstanceInfo> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidState(format!("Invalid application name {app_name:?}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Seaglass")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    // Validation is best effort: a missing layer only disables it
    let mut validation = enable_validation;
    if validation {
        // SAFETY: the caller guarantees the entry is valid.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let found = available_layers
            .iter()
            .any(|props| props.layer_name_as_c_str().ok() == Some(VALIDATION_LAYER));
        if !found {
            tracing::warn!(
                "Validation layer {} not available",
                VALIDATION_LAYER.to_string_lossy()
            );
            validation = false;
        }
    }

    let extension_names: Vec<*const c_char> = required_instance_extensions(validation)
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();
    let layer_names: Vec<*const c_char> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    // SAFETY: the caller guarantees the entry is valid.
    let instance = unsafe { entry.create_instance(&create_info, None)? };

    Ok(InstanceInfo {
        instance,
        debug_utils: validation,
    })
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    // SAFETY: the caller guarantees the instance is valid.
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        // SAFETY: handles come from the instance.
        .map(|device| (unsafe { score_physical_device(instance, device) }, device))
        .filter(|(score, _)| *score >= 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Negative means unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    // SAFETY: the caller guarantees the handles are valid.
    let (properties, memory) = unsafe {
        (
            instance.get_physical_device_properties(device),
            instance.get_physical_device_memory_properties(device),
        )
    };

    if !api_at_least_1_3(properties.api_version) {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // +1 per GB of device-local memory
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size >> 30)
        .sum();
    score += i64::try_from(vram_gb).unwrap_or(i64::MAX / 2);

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_utils_only_with_validation() {
        assert!(required_instance_extensions(true).contains(&ash::ext::debug_utils::NAME));
        assert!(!required_instance_extensions(false).contains(&ash::ext::debug_utils::NAME));
    }
}
