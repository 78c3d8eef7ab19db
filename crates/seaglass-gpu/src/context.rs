//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CString;
use std::path::PathBuf;
use std::sync::Arc;

/// Default location of the persisted pipeline cache.
pub const DEFAULT_PIPELINE_CACHE_PATH: &str = "./pipeline.cache";

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,
    pub(crate) pipeline_cache_path: Option<PathBuf>,

    // One queue does graphics, compute and transfer
    pub(crate) queue_family: u32,
    pub(crate) queue: Mutex<vk::Queue>,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub const fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub const fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Get the queue family index used for all submissions.
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get the queue, locked for external synchronization.
    pub const fn queue(&self) -> &Mutex<vk::Queue> {
        &self.queue
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    pub fn pipeline_cache_path(&self) -> Option<&std::path::Path> {
        self.pipeline_cache_path.as_deref()
    }

    /// Whether object names and labels reach the driver.
    pub const fn has_debug_utils(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// Attach a debug name to a Vulkan object.
    pub fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            tracing::trace!(name, "Created object");
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        // SAFETY: the handle belongs to this device.
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::debug!("Failed to name object: {e}");
        }
    }

    /// Open a debug label region on a command buffer.
    pub fn begin_label(&self, cmd: vk::CommandBuffer, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
        // SAFETY: the command buffer is recording on this device.
        unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
    }

    /// Close the innermost debug label region.
    pub fn end_label(&self, cmd: vk::CommandBuffer) {
        if let Some(debug_utils) = &self.debug_utils {
            // SAFETY: paired with begin_label on the same command buffer.
            unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
        }
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        // Queue access must be externally synchronized
        let _queue = self.queue.lock();
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    pipeline_cache_path: Option<PathBuf>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Seaglass".to_string(),
            enable_validation: cfg!(debug_assertions),
            pipeline_cache_path: Some(PathBuf::from(DEFAULT_PIPELINE_CACHE_PATH)),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Where the pipeline cache is loaded from and saved to; `None` keeps it in memory.
    #[must_use]
    pub fn pipeline_cache_path(mut self, path: Option<PathBuf>) -> Self {
        self.pipeline_cache_path = path;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Loader(e.to_string()))?;

        let info = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;
        let instance = info.instance;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
        if !capabilities.meets_requirements() {
            tracing::error!(
                "GPU does not meet requirements: {}",
                capabilities.summary()
            );
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let queue_family = unsafe { find_queue_family(&instance, physical_device) }?;
        let descriptor_buffer = capabilities.descriptor_buffer.is_some();
        let (device, queue) = unsafe {
            create_device(&instance, physical_device, queue_family, descriptor_buffer)?
        };
        let device = Arc::new(device);

        let debug_utils = info
            .debug_utils
            .then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        let allocator = unsafe {
            GpuAllocator::new(&instance, device.clone(), physical_device, descriptor_buffer)
        }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            properties,
            allocator: Mutex::new(allocator),
            debug_utils,
            pipeline_cache_path: self.pipeline_cache_path,
            queue_family,
            queue: Mutex::new(queue),
        })
    }
}

/// Find a queue family that supports graphics and compute.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    // SAFETY: the caller guarantees the handles are valid.
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .and_then(|i| u32::try_from(i).ok())
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device and retrieve its queue.
///
/// `descriptor_buffer` enables `VK_EXT_descriptor_buffer` together with
/// buffer device addresses, which descriptor buffers are bound by.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    descriptor_buffer: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    // Bindless descriptor arrays
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_variable_descriptor_count(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .buffer_device_address(descriptor_buffer);

    let mut vulkan_1_1_features = vk::PhysicalDeviceVulkan11Features::default().multiview(true);

    let mut descriptor_buffer_features =
        vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default().descriptor_buffer(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut vulkan_1_1_features);
    let mut extensions = Vec::new();
    if descriptor_buffer {
        features2 = features2.push_next(&mut descriptor_buffer_features);
        extensions.push(ash::ext::descriptor_buffer::NAME.as_ptr());
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut features2);

    // SAFETY: the caller guarantees the handles are valid.
    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::from)?;

    // SAFETY: the queue was requested above.
    let queue = unsafe { device.get_device_queue(queue_family, 0) };

    Ok((device, queue))
}
