//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Live allocation counters, used for leak reports at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub live_buffers: u32,
    pub live_images: u32,
    pub live_bytes: u64,
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    stats: AllocatorStats,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// `buffer_device_address` must match the device feature of the same name.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            stats: AllocatorStats::default(),
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(GpuError::from)?;
        }

        self.stats.live_buffers += 1;
        self.stats.live_bytes += allocation.size();

        let mapped = allocation.mapped_ptr().is_some();
        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            mapped,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            let bytes = allocation.size();
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
            self.stats.live_buffers = self.stats.live_buffers.saturating_sub(1);
            self.stats.live_bytes = self.stats.live_bytes.saturating_sub(bytes);
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();
        buffer.mapped = false;

        Ok(())
    }

    /// Allocate an image.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe {
            self.device
                .create_image(create_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(GpuError::from)?;
        }

        self.stats.live_images += 1;
        self.stats.live_bytes += allocation.size();

        Ok(GpuImage::from_create_info(image, Some(allocation), create_info))
    }

    /// Free an image allocation.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            let bytes = allocation.size();
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
            self.stats.live_images = self.stats.live_images.saturating_sub(1);
            self.stats.live_bytes = self.stats.live_bytes.saturating_sub(bytes);
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Current allocation counters.
    pub const fn stats(&self) -> AllocatorStats {
        self.stats
    }
}

impl GpuAllocator {
    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations are logged as leaks.
    pub fn shutdown(&mut self) {
        if self.stats.live_buffers > 0 || self.stats.live_images > 0 {
            tracing::warn!(
                buffers = self.stats.live_buffers,
                images = self.stats.live_images,
                bytes = self.stats.live_bytes,
                "GPU allocations still live at allocator shutdown"
            );
        }
        // gpu_allocator::Allocator::drop calls vkFreeMemory on every block
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Whether the buffer's memory is persistently mapped for host writes.
    pub mapped: bool,
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("mapped", &self.mapped)
            .finish_non_exhaustive()
    }
}

impl GpuBuffer {
    /// A buffer with no memory behind it, for devices that manage memory themselves.
    pub const fn unbacked(
        buffer: vk::Buffer,
        size: u64,
        usage: vk::BufferUsageFlags,
        mapped: bool,
    ) -> Self {
        Self {
            buffer,
            allocation: None,
            size,
            usage,
            mapped,
        }
    }

    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Check that `len` bytes at `offset` lie inside the buffer.
    pub fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "Write of {len} bytes at {offset} exceeds buffer size {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        self.check_range(offset, data.len() as u64)?;

        // SAFETY: the range was checked against the buffer size and the mapping
        // covers the whole allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("mip_levels", &self.mip_levels)
            .field("array_layers", &self.array_layers)
            .finish_non_exhaustive()
    }
}

impl GpuImage {
    /// Describe an image created from `info`.
    pub fn from_create_info(
        image: vk::Image,
        allocation: Option<Allocation>,
        info: &vk::ImageCreateInfo<'_>,
    ) -> Self {
        Self {
            image,
            allocation,
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels.max(1),
            array_layers: info.array_layers.max(1),
            usage: info.usage,
        }
    }

    /// Subresource range covering every mip and layer.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_for_format(self.format),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }
}

/// Whether `format` carries depth (and possibly stencil) data.
pub const fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Image aspect addressed by views and barriers of `format`.
pub const fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert!(!is_depth_format(vk::Format::R16G16B16A16_SFLOAT));
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn unbacked_buffer_range_checks() {
        let buffer = GpuBuffer::unbacked(
            vk::Buffer::null(),
            64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        );
        assert!(buffer.check_range(0, 64).is_ok());
        assert!(buffer.check_range(60, 8).is_err());
        assert!(buffer.check_range(u64::MAX, 2).is_err());
        // No allocation means no host pointer
        assert!(buffer.write_bytes(0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn image_description_clamps_counts() {
        let info = vk::ImageCreateInfo::default()
            .format(vk::Format::D32_SFLOAT)
            .extent(vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            })
            .mip_levels(0)
            .array_layers(2);
        let image = GpuImage::from_create_info(vk::Image::null(), None, &info);
        let range = image.full_range();
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 2);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }
}
