//! Command buffer management.

use crate::device::FrameCommands;
use crate::error::{GpuError, Result};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        // SAFETY: the caller guarantees the device is valid.
        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        // SAFETY: the caller guarantees the device is valid.
        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers)
    }

    /// Reset the command pool, returning every buffer to the initial state.
    ///
    /// # Safety
    /// The device must be valid and no buffer from this pool may be pending.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: forwarded from the caller.
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// The command pool and buffers of one frame slot.
pub struct FrameCommandPool {
    pool: CommandPool,
    commands: FrameCommands,
}

impl FrameCommandPool {
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let pool = unsafe {
            CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?
        };
        // SAFETY: forwarded from the caller.
        let buffers = unsafe { pool.allocate(device, 2)? };
        let &[upload, graphics] = buffers.as_slice() else {
            return Err(GpuError::InvalidState(
                "Expected two frame command buffers".to_string(),
            ));
        };
        Ok(Self {
            pool,
            commands: FrameCommands { upload, graphics },
        })
    }

    pub const fn commands(&self) -> FrameCommands {
        self.commands
    }

    /// Reset the pool and begin both buffers for one-time submission.
    ///
    /// # Safety
    /// The device must be valid and the slot's previous submission must have retired.
    pub unsafe fn begin(&self, device: &ash::Device) -> Result<FrameCommands> {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.pool.reset(device)?;
            begin_command_buffer(device, self.commands.upload)?;
            begin_command_buffer(device, self.commands.graphics)?;
        }
        Ok(self.commands)
    }

    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: forwarded from the caller.
        unsafe { self.pool.destroy(device) };
    }
}

/// Begin recording a command buffer for one-time submission.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // SAFETY: forwarded from the caller.
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    // SAFETY: forwarded from the caller.
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Submit command buffers in order with synchronization2, signaling `fence`.
///
/// # Safety
/// All handles must be valid and the caller must hold the queue exclusively.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    fence: vk::Fence,
) -> Result<()> {
    let infos: Vec<_> = command_buffers
        .iter()
        .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
        .collect();
    let submit_info = vk::SubmitInfo2::default().command_buffer_infos(&infos);

    // SAFETY: forwarded from the caller.
    unsafe { device.queue_submit2(queue, &[submit_info], fence)? };
    Ok(())
}
