//! Fences for frame pacing.
//!
//! Headless rendering needs no presentation semaphores; each frame slot owns
//! one fence that its submission signals.

use crate::error::Result;
use ash::vk;

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    // SAFETY: the caller guarantees the device is valid.
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for fences to be signaled.
///
/// # Safety
/// The device and fences must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fences(
    device: &ash::Device,
    fences: &[vk::Fence],
    timeout_ns: u64,
) -> Result<()> {
    if fences.is_empty() {
        return Ok(());
    }
    // SAFETY: the caller guarantees the handles are valid.
    unsafe { device.wait_for_fences(fences, true, timeout_ns)? };
    Ok(())
}

/// Fence guarding one frame slot.
///
/// Created signaled so the first wait on a fresh slot returns immediately.
pub struct FrameFence {
    fence: vk::Fence,
}

impl FrameFence {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            // SAFETY: forwarded from the caller.
            fence: unsafe { create_fence(device, true)? },
        })
    }

    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the slot's last submission has retired.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { wait_for_fences(device, &[self.fence], u64::MAX) }
    }

    /// Return the fence to the unsignaled state right before it is submitted.
    ///
    /// # Safety
    /// The device must be valid and the fence must not be pending.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { device.reset_fences(&[self.fence])? };
        Ok(())
    }

    /// # Safety
    /// The device must be valid and the fence must not be pending.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: forwarded from the caller.
        unsafe { device.destroy_fence(self.fence, None) };
    }
}
