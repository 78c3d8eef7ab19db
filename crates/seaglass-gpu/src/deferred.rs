//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! When using multiple frames in flight, GPU resources cannot be freed immediately
//! as they may still be in use by a previous frame. This module provides a queue
//! to defer deletions until the resource is guaranteed to no longer be in use.

use crate::device::GpuDevice;
use crate::error::Result;
use crate::memory::{GpuBuffer, GpuImage};
use ash::vk;
use std::collections::VecDeque;

/// A resource waiting for the frames that may use it to retire.
#[derive(Debug)]
pub enum DeferredResource {
    Buffer(GpuBuffer),
    Image(GpuImage),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
}

impl DeferredResource {
    fn destroy(self, device: &dyn GpuDevice) -> Result<()> {
        match self {
            Self::Buffer(buffer) => device.destroy_buffer(buffer)?,
            Self::Image(image) => device.destroy_image(image)?,
            Self::ImageView(view) => device.destroy_image_view(view),
            Self::Sampler(sampler) => device.destroy_sampler(sampler),
        }
        Ok(())
    }
}

struct PendingDeletion {
    resource: DeferredResource,
    frame_queued: u64,
}

/// Queue for deferred deletions.
///
/// Resources are queued with a frame number and only freed once enough frames
/// have passed to guarantee they are no longer in use by any in-flight frame.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    /// Number of frames in flight (determines how long to wait before freeing).
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    /// Create a new deferred deletion queue.
    ///
    /// Resources are kept for `frames_in_flight` frames before being freed.
    pub const fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a resource for deferred deletion.
    pub fn queue(&mut self, resource: DeferredResource, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            resource,
            frame_queued: frame_number,
        });
    }

    pub fn queue_buffer(&mut self, buffer: GpuBuffer, frame_number: u64) {
        self.queue(DeferredResource::Buffer(buffer), frame_number);
    }

    pub fn queue_image(&mut self, image: GpuImage, frame_number: u64) {
        self.queue(DeferredResource::Image(image), frame_number);
    }

    pub fn queue_image_view(&mut self, view: vk::ImageView, frame_number: u64) {
        self.queue(DeferredResource::ImageView(view), frame_number);
    }

    /// Free resources that are safe to delete. Returns how many were freed.
    ///
    /// Call this at the start of each frame, after waiting on the frame's fence.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn process(&mut self, device: &dyn GpuDevice, current_frame_number: u64) -> Result<usize> {
        // Keep resources queued within the last `frames_in_flight` frames
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Queue order is FIFO and frame numbers are non-decreasing, so only the front can mature.
        let mut freed = 0;
        while self.pending.front().is_some_and(|p| p.frame_queued < cutoff) {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            pending.resource.destroy(device)?;
            freed += 1;
        }

        if freed > 0 {
            tracing::trace!(freed, remaining = self.pending.len(), "Deferred deletions");
        }
        Ok(freed)
    }

    /// Flush all pending deletions immediately.
    ///
    /// Call this during shutdown after the device is idle.
    pub fn flush(&mut self, device: &dyn GpuDevice) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            pending.resource.destroy(device)?;
        }
        Ok(())
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub const fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingDevice, ResourceKind};
    use gpu_allocator::MemoryLocation;

    fn buffer(device: &RecordingDevice, name: &str) -> GpuBuffer {
        device
            .create_buffer(
                64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::GpuOnly,
                name,
            )
            .unwrap()
    }

    #[test]
    fn resources_survive_frames_in_flight() {
        let device = RecordingDevice::new();
        let mut queue = DeferredDeletionQueue::new(3);

        queue.queue_buffer(buffer(&device, "a"), 10);
        assert_eq!(queue.process(&device, 10).unwrap(), 0);
        assert_eq!(queue.process(&device, 13).unwrap(), 0);
        assert_eq!(device.live(ResourceKind::Buffer), 1);

        assert_eq!(queue.process(&device, 14).unwrap(), 1);
        assert_eq!(device.live(ResourceKind::Buffer), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn fifo_order_and_mixed_kinds() {
        let device = RecordingDevice::new();
        let mut queue = DeferredDeletionQueue::new(1);

        let info = vk::ImageViewCreateInfo::default();
        let view = device.create_image_view(&info, "view").unwrap();
        queue.queue_buffer(buffer(&device, "early"), 1);
        queue.queue_image_view(view, 2);
        queue.queue_buffer(buffer(&device, "late"), 5);

        assert_eq!(queue.process(&device, 4).unwrap(), 2);
        assert_eq!(device.destroyed(ResourceKind::ImageView), 1);
        assert_eq!(device.live(ResourceKind::Buffer), 1);

        queue.flush(&device).unwrap();
        assert_eq!(device.live(ResourceKind::Buffer), 0);
    }
}
