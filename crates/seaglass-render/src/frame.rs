//! Per-slot frame state and the submission handed to the render thread.

use crate::batch::PassWork;
use crate::error::Result;
use ash::vk;
use seaglass_core::{BumpAllocator, RenderPassId, SyncQueue};
use seaglass_gpu::{DescriptorWrite, GpuBuffer, GpuDevice, ImageBarrier, MemoryLocation, RenderingDesc};

/// Lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not touched since creation or since its submission retired.
    Idle,
    /// Owned by the main thread, collecting uploads and batches.
    Accumulating,
    /// Handed to the render thread.
    Flushing,
}

/// A buffer-to-buffer copy recorded before any pass of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUpload {
    pub src: vk::Buffer,
    pub dst: vk::Buffer,
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

impl BufferUpload {
    pub(crate) const fn region(&self) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset: self.src_offset,
            dst_offset: self.dst_offset,
            size: self.size,
        }
    }
}

/// A buffer-to-image copy. The image ends up in `SHADER_READ_ONLY_OPTIMAL`.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub src: vk::Buffer,
    pub dst: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub regions: Vec<vk::BufferImageCopy>,
}

/// One pass of a frame, fully resolved for the slot it records into.
pub(crate) struct PassSubmission {
    pub id: RenderPassId,
    pub name: String,
    pub transitions: Vec<ImageBarrier>,
    pub rendering: Option<RenderingDesc>,
    pub work: Vec<Box<dyn PassWork>>,
}

/// Everything the render thread needs to record and submit one frame.
pub(crate) struct FrameSubmission {
    pub slot: usize,
    pub frame_number: u64,
    pub descriptor_writes: Vec<DescriptorWrite>,
    pub buffer_uploads: Vec<BufferUpload>,
    pub image_uploads: Vec<ImageUpload>,
    pub passes: Vec<PassSubmission>,
}

impl FrameSubmission {
    pub fn has_uploads(&self) -> bool {
        !self.buffer_uploads.is_empty() || !self.image_uploads.is_empty()
    }
}

/// Main-thread state of one frame slot.
pub(crate) struct FrameSlot {
    pub state: SlotState,
    pub tmp_host: GpuBuffer,
    pub tmp_gpu: GpuBuffer,
    pub tmp_alloc: BumpAllocator,
    pub descriptor_writes: SyncQueue<DescriptorWrite>,
    pub buffer_uploads: SyncQueue<BufferUpload>,
    pub image_uploads: SyncQueue<ImageUpload>,
}

impl FrameSlot {
    pub fn new(device: &dyn GpuDevice, index: usize, temp_size: u64) -> Result<Self> {
        let tmp_host = device.create_buffer(
            temp_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &format!("tmp_host_{index}"),
        )?;
        let tmp_gpu = match device.create_buffer(
            temp_size,
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryLocation::GpuOnly,
            &format!("tmp_gpu_{index}"),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.destroy_buffer(tmp_host)?;
                return Err(e.into());
            }
        };

        Ok(Self {
            state: SlotState::Idle,
            tmp_host,
            tmp_gpu,
            tmp_alloc: BumpAllocator::new(format!("tmp_{index}"), temp_size),
            descriptor_writes: SyncQueue::new(),
            buffer_uploads: SyncQueue::new(),
            image_uploads: SyncQueue::new(),
        })
    }

    /// Move this slot's queues into a submission.
    pub fn take_submission(
        &self,
        slot: usize,
        frame_number: u64,
        passes: Vec<PassSubmission>,
    ) -> FrameSubmission {
        let mut buffer_uploads = Vec::new();
        let used = self.tmp_alloc.used();
        if used > 0 {
            buffer_uploads.push(BufferUpload {
                src: self.tmp_host.buffer,
                dst: self.tmp_gpu.buffer,
                src_offset: 0,
                dst_offset: 0,
                size: used,
            });
        }
        self.buffer_uploads.drain_into(&mut buffer_uploads);

        FrameSubmission {
            slot,
            frame_number,
            descriptor_writes: self.descriptor_writes.drain(),
            buffer_uploads,
            image_uploads: self.image_uploads.drain(),
            passes,
        }
    }

    pub fn destroy(self, device: &dyn GpuDevice) -> Result<()> {
        device.destroy_buffer(self.tmp_host)?;
        device.destroy_buffer(self.tmp_gpu)?;
        Ok(())
    }
}
