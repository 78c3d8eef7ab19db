//! The render system: frame slots, uploads and resource creation.
//!
//! The main thread accumulates into the current slot between
//! [`RenderSystem::begin_frame`] and the submit. Submitting hands the slot to
//! the render thread and moves on to the next one; a slot is only written
//! again after the render thread and the GPU are both done with it.

use crate::config::RenderConfig;
use crate::descriptor_pool::FrameDescriptorPool;
use crate::error::{RenderError, Result};
use crate::frame::{BufferUpload, FrameSlot, ImageUpload, PassSubmission, SlotState};
use crate::render_thread::RenderThread;
use ash::vk;
use seaglass_core::constants::FRAME_STATE_COUNT;
use seaglass_gpu::{
    DeferredDeletionQueue, DescriptorPoolDesc, DescriptorSetLayoutDesc, DescriptorWrite, GpuBuffer,
    GpuDevice, GpuImage, GraphicsPipelineConfig, MemoryLocation,
};
use std::sync::Arc;

/// Alignment of image data placed in the temp buffer.
const IMAGE_UPLOAD_ALIGNMENT: u64 = 16;

/// A device-local buffer with an optional persistent staging buffer.
#[derive(Debug)]
pub struct StagedBuffer {
    pub buffer: GpuBuffer,
    /// Host-visible copy source. Without it updates go through the temp buffer.
    pub host: Option<GpuBuffer>,
}

/// Owns the frame slots and talks to the render thread.
pub struct RenderSystem {
    device: Arc<dyn GpuDevice>,
    config: RenderConfig,
    slots: Vec<FrameSlot>,
    frame_idx: usize,
    frame_number: u64,
    deferred: DeferredDeletionQueue,
    thread: RenderThread,
    shut_down: bool,
}

fn logged<T>(what: &str, name: &str, result: seaglass_gpu::Result<T>) -> Result<T> {
    result.map_err(|e| {
        tracing::error!("Failed to create {what} '{name}': {e}");
        e.into()
    })
}

fn destroy_slots(device: &dyn GpuDevice, slots: Vec<FrameSlot>) {
    for slot in slots {
        if let Err(e) = slot.destroy(device) {
            tracing::warn!("Failed to destroy frame slot: {e}");
        }
    }
}

fn shut_down_error() -> RenderError {
    RenderError::InvalidState("Render system is shut down".to_string())
}

/// The slot at `idx`, as long as the render thread does not own it.
fn writable(slots: &mut [FrameSlot], idx: usize) -> Result<&mut FrameSlot> {
    let slot = slots.get_mut(idx).ok_or_else(shut_down_error)?;
    if slot.state == SlotState::Flushing {
        return Err(RenderError::InvalidState(format!(
            "Slot {idx} is still being flushed; call begin_frame first"
        )));
    }
    Ok(slot)
}

impl RenderSystem {
    pub fn new(device: Arc<dyn GpuDevice>, config: RenderConfig) -> Result<Self> {
        // A slot is reused FRAME_STATE_COUNT frames after it was submitted
        if config.deferred_free_latency < FRAME_STATE_COUNT {
            return Err(RenderError::InvalidConfig(format!(
                "deferred free latency {} is below the {FRAME_STATE_COUNT} frames in flight",
                config.deferred_free_latency
            )));
        }

        let mut slots = Vec::with_capacity(FRAME_STATE_COUNT);
        for index in 0..FRAME_STATE_COUNT {
            match FrameSlot::new(device.as_ref(), index, config.temp_buffer_size) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    destroy_slots(device.as_ref(), slots);
                    return Err(e);
                }
            }
        }

        let thread = match RenderThread::spawn(
            Arc::clone(&device),
            &config.render_thread_name,
            FRAME_STATE_COUNT,
        ) {
            Ok(thread) => thread,
            Err(e) => {
                destroy_slots(device.as_ref(), slots);
                return Err(e);
            }
        };

        tracing::info!(
            slots = FRAME_STATE_COUNT,
            temp_buffer_size = config.temp_buffer_size,
            "Render system created"
        );

        Ok(Self {
            device,
            deferred: DeferredDeletionQueue::new(config.deferred_free_latency),
            config,
            slots,
            frame_idx: 0,
            frame_number: 0,
            thread,
            shut_down: false,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub const fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Index of the slot currently accumulating.
    pub const fn frame_idx(&self) -> usize {
        self.frame_idx
    }

    /// Number of frames submitted so far.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Bytes bump-allocated from the current slot's temp buffer.
    pub fn temp_buffer_used(&self) -> u64 {
        self.slots.get(self.frame_idx).map_or(0, |s| s.tmp_alloc.used())
    }

    pub const fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Resources waiting in the deferred free queue.
    pub fn pending_deletions(&self) -> usize {
        self.deferred.pending_count()
    }

    /// Take ownership of the current slot for this tick.
    ///
    /// Blocks until the render thread finished the slot's previous frame and
    /// the GPU retired it, then rewinds its temp allocator and frees deferred
    /// resources that are old enough.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self) -> Result<()> {
        let idx = self.frame_idx;
        let state = self.slots.get(idx).ok_or_else(shut_down_error)?.state;
        match state {
            SlotState::Accumulating => {
                return Err(RenderError::InvalidState(format!(
                    "Frame {} already begun",
                    self.frame_number
                )));
            }
            SlotState::Flushing => {
                let recorded = self.thread.wait(idx);
                let slot = self.slots.get_mut(idx).ok_or_else(shut_down_error)?;
                slot.state = SlotState::Idle;
                slot.tmp_alloc.reset();
                recorded?;
                self.device.wait_frame(idx)?;
            }
            SlotState::Idle => {}
        }

        self.deferred
            .process(self.device.as_ref(), self.frame_number)?;
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.state = SlotState::Accumulating;
        }
        tracing::trace!(slot = idx, frame = self.frame_number, "Begin frame");
        Ok(())
    }

    /// Submit the current slot with no passes, flushing only its uploads.
    pub fn submit_frame(&mut self) -> Result<()> {
        self.submit_passes(Vec::new())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn submit_passes(&mut self, passes: Vec<PassSubmission>) -> Result<()> {
        let idx = self.frame_idx;
        let slot = self.slots.get_mut(idx).ok_or_else(shut_down_error)?;
        if slot.state != SlotState::Accumulating {
            return Err(RenderError::InvalidState(
                "submit_frame called without begin_frame".to_string(),
            ));
        }

        let submission = slot.take_submission(idx, self.frame_number, passes);
        tracing::trace!(
            slot = idx,
            frame = self.frame_number,
            passes = submission.passes.len(),
            buffer_uploads = submission.buffer_uploads.len(),
            image_uploads = submission.image_uploads.len(),
            "Submit frame"
        );
        self.thread.submit(submission)?;
        slot.state = SlotState::Flushing;

        self.frame_idx = (idx + 1) % FRAME_STATE_COUNT;
        self.frame_number += 1;
        Ok(())
    }

    /// Device-local buffer that can be a copy destination.
    pub fn alloc_gpu_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        logged(
            "GPU buffer",
            name,
            self.device.create_buffer(
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
                name,
            ),
        )
    }

    /// Host-visible buffer that can be a copy source.
    pub fn alloc_host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        logged(
            "host buffer",
            name,
            self.device.create_buffer(
                size,
                usage | vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                name,
            ),
        )
    }

    /// Device-local buffer filled from a persistent staging buffer.
    pub fn create_gpu_buffer_with_data(
        &mut self,
        usage: vk::BufferUsageFlags,
        data: &[u8],
        name: &str,
    ) -> Result<StagedBuffer> {
        let size = data.len() as u64;
        let host = self.alloc_host_buffer(size, vk::BufferUsageFlags::empty(), &format!("{name}_host"))?;
        let buffer = match self.alloc_gpu_buffer(size, usage, name) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.device.destroy_buffer(host)?;
                return Err(e);
            }
        };
        let staged = StagedBuffer {
            buffer,
            host: Some(host),
        };
        self.update_gpu_buffer(&staged, 0, data)?;
        Ok(staged)
    }

    /// Device-local buffer filled through this frame's temp buffer.
    pub fn create_gpu_buffer_tmp(
        &mut self,
        usage: vk::BufferUsageFlags,
        data: &[u8],
        alignment: u64,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer = self.alloc_gpu_buffer(data.len() as u64, usage, name)?;
        if let Err(e) = self.update_gpu_buffer_tmp(&buffer, 0, data, alignment) {
            self.device.destroy_buffer(buffer)?;
            return Err(e);
        }
        Ok(buffer)
    }

    /// Write `data` at `offset` and queue the copy into the device buffer.
    pub fn update_gpu_buffer(&mut self, staged: &StagedBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let Some(host) = &staged.host else {
            return self.update_gpu_buffer_tmp(&staged.buffer, offset, data, IMAGE_UPLOAD_ALIGNMENT);
        };
        staged.buffer.check_range(offset, data.len() as u64)?;
        let slot = writable(&mut self.slots, self.frame_idx)?;
        self.device.write_buffer(host, offset, data)?;
        slot.buffer_uploads.push(BufferUpload {
            src: host.buffer,
            dst: staged.buffer.buffer,
            src_offset: offset,
            dst_offset: offset,
            size: data.len() as u64,
        });
        Ok(())
    }

    /// Stage `data` in the temp buffer and queue its copy into `dst`.
    pub fn update_gpu_buffer_tmp(
        &mut self,
        dst: &GpuBuffer,
        dst_offset: u64,
        data: &[u8],
        alignment: u64,
    ) -> Result<()> {
        dst.check_range(dst_offset, data.len() as u64)?;
        let src_offset = self.copy_to_temp_buffer(data, alignment)?;
        let slot = writable(&mut self.slots, self.frame_idx)?;
        slot.buffer_uploads.push(BufferUpload {
            src: slot.tmp_host.buffer,
            dst: dst.buffer,
            src_offset,
            dst_offset,
            size: data.len() as u64,
        });
        Ok(())
    }

    /// Bump-allocate in this slot's temp buffer and copy `data` there.
    ///
    /// The returned offset is valid in both the host and GPU temp buffers
    /// until this slot comes around again.
    pub fn copy_to_temp_buffer(&mut self, data: &[u8], alignment: u64) -> Result<u64> {
        let slot = writable(&mut self.slots, self.frame_idx)?;
        let offset = slot.tmp_alloc.alloc(data.len() as u64, alignment)?;
        self.device.write_buffer(&slot.tmp_host, offset, data)?;
        Ok(offset)
    }

    /// [`Self::copy_to_temp_buffer`] for plain-old-data values.
    pub fn copy_pod_to_temp_buffer<T: bytemuck::Pod>(&mut self, values: &[T]) -> Result<u64> {
        self.copy_to_temp_buffer(
            bytemuck::cast_slice(values),
            std::mem::align_of::<T>() as u64,
        )
    }

    /// GPU temp buffer of the current slot; null after shutdown.
    pub fn get_gpu_temp_buffer(&self) -> vk::Buffer {
        self.slots
            .get(self.frame_idx)
            .map_or(vk::Buffer::null(), |s| s.tmp_gpu.buffer)
    }

    /// Host temp buffer of the current slot; null after shutdown.
    pub fn get_host_temp_buffer(&self) -> vk::Buffer {
        self.slots
            .get(self.frame_idx)
            .map_or(vk::Buffer::null(), |s| s.tmp_host.buffer)
    }

    pub fn alloc_gpu_image(&self, info: &vk::ImageCreateInfo<'_>, name: &str) -> Result<GpuImage> {
        logged("image", name, self.device.create_image(info, name))
    }

    /// Image filled with `data`, ready for sampling once this frame runs.
    ///
    /// `regions` are relative to the start of `data`; when empty one region
    /// covering mip 0 of every layer is used. Data that does not fit the temp
    /// buffer goes through a dedicated staging buffer that is freed once the
    /// frame retires.
    pub fn create_gpu_image_with_data(
        &mut self,
        info: &vk::ImageCreateInfo<'_>,
        data: &[u8],
        regions: &[vk::BufferImageCopy],
        name: &str,
    ) -> Result<GpuImage> {
        let info = info.usage(info.usage | vk::ImageUsageFlags::TRANSFER_DST);
        let image = self.alloc_gpu_image(&info, name)?;

        let staged = match self.copy_to_temp_buffer(data, IMAGE_UPLOAD_ALIGNMENT) {
            Ok(offset) => Ok((self.get_host_temp_buffer(), offset)),
            Err(RenderError::Core(seaglass_core::Error::CapacityExceeded { .. })) => {
                self.stage_oversized(data, name)
            }
            Err(e) => Err(e),
        };
        let (src, base) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                self.device.destroy_image(image)?;
                return Err(e);
            }
        };

        let regions = if regions.is_empty() {
            vec![vk::BufferImageCopy {
                buffer_offset: base,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: seaglass_gpu::memory::aspect_for_format(image.format),
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: image.array_layers,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: image.extent,
            }]
        } else {
            regions
                .iter()
                .map(|r| vk::BufferImageCopy {
                    buffer_offset: r.buffer_offset + base,
                    ..*r
                })
                .collect()
        };

        self.upload_buffer_to_image(src, &image, regions)?;
        Ok(image)
    }

    fn stage_oversized(&mut self, data: &[u8], name: &str) -> Result<(vk::Buffer, u64)> {
        let staging = self.alloc_host_buffer(
            data.len() as u64,
            vk::BufferUsageFlags::empty(),
            &format!("{name}_staging"),
        )?;
        if let Err(e) = self.device.write_buffer(&staging, 0, data) {
            self.device.destroy_buffer(staging)?;
            return Err(e.into());
        }
        tracing::debug!(name, bytes = data.len(), "Image data staged outside temp buffer");
        let buffer = staging.buffer;
        self.free_gpu_buffer_deferred(staging);
        Ok((buffer, 0))
    }

    /// Queue buffer copies into the current frame.
    pub fn upload_buffers(&mut self, uploads: &[BufferUpload]) -> Result<()> {
        writable(&mut self.slots, self.frame_idx)?
            .buffer_uploads
            .extend(uploads.iter().copied());
        Ok(())
    }

    /// Queue a copy from `src` into every subresource named by `regions`.
    pub fn upload_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        image: &GpuImage,
        regions: Vec<vk::BufferImageCopy>,
    ) -> Result<()> {
        writable(&mut self.slots, self.frame_idx)?
            .image_uploads
            .push(ImageUpload {
                src,
                dst: image.image,
                range: image.full_range(),
                regions,
            });
        Ok(())
    }

    pub fn create_image_view(
        &self,
        info: &vk::ImageViewCreateInfo<'_>,
        name: &str,
    ) -> Result<vk::ImageView> {
        logged("image view", name, self.device.create_image_view(info, name))
    }

    pub fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>, name: &str) -> Result<vk::Sampler> {
        logged("sampler", name, self.device.create_sampler(info, name))
    }

    pub fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
        name: &str,
    ) -> Result<vk::DescriptorSetLayout> {
        logged(
            "descriptor set layout",
            name,
            self.device.create_descriptor_set_layout(desc, name),
        )
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
        name: &str,
    ) -> Result<vk::PipelineLayout> {
        logged(
            "pipeline layout",
            name,
            self.device
                .create_pipeline_layout(set_layouts, push_constants, name),
        )
    }

    pub fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        name: &str,
    ) -> Result<vk::Pipeline> {
        logged(
            "graphics pipeline",
            name,
            self.device.create_graphics_pipeline(config, name),
        )
    }

    pub fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        spirv: &[u32],
        entry_point: &str,
        name: &str,
    ) -> Result<vk::Pipeline> {
        logged(
            "compute pipeline",
            name,
            self.device
                .create_compute_pipeline(layout, spirv, entry_point, name),
        )
    }

    pub fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
        name: &str,
    ) -> Result<vk::DescriptorPool> {
        logged(
            "descriptor pool",
            name,
            self.device.create_descriptor_pool(desc, name),
        )
    }

    pub fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: Option<&[u32]>,
    ) -> Result<Vec<vk::DescriptorSet>> {
        self.device
            .allocate_descriptor_sets(pool, layouts, variable_counts)
            .map_err(|e| {
                tracing::error!(sets = layouts.len(), "Failed to allocate descriptor sets: {e}");
                e.into()
            })
    }

    pub fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        Ok(self.device.reset_descriptor_pool(pool)?)
    }

    /// Write descriptors now. The sets must not be in use by a frame in flight
    /// unless their bindings are update-after-bind.
    pub fn update_descriptors(&self, writes: &[DescriptorWrite]) {
        if !writes.is_empty() {
            self.device.update_descriptor_sets(writes);
        }
    }

    /// Write descriptors on the render thread, just before this frame records.
    pub fn queue_descriptor_writes(&mut self, writes: &[DescriptorWrite]) -> Result<()> {
        writable(&mut self.slots, self.frame_idx)?
            .descriptor_writes
            .extend(writes.iter().copied());
        Ok(())
    }

    /// Reset or regrow `pool` for the current slot and reallocate its sets.
    pub fn frame_desc_pool_tick(
        &self,
        pool: &mut FrameDescriptorPool,
        desc: &DescriptorPoolDesc,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: Option<&[u32]>,
    ) -> Result<()> {
        pool.tick(self, desc, layouts, variable_counts)
    }

    /// Destroy a buffer no frame in flight references.
    pub fn free_gpu_buffer(&self, buffer: GpuBuffer) -> Result<()> {
        Ok(self.device.destroy_buffer(buffer)?)
    }

    /// Destroy an image no frame in flight references.
    pub fn free_gpu_image(&self, image: GpuImage) -> Result<()> {
        Ok(self.device.destroy_image(image)?)
    }

    /// Destroy `buffer` once every frame that may use it has retired.
    ///
    /// After shutdown nothing is in flight and the free happens right away.
    pub fn free_gpu_buffer_deferred(&mut self, buffer: GpuBuffer) {
        self.deferred.queue_buffer(buffer, self.frame_number);
        self.flush_deferred_after_shutdown();
    }

    pub fn free_gpu_image_deferred(&mut self, image: GpuImage) {
        self.deferred.queue_image(image, self.frame_number);
        self.flush_deferred_after_shutdown();
    }

    pub fn free_image_view_deferred(&mut self, view: vk::ImageView) {
        self.deferred.queue_image_view(view, self.frame_number);
        self.flush_deferred_after_shutdown();
    }

    fn flush_deferred_after_shutdown(&mut self) {
        if self.shut_down {
            if let Err(e) = self.deferred.flush(self.device.as_ref()) {
                tracing::warn!("Failed to free resource after shutdown: {e}");
            }
        }
    }

    pub fn destroy_image_view(&self, view: vk::ImageView) {
        self.device.destroy_image_view(view);
    }

    pub fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.device.destroy_sampler(sampler);
    }

    pub fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.device.destroy_descriptor_set_layout(layout);
    }

    pub fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.device.destroy_pipeline_layout(layout);
    }

    pub fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.device.destroy_pipeline(pipeline);
    }

    pub fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.device.destroy_descriptor_pool(pool);
    }

    /// Wait for the render thread and the GPU to finish every submitted frame.
    pub fn wait_idle(&mut self) -> Result<()> {
        let recorded = self.thread.wait_all();
        self.device.wait_idle()?;
        recorded
    }

    /// Stop the render thread and release everything the system owns.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let stopped = self.thread.stop();
        self.device.wait_idle()?;
        self.deferred.flush(self.device.as_ref())?;
        destroy_slots(self.device.as_ref(), std::mem::take(&mut self.slots));
        if self.config.save_pipeline_cache {
            if let Err(e) = self.device.save_pipeline_cache() {
                tracing::warn!("Failed to save pipeline cache: {e}");
            }
        }

        tracing::info!(frames = self.frame_number, "Render system shut down");
        stopped
    }
}

impl Drop for RenderSystem {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Render system shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seaglass_gpu::{DescriptorData, RecordedCommand, RecordingDevice, ResourceKind};
    use std::time::Duration;

    fn render_system(temp_size: u64) -> (Arc<RecordingDevice>, RenderSystem) {
        let device = Arc::new(RecordingDevice::new());
        let config = RenderConfig::new()
            .with_temp_buffer_size(temp_size)
            .with_render_thread_name("test-render");
        let render = RenderSystem::new(device.clone(), config).unwrap();
        (device, render)
    }

    fn image_info(width: u32, height: u32) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .usage(vk::ImageUsageFlags::SAMPLED)
    }

    #[test]
    fn temp_data_is_recorded_before_slot_reuse() {
        let (device, mut render) = render_system(1024);
        device.set_submit_delay(Some(Duration::from_millis(2)));

        let host_buffers: Vec<_> = render.slots.iter().map(|s| s.tmp_host.buffer).collect();
        let frames = 3 * FRAME_STATE_COUNT + 1;
        for tick in 0..frames {
            render.begin_frame().unwrap();
            let offset = render.copy_to_temp_buffer(&[tick as u8; 16], 16).unwrap();
            assert_eq!(offset, 0);
            render.submit_frame().unwrap();
        }
        render.wait_idle().unwrap();

        let recorded: Vec<Vec<u8>> = device
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::CopyBuffer { src, data, .. } if host_buffers.contains(&src) => {
                    Some(data)
                }
                _ => None,
            })
            .collect();
        assert_eq!(recorded.len(), frames);
        for (tick, data) in recorded.iter().enumerate() {
            assert_eq!(data, &vec![tick as u8; 16], "frame {tick} saw another frame's data");
        }
    }

    #[test]
    fn temp_allocations_do_not_overlap() {
        let (_device, mut render) = render_system(4096);
        render.begin_frame().unwrap();

        let sizes = [(13u64, 1u64), (64, 16), (7, 4), (100, 256), (1, 8)];
        let mut ranges = Vec::new();
        for (size, align) in sizes {
            let offset = render
                .copy_to_temp_buffer(&vec![0xAB; size as usize], align)
                .unwrap();
            assert_eq!(offset % align, 0);
            ranges.push(offset..offset + size);
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
            }
        }

        let err = render.copy_to_temp_buffer(&[0; 4096], 1).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Core(seaglass_core::Error::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn slots_rotate_and_enforce_frame_order() {
        let (_device, mut render) = render_system(256);
        assert!(render.submit_frame().is_err());

        for expected in [0, 1, 2, 0, 1] {
            assert_eq!(render.frame_idx(), expected);
            render.begin_frame().unwrap();
            assert_eq!(render.slot_state(expected), Some(SlotState::Accumulating));
            assert!(render.begin_frame().is_err());
            render.submit_frame().unwrap();
            assert_eq!(render.slot_state(expected), Some(SlotState::Flushing));
        }
        assert_eq!(render.frame_number(), 5);
        assert_eq!(render.slot_state(FRAME_STATE_COUNT), None);
    }

    #[test]
    fn flushing_slot_rejects_writes_until_begun() {
        let (_device, mut render) = render_system(256);
        for _ in 0..FRAME_STATE_COUNT {
            render.begin_frame().unwrap();
            render.submit_frame().unwrap();
        }

        assert!(matches!(
            render.copy_to_temp_buffer(&[1, 2, 3], 1),
            Err(RenderError::InvalidState(_))
        ));
        render.begin_frame().unwrap();
        assert_eq!(render.copy_to_temp_buffer(&[1, 2, 3], 1).unwrap(), 0);
    }

    #[test]
    fn staged_buffer_copies_on_submit() {
        let (device, mut render) = render_system(256);
        render.begin_frame().unwrap();
        let staged = render
            .create_gpu_buffer_with_data(vk::BufferUsageFlags::VERTEX_BUFFER, &[1, 2, 3, 4], "verts")
            .unwrap();
        render.update_gpu_buffer(&staged, 2, &[9, 9]).unwrap();
        render.submit_frame().unwrap();
        render.wait_idle().unwrap();

        let host = staged.host.as_ref().unwrap().buffer;
        let copies: Vec<_> = device
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::CopyBuffer { src, dst, data, .. } if src == host => {
                    assert_eq!(dst, staged.buffer.buffer);
                    Some(data)
                }
                _ => None,
            })
            .collect();
        // Both copies read the staging buffer when the frame records
        assert_eq!(copies, vec![vec![1, 2, 9, 9], vec![9, 9]]);
        assert!(render.update_gpu_buffer(&staged, 3, &[0, 0]).is_err());
    }

    #[test]
    fn small_images_use_temp_buffer() {
        let (device, mut render) = render_system(1024);
        render.begin_frame().unwrap();
        let image = render
            .create_gpu_image_with_data(&image_info(4, 4), &[7; 64], &[], "small")
            .unwrap();
        assert!(image.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
        let temp = render.get_host_temp_buffer();
        render.submit_frame().unwrap();
        render.wait_idle().unwrap();

        assert!(device.commands().iter().any(|c| matches!(
            c,
            RecordedCommand::CopyBufferToImage { src, dst, .. } if *src == temp && *dst == image.image
        )));
        // Only the six temp buffers exist
        assert_eq!(device.live(ResourceKind::Buffer), 2 * FRAME_STATE_COUNT as u32);
    }

    #[test]
    fn oversized_images_use_deferred_staging() {
        let (device, mut render) = render_system(256);
        render.begin_frame().unwrap();
        let image = render
            .create_gpu_image_with_data(&image_info(16, 16), &[3; 1024], &[], "large")
            .unwrap();
        assert_eq!(render.pending_deletions(), 1);
        assert_eq!(device.live(ResourceKind::Buffer), 2 * FRAME_STATE_COUNT as u32 + 1);
        render.submit_frame().unwrap();

        for _ in 0..=FRAME_STATE_COUNT {
            render.begin_frame().unwrap();
            render.submit_frame().unwrap();
        }
        assert_eq!(render.pending_deletions(), 0);
        assert_eq!(device.live(ResourceKind::Buffer), 2 * FRAME_STATE_COUNT as u32);
        render.free_gpu_image(image).unwrap();
    }

    #[test]
    fn queued_descriptor_writes_apply_before_recording() {
        let (device, mut render) = render_system(256);
        let buffer = render
            .alloc_gpu_buffer(64, vk::BufferUsageFlags::STORAGE_BUFFER, "storage")
            .unwrap();
        let set = vk::DescriptorSet::null();
        let data = DescriptorData::storage_buffer(buffer.buffer, 0, 64);

        render.begin_frame().unwrap();
        render
            .queue_descriptor_writes(&[DescriptorWrite {
                set,
                binding: 0,
                array_element: 3,
                data,
            }])
            .unwrap();
        assert_eq!(device.descriptor(set, 0, 3), None);
        render.submit_frame().unwrap();
        render.wait_idle().unwrap();

        assert_eq!(device.descriptor(set, 0, 3), Some(data));
        let commands = device.commands();
        let begin = commands
            .iter()
            .position(|c| *c == RecordedCommand::BeginFrame { slot: 0 })
            .unwrap();
        assert!(matches!(
            commands[begin + 1],
            RecordedCommand::UpdateDescriptors { .. }
        ));
        render.free_gpu_buffer(buffer).unwrap();
    }

    #[test]
    fn shutdown_releases_slots_and_saves_cache() {
        let (device, mut render) = render_system(256);
        render.begin_frame().unwrap();
        let buffer = render
            .alloc_gpu_buffer(16, vk::BufferUsageFlags::UNIFORM_BUFFER, "ubo")
            .unwrap();
        render.free_gpu_buffer_deferred(buffer);
        render.submit_frame().unwrap();

        render.shutdown().unwrap();
        assert_eq!(device.live(ResourceKind::Buffer), 0);
        assert_eq!(device.pipeline_cache_saves(), 1);

        render.shutdown().unwrap();
        assert_eq!(device.pipeline_cache_saves(), 1);
    }

    #[test]
    fn deferred_latency_below_frames_in_flight_is_rejected() {
        let device = Arc::new(RecordingDevice::new());
        let config = RenderConfig::new()
            .with_temp_buffer_size(256)
            .with_deferred_free_latency(FRAME_STATE_COUNT - 1);
        assert!(matches!(
            RenderSystem::new(device.clone(), config),
            Err(RenderError::InvalidConfig(_))
        ));
        assert_eq!(device.created(ResourceKind::Buffer), 0);
    }

    #[test]
    fn deferred_free_outlives_the_frame_in_flight() {
        let (device, mut render) = render_system(256);
        device.set_submit_delay(Some(Duration::from_millis(50)));
        render.begin_frame().unwrap();
        let buffer = render
            .alloc_gpu_buffer(16, vk::BufferUsageFlags::UNIFORM_BUFFER, "ubo")
            .unwrap();
        let live = device.live(ResourceKind::Buffer);
        render.free_gpu_buffer_deferred(buffer);
        render.submit_frame().unwrap();

        for _ in 1..=FRAME_STATE_COUNT {
            render.begin_frame().unwrap();
            assert_eq!(device.live(ResourceKind::Buffer), live);
            render.submit_frame().unwrap();
        }
        render.begin_frame().unwrap();
        assert_eq!(device.live(ResourceKind::Buffer), live - 1);
        render.submit_frame().unwrap();
        render.wait_idle().unwrap();
    }

    #[test]
    fn calls_after_shutdown_fail_without_panicking() {
        let (device, mut render) = render_system(256);
        render.shutdown().unwrap();
        assert!(render.is_shut_down());

        assert!(matches!(render.begin_frame(), Err(RenderError::InvalidState(_))));
        assert!(matches!(render.submit_frame(), Err(RenderError::InvalidState(_))));
        assert!(render.copy_to_temp_buffer(&[1, 2, 3, 4], 4).is_err());
        assert_eq!(render.temp_buffer_used(), 0);
        assert_eq!(render.get_gpu_temp_buffer(), vk::Buffer::null());
        assert_eq!(render.get_host_temp_buffer(), vk::Buffer::null());

        let buffer = render
            .alloc_gpu_buffer(16, vk::BufferUsageFlags::UNIFORM_BUFFER, "late")
            .unwrap();
        render.free_gpu_buffer_deferred(buffer);
        assert_eq!(render.pending_deletions(), 0);
        assert_eq!(device.live(ResourceKind::Buffer), 0);
    }

    #[test]
    fn failed_allocation_is_reported() {
        let (device, render) = render_system(256);
        device.fail_next_allocation();
        assert!(matches!(
            render.alloc_gpu_buffer(16, vk::BufferUsageFlags::UNIFORM_BUFFER, "doomed"),
            Err(RenderError::Gpu(_))
        ));
    }
}
