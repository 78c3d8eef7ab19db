//! Headless device that records instead of executing.
//!
//! Handles are unique fake values, host-visible buffers are backed by byte
//! vectors and every encoded command is appended to a log. Buffer copies
//! capture the source bytes at record time, which is when a real GPU could
//! first observe them.

use crate::descriptors::{
    DescriptorBufferProperties, DescriptorData, DescriptorPoolDesc, DescriptorSetLayoutDesc,
    DescriptorWrite,
};
use crate::device::{CommandEncoder, FrameCommands, GpuDevice, ImageBarrier, RenderingDesc};
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, GpuImage};
use crate::pipeline::GraphicsPipelineConfig;
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Kinds of objects the device tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    DescriptorPool,
}

/// One logged call.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginFrame {
        slot: usize,
    },
    SubmitFrame {
        slot: usize,
    },
    UpdateDescriptors {
        writes: Vec<DescriptorWrite>,
    },
    ImageBarrier {
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    MemoryBarrier {
        cmd: vk::CommandBuffer,
    },
    CopyBuffer {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        /// `(src_offset, dst_offset, size)` per region.
        regions: Vec<(u64, u64, u64)>,
        /// Source bytes of every region, concatenated.
        data: Vec<u8>,
    },
    CopyBufferToImage {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        buffer_offsets: Vec<u64>,
    },
    BeginRendering {
        cmd: vk::CommandBuffer,
        colors: Vec<vk::ImageView>,
        depth: Option<vk::ImageView>,
        extent: (u32, u32),
        layer_count: u32,
    },
    EndRendering {
        cmd: vk::CommandBuffer,
    },
    BindPipeline {
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    BindDescriptorBuffers {
        cmd: vk::CommandBuffer,
        addresses: Vec<vk::DeviceAddress>,
    },
    SetDescriptorBufferOffsets {
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        buffer_indices: Vec<u32>,
        offsets: Vec<u64>,
    },
    BindVertexBuffers {
        cmd: vk::CommandBuffer,
        buffers: Vec<vk::Buffer>,
    },
    BindIndexBuffer {
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
    },
    PushConstants {
        cmd: vk::CommandBuffer,
        data: Vec<u8>,
    },
    SetViewport {
        cmd: vk::CommandBuffer,
        width: f32,
        height: f32,
    },
    SetScissor {
        cmd: vk::CommandBuffer,
        extent: (u32, u32),
    },
    Draw {
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
    },
    DrawIndexedIndirect {
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        draw_count: u32,
    },
    Dispatch {
        cmd: vk::CommandBuffer,
        groups: [u32; 3],
    },
    BeginLabel {
        cmd: vk::CommandBuffer,
        name: String,
    },
    EndLabel {
        cmd: vk::CommandBuffer,
    },
}

/// Descriptor sizes the recording device reports. Every descriptor it encodes
/// starts with its type, followed by the handles or address it refers to.
pub const RECORDED_DESCRIPTOR_PROPERTIES: DescriptorBufferProperties = DescriptorBufferProperties {
    offset_alignment: 64,
    sampler_size: 16,
    combined_image_sampler_size: 32,
    sampled_image_size: 32,
    storage_image_size: 32,
    uniform_texel_buffer_size: 16,
    storage_texel_buffer_size: 16,
    uniform_buffer_size: 32,
    storage_buffer_size: 32,
};

const ADDRESS_BASE: vk::DeviceAddress = 0x1_0000_0000;

struct PoolRecord {
    max_sets: u32,
    sets: Vec<vk::DescriptorSet>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    names: HashMap<u64, String>,
    kinds: HashMap<u64, ResourceKind>,
    /// Contents of host-visible buffers. Device-local buffers have no entry.
    host_memory: HashMap<u64, Vec<u8>>,
    pools: HashMap<u64, PoolRecord>,
    set_pool: HashMap<u64, u64>,
    layouts: HashMap<u64, DescriptorSetLayoutDesc>,
    /// Device addresses of `SHADER_DEVICE_ADDRESS` buffers.
    addresses: HashMap<u64, vk::DeviceAddress>,
    next_address: vk::DeviceAddress,
    descriptor_buffers_disabled: bool,
    descriptors: HashMap<(u64, u32, u32), DescriptorData>,
    created: HashMap<ResourceKind, u32>,
    destroyed: HashMap<ResourceKind, u32>,
    commands: Vec<RecordedCommand>,
    fail_next_allocation: bool,
    /// Image views created before the next one fails.
    views_until_failure: Option<u32>,
    pipeline_cache_saves: u32,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        0x1000 + self.next_handle
    }

    fn create(&mut self, kind: ResourceKind, name: &str) -> u64 {
        let raw = self.handle();
        self.names.insert(raw, name.to_string());
        self.kinds.insert(raw, kind);
        *self.created.entry(kind).or_default() += 1;
        raw
    }

    fn destroy(&mut self, kind: ResourceKind, raw: u64) -> Result<()> {
        match self.kinds.get(&raw) {
            Some(k) if *k == kind => {}
            Some(k) => {
                return Err(GpuError::InvalidState(format!(
                    "Destroying {k:?} {raw:#x} as {kind:?}"
                )))
            }
            None => {
                return Err(GpuError::ResourceNotFound(format!(
                    "{kind:?} {raw:#x} is not live"
                )))
            }
        }
        self.kinds.remove(&raw);
        self.names.remove(&raw);
        self.host_memory.remove(&raw);
        self.layouts.remove(&raw);
        self.addresses.remove(&raw);
        *self.destroyed.entry(kind).or_default() += 1;
        Ok(())
    }

    fn take_failure(&mut self, what: &str) -> Result<()> {
        if std::mem::take(&mut self.fail_next_allocation) {
            return Err(GpuError::AllocationFailed(format!("{what}: injected failure")));
        }
        Ok(())
    }

    fn read(&self, buffer: vk::Buffer, offset: u64, size: u64) -> Vec<u8> {
        self.host_memory
            .get(&buffer.as_raw())
            .and_then(|bytes| {
                let start = usize::try_from(offset).ok()?;
                let end = start.checked_add(usize::try_from(size).ok()?)?;
                bytes.get(start..end).map(<[u8]>::to_vec)
            })
            .unwrap_or_default()
    }

    fn write(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) {
        if let Some(bytes) = self.host_memory.get_mut(&buffer.as_raw()) {
            let start = offset as usize;
            if let Some(dst) = bytes.get_mut(start..start + data.len()) {
                dst.copy_from_slice(data);
            }
        }
    }
}

/// Headless [`GpuDevice`] for tests and tooling.
pub struct RecordingDevice {
    state: Mutex<State>,
    submit_delay: Mutex<Option<Duration>>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            submit_delay: Mutex::new(None),
        }
    }

    /// Make the next buffer or image creation fail.
    pub fn fail_next_allocation(&self) {
        self.state.lock().fail_next_allocation = true;
    }

    /// Let `count` more image views succeed, then fail the next one.
    pub fn fail_image_view_after(&self, count: u32) {
        self.state.lock().views_until_failure = Some(count);
    }

    /// Report no descriptor buffer support from now on.
    pub fn disable_descriptor_buffers(&self) {
        self.state.lock().descriptor_buffers_disabled = true;
    }

    /// Sleep inside every `submit_frame`, simulating a slow GPU.
    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        *self.submit_delay.lock() = delay;
    }

    /// Snapshot of the command log.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    /// Drain the command log.
    pub fn take_commands(&self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.state.lock().commands)
    }

    /// Objects of `kind` created so far.
    pub fn created(&self, kind: ResourceKind) -> u32 {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    /// Objects of `kind` destroyed so far.
    pub fn destroyed(&self, kind: ResourceKind) -> u32 {
        self.state.lock().destroyed.get(&kind).copied().unwrap_or(0)
    }

    /// Objects of `kind` currently alive.
    pub fn live(&self, kind: ResourceKind) -> u32 {
        self.created(kind) - self.destroyed(kind)
    }

    /// Debug name an object was created with.
    pub fn name_of<H: Handle>(&self, handle: H) -> Option<String> {
        self.state.lock().names.get(&handle.as_raw()).cloned()
    }

    /// Current contents of a host-visible buffer.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().host_memory.get(&buffer.as_raw()).cloned()
    }

    /// Descriptor last written to `(set, binding, element)`.
    pub fn descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        element: u32,
    ) -> Option<DescriptorData> {
        self.state
            .lock()
            .descriptors
            .get(&(set.as_raw(), binding, element))
            .copied()
    }

    /// Sets currently allocated from `pool`.
    pub fn pool_sets(&self, pool: vk::DescriptorPool) -> usize {
        self.state
            .lock()
            .pools
            .get(&pool.as_raw())
            .map_or(0, |p| p.sets.len())
    }

    pub fn pipeline_cache_saves(&self) -> u32 {
        self.state.lock().pipeline_cache_saves
    }

    fn record(&self, command: RecordedCommand) {
        self.state.lock().commands.push(command);
    }

    fn frame_commands(slot: usize) -> FrameCommands {
        let base = 0xC000 + 2 * slot as u64;
        FrameCommands {
            upload: vk::CommandBuffer::from_raw(base),
            graphics: vk::CommandBuffer::from_raw(base + 1),
        }
    }
}

impl CommandEncoder for RecordingDevice {
    fn cmd_image_barriers(&self, cmd: vk::CommandBuffer, barriers: &[ImageBarrier]) {
        let mut state = self.state.lock();
        for b in barriers {
            state.commands.push(RecordedCommand::ImageBarrier {
                cmd,
                image: b.image,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
            });
        }
    }

    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        _src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        _dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    ) {
        self.record(RecordedCommand::MemoryBarrier { cmd });
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock();
        let mut data = Vec::new();
        for r in regions {
            data.extend(state.read(src, r.src_offset, r.size));
        }
        // Host-visible destinations observe the copy so readback works
        let mut cursor = 0usize;
        for r in regions {
            let len = r.size as usize;
            if let Some(chunk) = data.get(cursor..cursor + len) {
                let chunk = chunk.to_vec();
                state.write(dst, r.dst_offset, &chunk);
            }
            cursor += len;
        }
        state.commands.push(RecordedCommand::CopyBuffer {
            cmd,
            src,
            dst,
            regions: regions
                .iter()
                .map(|r| (r.src_offset, r.dst_offset, r.size))
                .collect(),
            data,
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(RecordedCommand::CopyBufferToImage {
            cmd,
            src,
            dst,
            layout,
            buffer_offsets: regions.iter().map(|r| r.buffer_offset).collect(),
        });
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc) {
        self.record(RecordedCommand::BeginRendering {
            cmd,
            colors: desc.colors.iter().map(|c| c.view).collect(),
            depth: desc.depth.map(|d| d.view),
            extent: (desc.area.extent.width, desc.area.extent.height),
            layer_count: desc.layer_count,
        });
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        self.record(RecordedCommand::EndRendering { cmd });
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(RecordedCommand::BindPipeline {
            cmd,
            bind_point,
            pipeline,
        });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) {
        self.record(RecordedCommand::BindDescriptorSets {
            cmd,
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn cmd_bind_descriptor_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[(vk::DeviceAddress, vk::BufferUsageFlags)],
    ) {
        self.record(RecordedCommand::BindDescriptorBuffers {
            cmd,
            addresses: buffers.iter().map(|&(address, _)| address).collect(),
        });
    }

    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        buffer_indices: &[u32],
        offsets: &[u64],
    ) {
        self.record(RecordedCommand::SetDescriptorBufferOffsets {
            cmd,
            layout,
            first_set,
            buffer_indices: buffer_indices.to_vec(),
            offsets: offsets.to_vec(),
        });
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        _first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[u64],
    ) {
        self.record(RecordedCommand::BindVertexBuffers {
            cmd,
            buffers: buffers.to_vec(),
        });
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        _index_type: vk::IndexType,
    ) {
        self.record(RecordedCommand::BindIndexBuffer {
            cmd,
            buffer,
            offset,
        });
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        data: &[u8],
    ) {
        self.record(RecordedCommand::PushConstants {
            cmd,
            data: data.to_vec(),
        });
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.record(RecordedCommand::SetViewport {
            cmd,
            width: viewport.width,
            height: viewport.height,
        });
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.record(RecordedCommand::SetScissor {
            cmd,
            extent: (scissor.extent.width, scissor.extent.height),
        });
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(RecordedCommand::Draw {
            cmd,
            vertex_count,
            instance_count,
        });
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(RecordedCommand::DrawIndexed {
            cmd,
            index_count,
            instance_count,
            first_index,
        });
    }

    fn cmd_draw_indexed_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: u64,
        draw_count: u32,
        _stride: u32,
    ) {
        self.record(RecordedCommand::DrawIndexedIndirect {
            cmd,
            buffer,
            draw_count,
        });
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(RecordedCommand::Dispatch {
            cmd,
            groups: [x, y, z],
        });
    }

    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str) {
        self.record(RecordedCommand::BeginLabel {
            cmd,
            name: name.to_string(),
        });
    }

    fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        self.record(RecordedCommand::EndLabel { cmd });
    }
}

impl GpuDevice for RecordingDevice {
    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let mut state = self.state.lock();
        state.take_failure(name)?;
        let raw = state.create(ResourceKind::Buffer, name);
        let host_visible = matches!(location, MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu);
        if host_visible {
            let len = usize::try_from(size)
                .map_err(|_| GpuError::AllocationFailed(format!("{name}: size {size}")))?;
            state.host_memory.insert(raw, vec![0; len]);
        }
        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let address = ADDRESS_BASE + state.next_address;
            state.next_address += size.next_multiple_of(256).max(256);
            state.addresses.insert(raw, address);
        }
        Ok(GpuBuffer::unbacked(
            vk::Buffer::from_raw(raw),
            size,
            usage,
            host_visible,
        ))
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) -> Result<()> {
        self.state
            .lock()
            .destroy(ResourceKind::Buffer, buffer.buffer.as_raw())
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer.check_range(offset, data.len() as u64)?;
        let mut state = self.state.lock();
        let bytes = state
            .host_memory
            .get_mut(&buffer.buffer.as_raw())
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>, name: &str) -> Result<GpuImage> {
        let mut state = self.state.lock();
        state.take_failure(name)?;
        let raw = state.create(ResourceKind::Image, name);
        Ok(GpuImage::from_create_info(
            vk::Image::from_raw(raw),
            None,
            info,
        ))
    }

    fn destroy_image(&self, image: GpuImage) -> Result<()> {
        self.state
            .lock()
            .destroy(ResourceKind::Image, image.image.as_raw())
    }

    fn create_image_view(
        &self,
        _info: &vk::ImageViewCreateInfo<'_>,
        name: &str,
    ) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        match state.views_until_failure {
            Some(0) => {
                state.views_until_failure = None;
                return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            Some(n) => state.views_until_failure = Some(n - 1),
            None => {}
        }
        let raw = state.create(ResourceKind::ImageView, name);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if let Err(e) = self
            .state
            .lock()
            .destroy(ResourceKind::ImageView, view.as_raw())
        {
            tracing::warn!("{e}");
        }
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>, name: &str) -> Result<vk::Sampler> {
        let raw = self.state.lock().create(ResourceKind::Sampler, name);
        Ok(vk::Sampler::from_raw(raw))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        if let Err(e) = self
            .state
            .lock()
            .destroy(ResourceKind::Sampler, sampler.as_raw())
        {
            tracing::warn!("{e}");
        }
    }

    fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
        name: &str,
    ) -> Result<vk::DescriptorSetLayout> {
        if desc.bindings.is_empty() {
            return Err(GpuError::InvalidState(format!("{name}: layout has no bindings")));
        }
        let mut state = self.state.lock();
        let raw = state.create(ResourceKind::DescriptorSetLayout, name);
        state.layouts.insert(raw, desc.clone());
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        if let Err(e) = self
            .state
            .lock()
            .destroy(ResourceKind::DescriptorSetLayout, layout.as_raw())
        {
            tracing::warn!("{e}");
        }
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
        name: &str,
    ) -> Result<vk::PipelineLayout> {
        let raw = self.state.lock().create(ResourceKind::PipelineLayout, name);
        Ok(vk::PipelineLayout::from_raw(raw))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        if let Err(e) = self
            .state
            .lock()
            .destroy(ResourceKind::PipelineLayout, layout.as_raw())
        {
            tracing::warn!("{e}");
        }
    }

    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        name: &str,
    ) -> Result<vk::Pipeline> {
        config.validate()?;
        let raw = self.state.lock().create(ResourceKind::Pipeline, name);
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn create_compute_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        spirv: &[u32],
        _entry_point: &str,
        name: &str,
    ) -> Result<vk::Pipeline> {
        if spirv.is_empty() {
            return Err(GpuError::ShaderCompilation(format!(
                "{name}: compute shader is empty"
            )));
        }
        let raw = self.state.lock().create(ResourceKind::Pipeline, name);
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        if let Err(e) = self
            .state
            .lock()
            .destroy(ResourceKind::Pipeline, pipeline.as_raw())
        {
            tracing::warn!("{e}");
        }
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
        name: &str,
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let raw = state.create(ResourceKind::DescriptorPool, name);
        state.pools.insert(
            raw,
            PoolRecord {
                max_sets: desc.max_sets,
                sets: Vec::new(),
            },
        );
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        let mut state = self.state.lock();
        let sets = state
            .pools
            .get_mut(&pool.as_raw())
            .map(|p| std::mem::take(&mut p.sets))
            .ok_or_else(|| GpuError::ResourceNotFound(format!("Descriptor pool {pool:?}")))?;
        for set in sets {
            state.set_pool.remove(&set.as_raw());
            state.descriptors.retain(|(s, _, _), _| *s != set.as_raw());
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if let Err(e) = self.reset_descriptor_pool(pool) {
            tracing::warn!("{e}");
            return;
        }
        let mut state = self.state.lock();
        state.pools.remove(&pool.as_raw());
        if let Err(e) = state.destroy(ResourceKind::DescriptorPool, pool.as_raw()) {
            tracing::warn!("{e}");
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: Option<&[u32]>,
    ) -> Result<Vec<vk::DescriptorSet>> {
        if variable_counts.is_some_and(|counts| counts.len() != layouts.len()) {
            return Err(GpuError::InvalidState(
                "Variable descriptor counts do not match layouts".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let record = state
            .pools
            .get(&pool.as_raw())
            .ok_or_else(|| GpuError::ResourceNotFound(format!("Descriptor pool {pool:?}")))?;
        if record.sets.len() + layouts.len() > record.max_sets as usize {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }

        let sets: Vec<_> = layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(state.handle()))
            .collect();
        for set in &sets {
            state.set_pool.insert(set.as_raw(), pool.as_raw());
        }
        if let Some(record) = state.pools.get_mut(&pool.as_raw()) {
            record.sets.extend_from_slice(&sets);
        }
        Ok(sets)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        for w in writes {
            state
                .descriptors
                .insert((w.set.as_raw(), w.binding, w.array_element), w.data);
        }
        state.commands.push(RecordedCommand::UpdateDescriptors {
            writes: writes.to_vec(),
        });
    }

    fn descriptor_buffer_properties(&self) -> Option<DescriptorBufferProperties> {
        (!self.state.lock().descriptor_buffers_disabled).then_some(RECORDED_DESCRIPTOR_PROPERTIES)
    }

    fn descriptor_binding_offset(
        &self,
        layout: vk::DescriptorSetLayout,
        binding: u32,
    ) -> Result<u64> {
        let props = self
            .descriptor_buffer_properties()
            .ok_or_else(|| GpuError::InvalidState("Descriptor buffers are not enabled".to_string()))?;
        let state = self.state.lock();
        let desc = state
            .layouts
            .get(&layout.as_raw())
            .ok_or_else(|| GpuError::ResourceNotFound(format!("Layout {:#x}", layout.as_raw())))?;
        if !desc
            .flags
            .contains(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
        {
            return Err(GpuError::InvalidState(format!(
                "Layout {:#x} was not created for descriptor buffers",
                layout.as_raw()
            )));
        }
        if !desc.bindings.iter().any(|b| b.binding == binding) {
            return Err(GpuError::ResourceNotFound(format!(
                "Binding {binding} of layout {:#x}",
                layout.as_raw()
            )));
        }
        // Bindings are packed in binding order
        Ok(desc
            .bindings
            .iter()
            .filter(|b| b.binding < binding)
            .map(|b| props.descriptor_size(b.ty).unwrap_or(0) * u64::from(b.count))
            .sum())
    }

    fn get_descriptor(&self, data: &DescriptorData, out: &mut [u8]) -> Result<()> {
        let ty = data.descriptor_type();
        let size = self
            .descriptor_buffer_properties()
            .and_then(|props| props.descriptor_size(ty))
            .ok_or_else(|| GpuError::InvalidState(format!("{ty:?} cannot live in a descriptor buffer")))?;
        if out.len() as u64 != size {
            return Err(GpuError::InvalidState(format!(
                "{ty:?} descriptors are {size} bytes, got a {} byte slot",
                out.len()
            )));
        }

        let mut fields: Vec<u8> = ty.as_raw().to_le_bytes().to_vec();
        fields.extend_from_slice(&[0; 4]);
        match *data {
            DescriptorData::Image {
                sampler,
                view,
                layout,
                ..
            } => {
                if ty == vk::DescriptorType::SAMPLER {
                    fields.extend_from_slice(&sampler.as_raw().to_le_bytes());
                } else {
                    fields.extend_from_slice(&view.as_raw().to_le_bytes());
                    fields.extend_from_slice(&sampler.as_raw().to_le_bytes());
                    fields.extend_from_slice(&layout.as_raw().to_le_bytes());
                }
            }
            DescriptorData::Buffer {
                buffer,
                offset,
                range,
                ..
            } => {
                let address = self
                    .state
                    .lock()
                    .addresses
                    .get(&buffer.as_raw())
                    .copied()
                    .ok_or_else(|| {
                        GpuError::InvalidState(format!(
                            "Buffer {:#x} has no device address",
                            buffer.as_raw()
                        ))
                    })?;
                fields.extend_from_slice(&(address + offset).to_le_bytes());
                fields.extend_from_slice(&range.to_le_bytes());
            }
            DescriptorData::TexelBuffer { .. } => {
                return Err(GpuError::InvalidState(format!(
                    "{ty:?} descriptors cannot be written to a descriptor buffer"
                )))
            }
        }

        out.fill(0);
        let len = fields.len().min(out.len());
        out[..len].copy_from_slice(&fields[..len]);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: &GpuBuffer) -> Result<vk::DeviceAddress> {
        self.state
            .lock()
            .addresses
            .get(&buffer.buffer.as_raw())
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidState("Buffer was not created with SHADER_DEVICE_ADDRESS".to_string())
            })
    }

    fn begin_frame(&self, slot: usize) -> Result<FrameCommands> {
        self.record(RecordedCommand::BeginFrame { slot });
        Ok(Self::frame_commands(slot))
    }

    fn submit_frame(&self, slot: usize, cmds: FrameCommands) -> Result<()> {
        if cmds != Self::frame_commands(slot) {
            return Err(GpuError::InvalidState(format!(
                "Command buffers do not belong to slot {slot}"
            )));
        }
        let delay = *self.submit_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.record(RecordedCommand::SubmitFrame { slot });
        Ok(())
    }

    fn wait_frame(&self, _slot: usize) -> Result<()> {
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }

    fn as_encoder(&self) -> &dyn CommandEncoder {
        self
    }

    fn save_pipeline_cache(&self) -> Result<()> {
        self.state.lock().pipeline_cache_saves += 1;
        Ok(())
    }
}
