//! [`GpuDevice`] implementation on ash and gpu-allocator.

use crate::command::{end_command_buffer, submit_command_buffers, FrameCommandPool};
use crate::context::GpuContext;
use crate::descriptors::{
    apply_writes, DescriptorBufferProperties, DescriptorData, DescriptorPoolDesc,
    DescriptorSetLayoutDesc, DescriptorWrite,
};
use crate::device::{CommandEncoder, FrameCommands, GpuDevice, ImageBarrier, RenderingDesc};
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, GpuImage};
use crate::pipeline::{self, GraphicsPipelineConfig};
use crate::pipeline_cache::{CacheIdentity, PipelineCache};
use crate::sync::FrameFence;
use ash::vk;
use gpu_allocator::MemoryLocation;

struct FrameResources {
    commands: FrameCommandPool,
    fence: FrameFence,
}

/// Vulkan device with one command pool and fence per frame slot.
pub struct VulkanDevice {
    context: GpuContext,
    frames: Vec<FrameResources>,
    pipeline_cache: PipelineCache,
    /// Present when the context enabled `VK_EXT_descriptor_buffer`.
    descriptor_buffer: Option<(ash::ext::descriptor_buffer::Device, DescriptorBufferProperties)>,
}

impl VulkanDevice {
    /// Create per-slot resources for `frames_in_flight` slots on `context`.
    pub fn new(context: GpuContext, frames_in_flight: usize) -> Result<Self> {
        let device = context.device();
        let identity = CacheIdentity::from_properties(context.properties());
        let pipeline_cache =
            unsafe { PipelineCache::new(device, identity, context.pipeline_cache_path())? };

        let mut frames = Vec::with_capacity(frames_in_flight);
        for slot in 0..frames_in_flight {
            let commands = unsafe { FrameCommandPool::new(device, context.queue_family())? };
            let fence = unsafe { FrameFence::new(device)? };
            let cmds = commands.commands();
            context.set_object_name(cmds.upload, &format!("frame{slot}_upload"));
            context.set_object_name(cmds.graphics, &format!("frame{slot}_graphics"));
            context.set_object_name(fence.handle(), &format!("frame{slot}_fence"));
            frames.push(FrameResources { commands, fence });
        }

        let descriptor_buffer = context.capabilities().descriptor_buffer.map(|props| {
            (
                ash::ext::descriptor_buffer::Device::new(context.instance(), device),
                props,
            )
        });

        tracing::info!(
            frames_in_flight,
            descriptor_buffer = descriptor_buffer.is_some(),
            "Vulkan device ready"
        );

        Ok(Self {
            context,
            frames,
            pipeline_cache,
            descriptor_buffer,
        })
    }

    pub const fn context(&self) -> &GpuContext {
        &self.context
    }

    fn device(&self) -> &ash::Device {
        self.context.device()
    }

    fn descriptor_buffer_ext(&self) -> Result<&ash::ext::descriptor_buffer::Device> {
        self.descriptor_buffer
            .as_ref()
            .map(|(ext, _)| ext)
            .ok_or_else(|| GpuError::InvalidState("Descriptor buffers are not enabled".to_string()))
    }

    fn address_of(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device().get_buffer_device_address(&info) }
    }

    fn frame(&self, slot: usize) -> Result<&FrameResources> {
        self.frames
            .get(slot)
            .ok_or(GpuError::FrameSlot {
                slot,
                count: self.frames.len(),
            })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            tracing::error!("Failed to idle device on drop: {e}");
        }
        let device = self.context.device();
        unsafe {
            for frame in &self.frames {
                frame.commands.destroy(device);
                frame.fence.destroy(device);
            }
            self.pipeline_cache.destroy(device);
        }
    }
}

impl CommandEncoder for VulkanDevice {
    fn cmd_image_barriers(&self, cmd: vk::CommandBuffer, barriers: &[ImageBarrier]) {
        if barriers.is_empty() {
            return;
        }
        let raw: Vec<_> = barriers.iter().map(ImageBarrier::to_vk).collect();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&raw);
        unsafe { self.device().cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    ) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src.0)
            .src_access_mask(src.1)
            .dst_stage_mask(dst.0)
            .dst_access_mask(dst.1);
        let dependency =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device().cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device().cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device()
                .cmd_copy_buffer_to_image(cmd, src, dst, layout, regions);
        }
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc) {
        let colors: Vec<_> = desc.colors.iter().map(|c| c.to_vk()).collect();
        let depth = desc.depth.map(|d| d.to_vk());
        let mut info = vk::RenderingInfo::default()
            .render_area(desc.area)
            .layer_count(desc.layer_count.max(1))
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
        }
        unsafe { self.device().cmd_begin_rendering(cmd, &info) };
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device().cmd_end_rendering(cmd) };
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device().cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
    }

    fn cmd_bind_descriptor_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[(vk::DeviceAddress, vk::BufferUsageFlags)],
    ) {
        let Ok(ext) = self.descriptor_buffer_ext() else {
            tracing::error!("Binding descriptor buffers without the extension");
            return;
        };
        let infos: Vec<_> = buffers
            .iter()
            .map(|&(address, usage)| {
                vk::DescriptorBufferBindingInfoEXT::default()
                    .address(address)
                    .usage(usage)
            })
            .collect();
        unsafe { ext.cmd_bind_descriptor_buffers(cmd, &infos) };
    }

    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        buffer_indices: &[u32],
        offsets: &[u64],
    ) {
        let Ok(ext) = self.descriptor_buffer_ext() else {
            tracing::error!("Setting descriptor buffer offsets without the extension");
            return;
        };
        unsafe {
            ext.cmd_set_descriptor_buffer_offsets(
                cmd,
                bind_point,
                layout,
                first_set,
                buffer_indices,
                offsets,
            );
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(cmd, first_binding, buffers, offsets);
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device()
                .cmd_bind_index_buffer(cmd, buffer, offset, index_type);
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device()
                .cmd_push_constants(cmd, layout, stages, offset, data);
        }
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe {
            self.device()
                .cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
        }
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe {
            self.device()
                .cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
        }
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device()
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device().cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn cmd_draw_indexed_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device()
                .cmd_draw_indexed_indirect(cmd, buffer, offset, draw_count, stride);
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device().cmd_dispatch(cmd, x, y, z) };
    }

    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str) {
        self.context.begin_label(cmd, name);
    }

    fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        self.context.end_label(cmd);
    }
}

impl GpuDevice for VulkanDevice {
    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer = self
            .context
            .allocator()
            .lock()
            .create_buffer(size, usage, location, name)?;
        self.context.set_object_name(buffer.buffer, name);
        tracing::debug!(name, size, ?location, "Created buffer");
        Ok(buffer)
    }

    fn destroy_buffer(&self, mut buffer: GpuBuffer) -> Result<()> {
        self.context.allocator().lock().free_buffer(&mut buffer)
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer.write_bytes(offset, data)
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>, name: &str) -> Result<GpuImage> {
        let image = self
            .context
            .allocator()
            .lock()
            .create_image(info, MemoryLocation::GpuOnly, name)?;
        self.context.set_object_name(image.image, name);
        tracing::debug!(
            name,
            width = info.extent.width,
            height = info.extent.height,
            format = ?info.format,
            "Created image"
        );
        Ok(image)
    }

    fn destroy_image(&self, mut image: GpuImage) -> Result<()> {
        self.context.allocator().lock().free_image(&mut image)
    }

    fn create_image_view(
        &self,
        info: &vk::ImageViewCreateInfo<'_>,
        name: &str,
    ) -> Result<vk::ImageView> {
        let view = unsafe { self.device().create_image_view(info, None)? };
        self.context.set_object_name(view, name);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device().destroy_image_view(view, None) };
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>, name: &str) -> Result<vk::Sampler> {
        let sampler = unsafe { self.device().create_sampler(info, None)? };
        self.context.set_object_name(sampler, name);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device().destroy_sampler(sampler, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
        name: &str,
    ) -> Result<vk::DescriptorSetLayout> {
        let layout = unsafe { desc.create(self.device())? };
        self.context.set_object_name(layout, name);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device().destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
        name: &str,
    ) -> Result<vk::PipelineLayout> {
        let layout =
            unsafe { pipeline::create_pipeline_layout(self.device(), set_layouts, push_constants)? };
        self.context.set_object_name(layout, name);
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device().destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        name: &str,
    ) -> Result<vk::Pipeline> {
        let pipeline = unsafe {
            pipeline::create_graphics_pipeline(self.device(), self.pipeline_cache.handle(), config)
        }
        .map_err(|e| {
            tracing::error!(name, "Failed to create graphics pipeline: {e}");
            e
        })?;
        self.context.set_object_name(pipeline, name);
        Ok(pipeline)
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        spirv: &[u32],
        entry_point: &str,
        name: &str,
    ) -> Result<vk::Pipeline> {
        let pipeline = unsafe {
            pipeline::create_compute_pipeline(
                self.device(),
                self.pipeline_cache.handle(),
                layout,
                spirv,
                entry_point,
            )
        }
        .map_err(|e| {
            tracing::error!(name, "Failed to create compute pipeline: {e}");
            e
        })?;
        self.context.set_object_name(pipeline, name);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device().destroy_pipeline(pipeline, None) };
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
        name: &str,
    ) -> Result<vk::DescriptorPool> {
        let pool = unsafe { desc.create(self.device())? };
        self.context.set_object_name(pool, name);
        tracing::debug!(name, max_sets = desc.max_sets, "Created descriptor pool");
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        unsafe {
            self.device()
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device().destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: Option<&[u32]>,
    ) -> Result<Vec<vk::DescriptorSet>> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default();
        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        if let Some(counts) = variable_counts {
            if counts.len() != layouts.len() {
                return Err(GpuError::InvalidState(
                    "Variable descriptor counts do not match layouts".to_string(),
                ));
            }
            variable_info = variable_info.descriptor_counts(counts);
            alloc_info = alloc_info.push_next(&mut variable_info);
        }
        let sets = unsafe { self.device().allocate_descriptor_sets(&alloc_info)? };
        Ok(sets)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        unsafe { apply_writes(self.device(), writes) };
    }

    fn descriptor_buffer_properties(&self) -> Option<DescriptorBufferProperties> {
        self.descriptor_buffer.as_ref().map(|(_, props)| *props)
    }

    fn descriptor_binding_offset(
        &self,
        layout: vk::DescriptorSetLayout,
        binding: u32,
    ) -> Result<u64> {
        let ext = self.descriptor_buffer_ext()?;
        Ok(unsafe { ext.get_descriptor_set_layout_binding_offset(layout, binding) })
    }

    fn get_descriptor(&self, data: &DescriptorData, out: &mut [u8]) -> Result<()> {
        let ext = self.descriptor_buffer_ext()?;
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

        match *data {
            DescriptorData::Image {
                ty,
                sampler,
                view,
                layout,
            } => {
                let image_info = vk::DescriptorImageInfo::default()
                    .sampler(sampler)
                    .image_view(view)
                    .image_layout(layout);
                let raw = match ty {
                    vk::DescriptorType::SAMPLER => vk::DescriptorDataEXT { p_sampler: &sampler },
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER => vk::DescriptorDataEXT {
                        p_combined_image_sampler: &image_info,
                    },
                    vk::DescriptorType::SAMPLED_IMAGE => vk::DescriptorDataEXT {
                        p_sampled_image: &image_info,
                    },
                    vk::DescriptorType::STORAGE_IMAGE => vk::DescriptorDataEXT {
                        p_storage_image: &image_info,
                    },
                    other => {
                        return Err(GpuError::InvalidState(format!(
                            "{other:?} is not an image descriptor"
                        )))
                    }
                };
                let info = vk::DescriptorGetInfoEXT::default().ty(ty).data(raw);
                unsafe { ext.get_descriptor(&info, out) };
            }
            DescriptorData::Buffer {
                ty,
                buffer,
                offset,
                range,
            } => {
                let address_info = vk::DescriptorAddressInfoEXT::default()
                    .address(self.address_of(buffer) + offset)
                    .range(range);
                let raw = match ty {
                    vk::DescriptorType::UNIFORM_BUFFER => vk::DescriptorDataEXT {
                        p_uniform_buffer: &address_info,
                    },
                    vk::DescriptorType::STORAGE_BUFFER => vk::DescriptorDataEXT {
                        p_storage_buffer: &address_info,
                    },
                    other => {
                        return Err(GpuError::InvalidState(format!(
                            "{other:?} is not a buffer descriptor"
                        )))
                    }
                };
                let info = vk::DescriptorGetInfoEXT::default().ty(ty).data(raw);
                unsafe { ext.get_descriptor(&info, out) };
            }
            // Texel buffers are addressed by range, not by view
            DescriptorData::TexelBuffer { ty, .. } => {
                return Err(GpuError::InvalidState(format!(
                    "{ty:?} descriptors cannot be written to a descriptor buffer"
                )))
            }
        }
        Ok(())
    }

    fn buffer_device_address(&self, buffer: &GpuBuffer) -> Result<vk::DeviceAddress> {
        if !buffer
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            return Err(GpuError::InvalidState(
                "Buffer was not created with SHADER_DEVICE_ADDRESS".to_string(),
            ));
        }
        Ok(self.address_of(buffer.buffer))
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn begin_frame(&self, slot: usize) -> Result<FrameCommands> {
        let frame = self.frame(slot)?;
        unsafe {
            frame.fence.wait(self.device())?;
            frame.commands.begin(self.device())
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn submit_frame(&self, slot: usize, cmds: FrameCommands) -> Result<()> {
        let frame = self.frame(slot)?;
        let device = self.device();
        unsafe {
            end_command_buffer(device, cmds.upload)?;
            end_command_buffer(device, cmds.graphics)?;

            let queue = self.context.queue().lock();
            frame.fence.reset(device)?;
            submit_command_buffers(
                device,
                *queue,
                &[cmds.upload, cmds.graphics],
                frame.fence.handle(),
            )
        }
    }

    fn wait_frame(&self, slot: usize) -> Result<()> {
        let frame = self.frame(slot)?;
        unsafe { frame.fence.wait(self.device()) }
    }

    fn wait_idle(&self) -> Result<()> {
        self.context.wait_idle()
    }

    fn as_encoder(&self) -> &dyn CommandEncoder {
        self
    }

    fn save_pipeline_cache(&self) -> Result<()> {
        unsafe { self.pipeline_cache.save(self.device()) }
    }
}
