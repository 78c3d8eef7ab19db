//! The device contract the renderer is written against.
//!
//! [`GpuDevice`] is everything the render system needs from the thread that owns the
//! Vulkan device: resource creation, descriptor management and frame pacing.
//! [`CommandEncoder`] is the recording half, handed to pass callbacks.

use crate::descriptors::{
    DescriptorBufferProperties, DescriptorData, DescriptorPoolDesc, DescriptorSetLayoutDesc,
    DescriptorWrite,
};
use crate::error::Result;
use crate::memory::{GpuBuffer, GpuImage};
use crate::pipeline::GraphicsPipelineConfig;
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Clear value for a rendering attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const BLACK: Self = Self::Color([0.0, 0.0, 0.0, 1.0]);
    pub const TRANSPARENT: Self = Self::Color([0.0; 4]);
    /// Reverse-Z far plane.
    pub const DEPTH_ZERO: Self = Self::DepthStencil {
        depth: 0.0,
        stencil: 0,
    };
    pub const DEPTH_ONE: Self = Self::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };

    pub const fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// One attachment of a dynamic rendering scope.
///
/// `clear: None` loads the previous contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderingAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub clear: Option<ClearValue>,
}

impl RenderingAttachment {
    pub fn to_vk(&self) -> vk::RenderingAttachmentInfo<'static> {
        let info = vk::RenderingAttachmentInfo::default()
            .image_view(self.view)
            .image_layout(self.layout)
            .store_op(vk::AttachmentStoreOp::STORE);
        match self.clear {
            Some(clear) => info
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .clear_value(clear.to_vk()),
            None => info.load_op(vk::AttachmentLoadOp::LOAD),
        }
    }
}

/// Parameters of `vkCmdBeginRendering`.
#[derive(Debug, Clone)]
pub struct RenderingDesc {
    pub area: vk::Rect2D,
    pub layer_count: u32,
    pub colors: Vec<RenderingAttachment>,
    pub depth: Option<RenderingAttachment>,
}

/// A synchronization2 image layout transition.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl ImageBarrier {
    /// Transition with stages and access masks derived from the two layouts.
    pub fn layout_transition(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        let (src_stage, src_access) = layout_usage(old_layout);
        let (dst_stage, dst_access) = layout_usage(new_layout);
        Self {
            image,
            range,
            old_layout,
            new_layout,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        }
    }

    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.range)
    }
}

/// Stages and accesses that touch an image while it sits in `layout`.
pub fn layout_usage(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        ),
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

/// Command buffers of one frame slot, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCommands {
    /// Buffer and image uploads.
    pub upload: vk::CommandBuffer,
    /// Render and compute passes.
    pub graphics: vk::CommandBuffer,
}

/// Command recording.
///
/// Every call appends to `cmd`, which must be in the recording state.
pub trait CommandEncoder {
    fn cmd_image_barriers(&self, cmd: vk::CommandBuffer, barriers: &[ImageBarrier]);

    /// Global memory dependency, used between uploads and their consumers.
    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    );

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc);

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );

    /// Bind descriptor buffers by device address. A buffer's position in
    /// `buffers` is the index later passed to
    /// [`cmd_set_descriptor_buffer_offsets`](Self::cmd_set_descriptor_buffer_offsets).
    fn cmd_bind_descriptor_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[(vk::DeviceAddress, vk::BufferUsageFlags)],
    );

    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        buffer_indices: &[u32],
        offsets: &[u64],
    );

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    );

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport);

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_draw_indexed_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    );

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);

    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str);

    fn cmd_end_label(&self, cmd: vk::CommandBuffer);
}

/// Resource creation and frame pacing for the thread that owns the device.
///
/// Every creation call takes a debug name that is attached to the object when
/// debug utils are available.
pub trait GpuDevice: CommandEncoder + Send + Sync {
    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer>;

    fn destroy_buffer(&self, buffer: GpuBuffer) -> Result<()>;

    /// Write into a host-visible buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()>;

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>, name: &str) -> Result<GpuImage>;

    fn destroy_image(&self, image: GpuImage) -> Result<()>;

    fn create_image_view(
        &self,
        info: &vk::ImageViewCreateInfo<'_>,
        name: &str,
    ) -> Result<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>, name: &str) -> Result<vk::Sampler>;

    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
        name: &str,
    ) -> Result<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
        name: &str,
    ) -> Result<vk::PipelineLayout>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        name: &str,
    ) -> Result<vk::Pipeline>;

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        spirv: &[u32],
        entry_point: &str,
        name: &str,
    ) -> Result<vk::Pipeline>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
        name: &str,
    ) -> Result<vk::DescriptorPool>;

    /// Return every set of `pool` to it.
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one set per layout. `variable_counts`, when given, holds the
    /// variable descriptor count of each set and must match `layouts` in length.
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: Option<&[u32]>,
    ) -> Result<Vec<vk::DescriptorSet>>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    /// Descriptor sizes when descriptor buffers are enabled on this device.
    fn descriptor_buffer_properties(&self) -> Option<DescriptorBufferProperties>;

    /// Byte offset of `binding` inside a set of a descriptor-buffer `layout`.
    fn descriptor_binding_offset(&self, layout: vk::DescriptorSetLayout, binding: u32)
        -> Result<u64>;

    /// Encode `data` into `out`, which must be exactly the descriptor size of
    /// its type. Buffer descriptors need `SHADER_DEVICE_ADDRESS` buffers.
    fn get_descriptor(&self, data: &DescriptorData, out: &mut [u8]) -> Result<()>;

    fn buffer_device_address(&self, buffer: &GpuBuffer) -> Result<vk::DeviceAddress>;

    /// Wait until the previous submission of `slot` retired, then begin its
    /// command buffers.
    fn begin_frame(&self, slot: usize) -> Result<FrameCommands>;

    /// End and submit the command buffers returned by [`Self::begin_frame`].
    fn submit_frame(&self, slot: usize, cmds: FrameCommands) -> Result<()>;

    /// Block until the last submission of `slot` has retired.
    fn wait_frame(&self, slot: usize) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;

    /// Persist the pipeline cache, if the device keeps one.
    fn save_pipeline_cache(&self) -> Result<()>;

    /// The recording half of this device.
    fn as_encoder(&self) -> &dyn CommandEncoder;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn color_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn upload_transition_masks() {
        let barrier = ImageBarrier::layout_transition(
            vk::Image::from_raw(7),
            color_range(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(barrier.src_access, vk::AccessFlags2::NONE);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(barrier.dst_access, vk::AccessFlags2::TRANSFER_WRITE);

        let raw = barrier.to_vk();
        assert_eq!(raw.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(raw.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(raw.image.as_raw(), 7);
    }

    #[test]
    fn attachment_load_ops() {
        let view = vk::ImageView::from_raw(3);
        let cleared = RenderingAttachment {
            view,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            clear: Some(ClearValue::BLACK),
        }
        .to_vk();
        assert_eq!(cleared.load_op, vk::AttachmentLoadOp::CLEAR);

        let loaded = RenderingAttachment {
            view,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            clear: None,
        }
        .to_vk();
        assert_eq!(loaded.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(loaded.store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn depth_clear_value() {
        let raw = ClearValue::DEPTH_ONE.to_vk();
        // SAFETY: written through the depth_stencil member above.
        let depth = unsafe { raw.depth_stencil.depth };
        assert!((depth - 1.0).abs() < f32::EPSILON);
    }
}
