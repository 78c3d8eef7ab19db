//! Pipeline creation.
//!
//! All pipelines use dynamic rendering (Vulkan 1.3) and are compiled through
//! the device's shared pipeline cache.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CString;

/// Graphics pipeline configuration.
///
/// `fragment_shader: None` builds a depth-only pipeline, as used by shadow and
/// prepass passes.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineConfig {
    pub layout: vk::PipelineLayout,
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Option<Vec<u32>>,
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub alpha_blend: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    /// Multiview mask, non-zero for layered targets such as shadow cascades.
    pub view_mask: u32,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            layout: vk::PipelineLayout::null(),
            vertex_shader: Vec::new(),
            fragment_shader: None,
            vertex_entry: "main".to_string(),
            fragment_entry: "main".to_string(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::GREATER_OR_EQUAL,
            alpha_blend: false,
            color_formats: Vec::new(),
            depth_format: None,
            view_mask: 0,
        }
    }
}

impl GraphicsPipelineConfig {
    pub fn new(layout: vk::PipelineLayout, vertex_shader: Vec<u32>) -> Self {
        Self {
            layout,
            vertex_shader,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_fragment_shader(mut self, spirv: Vec<u32>) -> Self {
        self.fragment_shader = Some(spirv);
        self
    }

    /// Attachment formats, usually taken from the target pass.
    #[must_use]
    pub fn with_attachments(mut self, colors: &[vk::Format], depth: Option<vk::Format>) -> Self {
        self.color_formats = colors.to_vec();
        self.depth_format = depth;
        self
    }

    #[must_use]
    pub fn with_vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    #[must_use]
    pub const fn with_depth(mut self, test: bool, write: bool, compare: vk::CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    #[must_use]
    pub const fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    #[must_use]
    pub const fn with_alpha_blend(mut self, enabled: bool) -> Self {
        self.alpha_blend = enabled;
        self
    }

    /// Check that the configuration can produce a pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.vertex_shader.is_empty() {
            return Err(GpuError::ShaderCompilation(
                "Vertex shader is empty".to_string(),
            ));
        }
        if self.fragment_shader.as_ref().is_some_and(Vec::is_empty) {
            return Err(GpuError::ShaderCompilation(
                "Fragment shader is empty".to_string(),
            ));
        }
        if self.color_formats.is_empty() && self.depth_format.is_none() {
            return Err(GpuError::PipelineCreation(
                "Pipeline has no attachments".to_string(),
            ));
        }
        if self.fragment_shader.is_none() && !self.color_formats.is_empty() {
            return Err(GpuError::PipelineCreation(
                "Color attachments need a fragment shader".to_string(),
            ));
        }
        Ok(())
    }

    fn blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        if self.alpha_blend {
            state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
        } else {
            state.blend_enable(false)
        }
    }
}

fn entry_name(entry: &str) -> Result<CString> {
    CString::new(entry)
        .map_err(|_| GpuError::PipelineCreation(format!("Invalid entry point name {entry:?}")))
}

/// Create a shader module.
///
/// # Safety
/// The device must be valid and `spirv` must be valid SPIR-V.
unsafe fn create_shader_module(device: &ash::Device, spirv: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(spirv);
    // SAFETY: the caller guarantees the device is valid.
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| GpuError::ShaderCompilation(e.to_string()))
}

/// Create a pipeline layout.
///
/// # Safety
/// The device and every set layout must be valid.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constants);

    // SAFETY: the caller guarantees the device is valid.
    unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Create a compute pipeline.
///
/// # Safety
/// The device, cache and layout must be valid and the shader code must be valid SPIR-V.
pub unsafe fn create_compute_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    spirv: &[u32],
    entry_point: &str,
) -> Result<vk::Pipeline> {
    if spirv.is_empty() {
        return Err(GpuError::ShaderCompilation(
            "Compute shader is empty".to_string(),
        ));
    }
    let entry = entry_name(entry_point)?;
    // SAFETY: forwarded from the caller.
    let module = unsafe { create_shader_module(device, spirv)? };

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry);

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout);

    // SAFETY: forwarded from the caller; the module is destroyed after use.
    let result = unsafe { device.create_compute_pipelines(cache, &[pipeline_info], None) };
    unsafe { device.destroy_shader_module(module, None) };

    let pipelines = result.map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;
    pipelines
        .first()
        .copied()
        .ok_or_else(|| GpuError::PipelineCreation("No pipeline returned".to_string()))
}

/// Create a graphics pipeline using dynamic rendering.
///
/// # Safety
/// The device, cache and layout must be valid and shader code must be valid SPIR-V.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    config: &GraphicsPipelineConfig,
) -> Result<vk::Pipeline> {
    config.validate()?;

    let vertex_entry = entry_name(&config.vertex_entry)?;
    let fragment_entry = entry_name(&config.fragment_entry)?;

    // SAFETY: forwarded from the caller.
    let vert_module = unsafe { create_shader_module(device, &config.vertex_shader)? };
    let frag_module = match &config.fragment_shader {
        // SAFETY: forwarded from the caller.
        Some(code) => match unsafe { create_shader_module(device, code) } {
            Ok(module) => Some(module),
            Err(e) => {
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        },
        None => None,
    };

    let mut shader_stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_module)
        .name(&vertex_entry)];
    if let Some(module) = frag_module {
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(&fragment_entry),
        );
    }

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&config.vertex_bindings)
        .vertex_attribute_descriptions(&config.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(config.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor come from the batch
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(config.polygon_mode)
        .cull_mode(config.cull_mode)
        .front_face(config.front_face)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(config.depth_test)
        .depth_write_enable(config.depth_write)
        .depth_compare_op(config.depth_compare);

    let color_blend_attachments: Vec<_> = config
        .color_formats
        .iter()
        .map(|_| config.blend_attachment())
        .collect();

    let color_blending =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .view_mask(config.view_mask)
        .color_attachment_formats(&config.color_formats)
        .depth_attachment_format(config.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(config.layout)
        .push_next(&mut rendering_info);

    // SAFETY: forwarded from the caller; modules are destroyed after use.
    let result = unsafe { device.create_graphics_pipelines(cache, &[pipeline_info], None) };
    unsafe {
        device.destroy_shader_module(vert_module, None);
        if let Some(module) = frag_module {
            device.destroy_shader_module(module, None);
        }
    }

    let pipelines = result.map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;
    pipelines
        .first()
        .copied()
        .ok_or_else(|| GpuError::PipelineCreation("No pipeline returned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_only_pipeline_validates() {
        let config = GraphicsPipelineConfig::new(vk::PipelineLayout::null(), vec![0x0723_0203])
            .with_attachments(&[], Some(vk::Format::D32_SFLOAT));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn color_without_fragment_is_rejected() {
        let config = GraphicsPipelineConfig::new(vk::PipelineLayout::null(), vec![0x0723_0203])
            .with_attachments(&[vk::Format::R16G16B16A16_SFLOAT], None);
        assert!(matches!(
            config.validate(),
            Err(GpuError::PipelineCreation(_))
        ));
    }

    #[test]
    fn empty_shaders_are_rejected() {
        let config = GraphicsPipelineConfig::default()
            .with_attachments(&[], Some(vk::Format::D32_SFLOAT));
        assert!(matches!(
            config.validate(),
            Err(GpuError::ShaderCompilation(_))
        ));

        let config = GraphicsPipelineConfig::new(vk::PipelineLayout::null(), vec![1])
            .with_fragment_shader(Vec::new())
            .with_attachments(&[vk::Format::R8G8B8A8_UNORM], None);
        assert!(matches!(
            config.validate(),
            Err(GpuError::ShaderCompilation(_))
        ));
    }

    #[test]
    fn blend_state_follows_flag() {
        let blended = GraphicsPipelineConfig::default().with_alpha_blend(true);
        assert_eq!(blended.blend_attachment().blend_enable, vk::TRUE);
        let opaque = GraphicsPipelineConfig::default();
        assert_eq!(opaque.blend_attachment().blend_enable, vk::FALSE);
    }

    #[test]
    fn entry_names_reject_interior_nul() {
        assert!(entry_name("main").is_ok());
        assert!(entry_name("ma\0in").is_err());
    }
}
