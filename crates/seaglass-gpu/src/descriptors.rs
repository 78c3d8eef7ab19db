//! Descriptor set management.
//!
//! Layouts, pools and writes are described with owned types so they can be
//! queued across threads and replayed, then converted to raw Vulkan structs
//! at the point of use.

use crate::error::Result;
use ash::vk;

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
    pub immutable_samplers: Vec<vk::Sampler>,
}

/// An owned descriptor set layout description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetLayoutDesc {
    pub flags: vk::DescriptorSetLayoutCreateFlags,
    pub bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayoutDesc {
    /// Whether any binding uses a variable descriptor count.
    pub fn has_variable_count(&self) -> bool {
        self.bindings.iter().any(|b| {
            b.flags
                .contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
        })
    }

    /// Create the layout on `device`.
    ///
    /// # Safety
    /// The device and every immutable sampler must be valid.
    pub unsafe fn create(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|b| {
                let raw = vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages);
                if b.immutable_samplers.is_empty() {
                    raw
                } else {
                    raw.immutable_samplers(&b.immutable_samplers)
                }
            })
            .collect();
        let flags: Vec<_> = self.bindings.iter().map(|b| b.flags).collect();

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(self.flags)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        // SAFETY: the caller guarantees the device is valid.
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };
        Ok(layout)
    }
}

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    desc: DescriptorSetLayoutDesc,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.desc.bindings.push(LayoutBinding {
            binding,
            ty,
            count,
            stages,
            flags: vk::DescriptorBindingFlags::empty(),
            immutable_samplers: Vec::new(),
        });
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stages)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stages)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::SAMPLED_IMAGE, 1, stages)
    }

    /// Add a sampler binding baked into the layout.
    pub fn immutable_sampler(
        mut self,
        binding: u32,
        sampler: vk::Sampler,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self = self.binding(binding, vk::DescriptorType::SAMPLER, 1, stages);
        if let Some(last) = self.desc.bindings.last_mut() {
            last.immutable_samplers.push(sampler);
        }
        self
    }

    /// Add a partially bound, variable-count array binding that can be updated
    /// while sets using it are bound. Must be the highest binding of the layout.
    pub fn bindless(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        max_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self = self.binding(binding, ty, max_count, stages);
        if let Some(last) = self.desc.bindings.last_mut() {
            last.flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        }
        self.desc.flags |= vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
        self
    }

    /// Add a partially bound array read through a descriptor buffer instead
    /// of a descriptor set. Such layouts cannot mix in update-after-bind bindings.
    pub fn descriptor_buffer_array(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        max_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self = self.binding(binding, ty, max_count, stages);
        if let Some(last) = self.desc.bindings.last_mut() {
            last.flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        }
        self.desc.flags |= vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT;
        self
    }

    /// Finish the description.
    pub fn build(self) -> DescriptorSetLayoutDesc {
        self.desc
    }
}

/// An owned descriptor pool description.
///
/// `sizes_per_set` is what a single set needs; the pool reserves that many
/// descriptors for each of its `max_sets` sets.
#[derive(Debug, Clone, Default)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub sizes_per_set: Vec<vk::DescriptorPoolSize>,
    pub flags: vk::DescriptorPoolCreateFlags,
}

impl DescriptorPoolDesc {
    pub const fn new(max_sets: u32) -> Self {
        Self {
            max_sets,
            sizes_per_set: Vec::new(),
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }

    /// Reserve `count` descriptors of `ty` per set.
    #[must_use]
    pub fn with_size(mut self, ty: vk::DescriptorType, count: u32) -> Self {
        self.sizes_per_set.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        });
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: vk::DescriptorPoolCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The same pool shape sized for `max_sets` sets.
    #[must_use]
    pub fn with_max_sets(&self, max_sets: u32) -> Self {
        Self {
            max_sets,
            sizes_per_set: self.sizes_per_set.clone(),
            flags: self.flags,
        }
    }

    /// Total pool sizes across all sets.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.sizes_per_set
            .iter()
            .map(|s| vk::DescriptorPoolSize {
                ty: s.ty,
                descriptor_count: s.descriptor_count.saturating_mul(self.max_sets.max(1)),
            })
            .collect()
    }

    /// Create the pool on `device`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create(&self, device: &ash::Device) -> Result<vk::DescriptorPool> {
        let sizes = self.pool_sizes();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(self.max_sets)
            .pool_sizes(&sizes)
            .flags(self.flags);

        // SAFETY: the caller guarantees the device is valid.
        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
        Ok(pool)
    }
}

/// Contents of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorData {
    Image {
        ty: vk::DescriptorType,
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Buffer {
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    TexelBuffer {
        ty: vk::DescriptorType,
        view: vk::BufferView,
    },
}

impl DescriptorData {
    pub const fn sampled_image(view: vk::ImageView) -> Self {
        Self::Image {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            sampler: vk::Sampler::null(),
            view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    pub const fn storage_image(view: vk::ImageView) -> Self {
        Self::Image {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            sampler: vk::Sampler::null(),
            view,
            layout: vk::ImageLayout::GENERAL,
        }
    }

    pub const fn uniform_buffer(buffer: vk::Buffer, offset: u64, range: u64) -> Self {
        Self::Buffer {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            buffer,
            offset,
            range,
        }
    }

    pub const fn storage_buffer(buffer: vk::Buffer, offset: u64, range: u64) -> Self {
        Self::Buffer {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            buffer,
            offset,
            range,
        }
    }

    pub const fn descriptor_type(&self) -> vk::DescriptorType {
        match *self {
            Self::Image { ty, .. } | Self::Buffer { ty, .. } | Self::TexelBuffer { ty, .. } => ty,
        }
    }
}

/// Descriptor sizes and offset alignment of `VK_EXT_descriptor_buffer`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorBufferProperties {
    /// Required alignment of a set's offset inside a descriptor buffer.
    pub offset_alignment: u64,
    pub sampler_size: u64,
    pub combined_image_sampler_size: u64,
    pub sampled_image_size: u64,
    pub storage_image_size: u64,
    pub uniform_texel_buffer_size: u64,
    pub storage_texel_buffer_size: u64,
    pub uniform_buffer_size: u64,
    pub storage_buffer_size: u64,
}

impl DescriptorBufferProperties {
    pub fn from_vk(props: &vk::PhysicalDeviceDescriptorBufferPropertiesEXT<'_>) -> Self {
        Self {
            offset_alignment: props.descriptor_buffer_offset_alignment,
            sampler_size: props.sampler_descriptor_size as u64,
            combined_image_sampler_size: props.combined_image_sampler_descriptor_size as u64,
            sampled_image_size: props.sampled_image_descriptor_size as u64,
            storage_image_size: props.storage_image_descriptor_size as u64,
            uniform_texel_buffer_size: props.uniform_texel_buffer_descriptor_size as u64,
            storage_texel_buffer_size: props.storage_texel_buffer_descriptor_size as u64,
            uniform_buffer_size: props.uniform_buffer_descriptor_size as u64,
            storage_buffer_size: props.storage_buffer_descriptor_size as u64,
        }
    }

    /// Bytes one descriptor of `ty` takes, or `None` for types a descriptor
    /// buffer cannot hold.
    pub fn descriptor_size(&self, ty: vk::DescriptorType) -> Option<u64> {
        let size = match ty {
            vk::DescriptorType::SAMPLER => self.sampler_size,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => self.combined_image_sampler_size,
            vk::DescriptorType::SAMPLED_IMAGE => self.sampled_image_size,
            vk::DescriptorType::STORAGE_IMAGE => self.storage_image_size,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER => self.uniform_texel_buffer_size,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER => self.storage_texel_buffer_size,
            vk::DescriptorType::UNIFORM_BUFFER => self.uniform_buffer_size,
            vk::DescriptorType::STORAGE_BUFFER => self.storage_buffer_size,
            _ => return None,
        };
        (size > 0).then_some(size)
    }

    /// Buffer usage a descriptor buffer holding `ty` needs.
    pub fn buffer_usage(ty: vk::DescriptorType) -> vk::BufferUsageFlags {
        let kind = match ty {
            vk::DescriptorType::SAMPLER | vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
                vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT
            }
            _ => vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT,
        };
        kind | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    }
}

/// A single descriptor write, owned so it can sit in a queue until the
/// render thread applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub data: DescriptorData,
}

/// Apply `writes` through `vkUpdateDescriptorSets`.
///
/// # Safety
/// The device and every handle referenced by the writes must be valid, and
/// no set being written may be in use by a pending command buffer unless its
/// binding was created update-after-bind.
pub unsafe fn apply_writes(device: &ash::Device, writes: &[DescriptorWrite]) {
    if writes.is_empty() {
        return;
    }

    // Infos first so the raw writes can borrow them.
    let mut image_infos = Vec::with_capacity(writes.len());
    let mut buffer_infos = Vec::with_capacity(writes.len());
    let mut texel_views = Vec::with_capacity(writes.len());
    for write in writes {
        match write.data {
            DescriptorData::Image {
                sampler,
                view,
                layout,
                ..
            } => image_infos.push(
                vk::DescriptorImageInfo::default()
                    .sampler(sampler)
                    .image_view(view)
                    .image_layout(layout),
            ),
            DescriptorData::Buffer {
                buffer,
                offset,
                range,
                ..
            } => buffer_infos.push(
                vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range),
            ),
            DescriptorData::TexelBuffer { view, .. } => texel_views.push(view),
        }
    }

    let (mut image_idx, mut buffer_idx, mut texel_idx) = (0, 0, 0);
    let raw: Vec<_> = writes
        .iter()
        .map(|write| {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .dst_array_element(write.array_element)
                .descriptor_type(write.data.descriptor_type());
            match write.data {
                DescriptorData::Image { .. } => {
                    image_idx += 1;
                    base.image_info(std::slice::from_ref(&image_infos[image_idx - 1]))
                }
                DescriptorData::Buffer { .. } => {
                    buffer_idx += 1;
                    base.buffer_info(std::slice::from_ref(&buffer_infos[buffer_idx - 1]))
                }
                DescriptorData::TexelBuffer { .. } => {
                    texel_idx += 1;
                    base.texel_buffer_view(std::slice::from_ref(&texel_views[texel_idx - 1]))
                }
            }
        })
        .collect();

    // SAFETY: the caller guarantees the device and handles are valid.
    unsafe { device.update_descriptor_sets(&raw, &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn bindless_binding_sets_flags() {
        let desc = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .bindless(
                1,
                vk::DescriptorType::SAMPLED_IMAGE,
                1024,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .build();

        assert_eq!(desc.bindings.len(), 2);
        assert!(desc.has_variable_count());
        assert!(desc
            .flags
            .contains(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL));
        assert_eq!(desc.bindings[1].count, 1024);
        assert!(desc.bindings[0].flags.is_empty());
    }

    #[test]
    fn descriptor_buffer_layouts_are_not_update_after_bind() {
        let desc = DescriptorSetLayoutBuilder::new()
            .descriptor_buffer_array(
                0,
                vk::DescriptorType::STORAGE_BUFFER,
                256,
                vk::ShaderStageFlags::COMPUTE,
            )
            .build();
        assert!(desc
            .flags
            .contains(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT));
        assert!(!desc
            .flags
            .contains(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL));
        assert_eq!(
            desc.bindings[0].flags,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
        );
    }

    #[test]
    fn descriptor_sizes_by_type() {
        let props = DescriptorBufferProperties {
            offset_alignment: 64,
            sampled_image_size: 32,
            storage_buffer_size: 16,
            ..Default::default()
        };
        assert_eq!(props.descriptor_size(vk::DescriptorType::SAMPLED_IMAGE), Some(32));
        assert_eq!(props.descriptor_size(vk::DescriptorType::STORAGE_BUFFER), Some(16));
        // Reported as zero by the driver
        assert_eq!(props.descriptor_size(vk::DescriptorType::UNIFORM_BUFFER), None);
        assert_eq!(props.descriptor_size(vk::DescriptorType::INPUT_ATTACHMENT), None);
        assert!(DescriptorBufferProperties::buffer_usage(vk::DescriptorType::SAMPLER)
            .contains(vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT));
    }

    #[test]
    fn immutable_sampler_is_attached() {
        let sampler = vk::Sampler::from_raw(42);
        let desc = DescriptorSetLayoutBuilder::new()
            .immutable_sampler(0, sampler, vk::ShaderStageFlags::FRAGMENT)
            .build();
        assert_eq!(desc.bindings[0].immutable_samplers, vec![sampler]);
        assert!(!desc.has_variable_count());
    }

    #[test]
    fn pool_sizes_scale_with_sets() {
        let desc = DescriptorPoolDesc::new(4)
            .with_size(vk::DescriptorType::UNIFORM_BUFFER, 2)
            .with_size(vk::DescriptorType::SAMPLED_IMAGE, 1);
        let sizes = desc.pool_sizes();
        assert_eq!(sizes[0].descriptor_count, 8);
        assert_eq!(sizes[1].descriptor_count, 4);

        let bigger = desc.with_max_sets(10);
        assert_eq!(bigger.max_sets, 10);
        assert_eq!(bigger.pool_sizes()[0].descriptor_count, 20);
    }

    #[test]
    fn descriptor_data_types() {
        let view = vk::ImageView::from_raw(1);
        assert_eq!(
            DescriptorData::sampled_image(view).descriptor_type(),
            vk::DescriptorType::SAMPLED_IMAGE
        );
        assert_eq!(
            DescriptorData::storage_buffer(vk::Buffer::from_raw(2), 0, 64).descriptor_type(),
            vk::DescriptorType::STORAGE_BUFFER
        );
    }
}
