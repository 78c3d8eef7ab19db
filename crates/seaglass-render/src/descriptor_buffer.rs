//! Bindless descriptor arrays stored in `VK_EXT_descriptor_buffer` memory.
//!
//! Unlike [`DynamicDescriptorPool`](crate::DynamicDescriptorPool) there are no
//! sets to keep in step per slot: descriptors are encoded straight into one
//! host-visible buffer that shaders read by device address.

use crate::error::{RenderError, Result};
use crate::render_system::RenderSystem;
use ash::vk;
use seaglass_core::constants::DYN_DESC_PAGE_SIZE;
use seaglass_core::FreeList;
use seaglass_gpu::{
    CommandEncoder, DescriptorBufferProperties, DescriptorData, DescriptorSetLayoutBuilder,
    GpuBuffer,
};

/// A growable array of one descriptor type backed by a descriptor buffer.
///
/// Element `i` lives at `binding_offset + i * stride`. Writes are visible to
/// the next frame recorded. An index must not be freed and rewritten while a
/// frame in flight still reads it.
#[derive(Debug)]
pub struct DescriptorBuffer {
    name: String,
    binding: u32,
    desc_type: vk::DescriptorType,
    layout: vk::DescriptorSetLayout,
    binding_offset: u64,
    stride: u64,
    alignment: u64,
    max_capacity: u32,
    capacity: u32,
    free: FreeList,
    descriptors: Vec<Option<DescriptorData>>,
    buffer: Option<GpuBuffer>,
    address: vk::DeviceAddress,
    resize_count: u32,
}

impl DescriptorBuffer {
    pub fn new(
        render: &RenderSystem,
        name: impl Into<String>,
        binding: u32,
        desc_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        initial_capacity: u32,
        max_capacity: u32,
    ) -> Result<Self> {
        let name = name.into();
        if initial_capacity == 0 || initial_capacity > max_capacity {
            return Err(RenderError::InvalidState(format!(
                "Descriptor buffer '{name}' capacity {initial_capacity} outside 1..={max_capacity}"
            )));
        }
        let props = render.device().descriptor_buffer_properties().ok_or_else(|| {
            RenderError::InvalidState(format!(
                "Descriptor buffer '{name}': device has no descriptor buffer support"
            ))
        })?;
        let stride = props.descriptor_size(desc_type).ok_or_else(|| {
            RenderError::InvalidState(format!(
                "Descriptor buffer '{name}' cannot hold {desc_type:?} descriptors"
            ))
        })?;

        let layout_desc = DescriptorSetLayoutBuilder::new()
            .descriptor_buffer_array(binding, desc_type, max_capacity, stages)
            .build();
        let layout = render.create_descriptor_set_layout(&layout_desc, &format!("{name}_layout"))?;
        let binding_offset = match render.device().descriptor_binding_offset(layout, binding) {
            Ok(offset) => offset,
            Err(e) => {
                render.destroy_descriptor_set_layout(layout);
                return Err(e.into());
            }
        };

        let mut descriptors = Self {
            name,
            binding,
            desc_type,
            layout,
            binding_offset,
            stride,
            alignment: props.offset_alignment.max(1),
            max_capacity,
            capacity: initial_capacity,
            free: FreeList::new(initial_capacity),
            descriptors: vec![None; initial_capacity as usize],
            buffer: None,
            address: 0,
            resize_count: 0,
        };
        match descriptors.create_buffer(render, initial_capacity) {
            Ok((buffer, address)) => {
                descriptors.buffer = Some(buffer);
                descriptors.address = address;
                Ok(descriptors)
            }
            Err(e) => {
                render.destroy_descriptor_set_layout(layout);
                Err(e)
            }
        }
    }

    fn buffer_size(&self, capacity: u32) -> u64 {
        (self.binding_offset + self.stride * u64::from(capacity)).next_multiple_of(self.alignment)
    }

    fn create_buffer(
        &self,
        render: &RenderSystem,
        capacity: u32,
    ) -> Result<(GpuBuffer, vk::DeviceAddress)> {
        let buffer = render.alloc_host_buffer(
            self.buffer_size(capacity),
            DescriptorBufferProperties::buffer_usage(self.desc_type),
            &self.name,
        )?;
        match render.device().buffer_device_address(&buffer) {
            Ok(address) => Ok((buffer, address)),
            Err(e) => {
                render.free_gpu_buffer(buffer)?;
                Err(e.into())
            }
        }
    }

    fn encode(&self, render: &RenderSystem, data: &DescriptorData) -> Result<Vec<u8>> {
        let mut bytes = vec![0; self.stride as usize];
        render.device().get_descriptor(data, &mut bytes)?;
        Ok(bytes)
    }

    /// Byte offset of element `idx` inside the buffer.
    pub fn offset_of(&self, idx: u32) -> u64 {
        self.binding_offset + self.stride * u64::from(idx)
    }

    /// Store descriptors and return their indices.
    ///
    /// Freed indices are reused first. When they run out the buffer grows by
    /// whole pages and every live descriptor is written into the new one; the
    /// old buffer is freed once frames using it have retired.
    pub fn write(&mut self, render: &mut RenderSystem, data: &[DescriptorData]) -> Result<Vec<u32>> {
        if let Some(bad) = data.iter().find(|d| d.descriptor_type() != self.desc_type) {
            return Err(seaglass_core::Error::InvalidData(format!(
                "{}: expected {:?} descriptors, got {:?}",
                self.name,
                self.desc_type,
                bad.descriptor_type()
            ))
            .into());
        }
        // Encode up front so a bad descriptor leaves the array untouched
        let encoded = data
            .iter()
            .map(|d| self.encode(render, d))
            .collect::<Result<Vec<_>>>()?;

        let needed = data.len() as u32;
        if needed > self.free.len() as u32 {
            self.grow(render, self.count() + needed)?;
        }

        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| RenderError::InvalidState(format!("{} is destroyed", self.name)))?;
        let mut indices = Vec::with_capacity(data.len());
        for (d, bytes) in data.iter().zip(&encoded) {
            let idx = self
                .free
                .pull()
                .ok_or_else(|| seaglass_core::Error::Exhausted(self.name.clone()))?;
            render
                .device()
                .write_buffer(buffer, self.offset_of(idx), bytes)?;
            self.descriptors[idx as usize] = Some(*d);
            indices.push(idx);
        }
        Ok(indices)
    }

    fn grow(&mut self, render: &mut RenderSystem, required: u32) -> Result<()> {
        if required > self.max_capacity {
            return Err(seaglass_core::Error::CapacityExceeded {
                name: self.name.clone(),
                requested: u64::from(required),
                available: u64::from(self.max_capacity - self.count()),
                capacity: u64::from(self.max_capacity),
            }
            .into());
        }

        let capacity = required
            .div_ceil(DYN_DESC_PAGE_SIZE)
            .saturating_mul(DYN_DESC_PAGE_SIZE)
            .min(self.max_capacity);
        let (buffer, address) = self.create_buffer(render, capacity)?;

        let mut rewritten = 0;
        for (idx, data) in self.descriptors.iter().enumerate() {
            let Some(data) = data else {
                continue;
            };
            let offset = self.offset_of(idx as u32);
            let written = self.encode(render, data).and_then(|bytes| {
                Ok(render.device().write_buffer(&buffer, offset, &bytes)?)
            });
            if let Err(e) = written {
                render.free_gpu_buffer(buffer)?;
                return Err(e);
            }
            rewritten += 1;
        }

        if let Some(old) = self.buffer.replace(buffer) {
            render.free_gpu_buffer_deferred(old);
        }
        self.address = address;
        self.free.grow(capacity);
        self.descriptors.resize(capacity as usize, None);
        self.capacity = capacity;
        self.resize_count += 1;
        tracing::debug!(buffer = %self.name, capacity, rewritten, "Grew descriptor buffer");
        Ok(())
    }

    /// Return `idx` for reuse. Its bytes stay in the buffer until rewritten.
    pub fn free(&mut self, idx: u32) -> Result<()> {
        self.free.give_back(idx)?;
        self.descriptors[idx as usize] = None;
        Ok(())
    }

    /// Free every index at once.
    pub fn reset(&mut self) {
        self.free.reset(self.capacity);
        self.descriptors.fill(None);
    }

    /// Contents stored at `idx`, if it is live.
    pub fn descriptor(&self, idx: u32) -> Option<DescriptorData> {
        self.descriptors.get(idx as usize).copied().flatten()
    }

    /// Bind this buffer as descriptor buffer 0 and point `set` of
    /// `pipeline_layout` at it.
    pub fn bind(
        &self,
        encoder: &dyn CommandEncoder,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        set: u32,
    ) {
        encoder.cmd_bind_descriptor_buffers(cmd, &[self.binding_info()]);
        encoder.cmd_set_descriptor_buffer_offsets(cmd, bind_point, pipeline_layout, set, &[0], &[0]);
    }

    /// Address and usage to pass to `vkCmdBindDescriptorBuffersEXT`.
    pub fn binding_info(&self) -> (vk::DeviceAddress, vk::BufferUsageFlags) {
        (self.address, DescriptorBufferProperties::buffer_usage(self.desc_type))
    }

    pub const fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.as_ref().map_or(vk::Buffer::null(), |b| b.buffer)
    }

    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub const fn binding(&self) -> u32 {
        self.binding
    }

    /// Bytes per descriptor.
    pub const fn stride(&self) -> u64 {
        self.stride
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Live descriptors.
    pub fn count(&self) -> u32 {
        self.capacity - self.free.len() as u32
    }

    /// Number of times the buffer has grown.
    pub const fn resize_count(&self) -> u32 {
        self.resize_count
    }

    /// Destroy the buffer and layout. No frame using them may be in flight.
    pub fn destroy(&mut self, render: &RenderSystem) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = render.free_gpu_buffer(buffer) {
                tracing::warn!(buffer = %self.name, "Failed to free descriptor buffer: {e}");
            }
        }
        self.address = 0;
        if self.layout != vk::DescriptorSetLayout::null() {
            render.destroy_descriptor_set_layout(self.layout);
            self.layout = vk::DescriptorSetLayout::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use ash::vk::Handle;
    use seaglass_gpu::{GpuDevice, RecordedCommand, RecordingDevice, ResourceKind};
    use std::sync::Arc;

    fn render() -> (Arc<RecordingDevice>, RenderSystem) {
        let device = Arc::new(RecordingDevice::new());
        let render = RenderSystem::new(
            device.clone(),
            RenderConfig::new().with_temp_buffer_size(256),
        )
        .unwrap();
        (device, render)
    }

    fn texture(raw: u64) -> DescriptorData {
        DescriptorData::sampled_image(vk::ImageView::from_raw(raw))
    }

    fn textures(render: &RenderSystem, initial: u32, max: u32) -> DescriptorBuffer {
        DescriptorBuffer::new(
            render,
            "textures",
            0,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::ShaderStageFlags::FRAGMENT,
            initial,
            max,
        )
        .unwrap()
    }

    /// The bytes stored for element `idx`.
    fn stored(device: &RecordingDevice, buffer: &DescriptorBuffer, idx: u32) -> Vec<u8> {
        let contents = device.buffer_contents(buffer.buffer()).unwrap();
        let start = buffer.offset_of(idx) as usize;
        contents[start..start + buffer.stride() as usize].to_vec()
    }

    fn encoded(device: &RecordingDevice, data: &DescriptorData, stride: u64) -> Vec<u8> {
        let mut bytes = vec![0; stride as usize];
        device.get_descriptor(data, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn writes_land_at_their_index() {
        let (device, mut render) = render();
        let mut buffer = textures(&render, 4, 256);
        let indices = buffer.write(&mut render, &[texture(0x51), texture(0x52)]).unwrap();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(buffer.count(), 2);

        for (&idx, raw) in indices.iter().zip([0x51, 0x52]) {
            assert_eq!(
                stored(&device, &buffer, idx),
                encoded(&device, &texture(raw), buffer.stride())
            );
        }
        // Sized to the alignment the device reports
        assert_eq!(
            device.buffer_contents(buffer.buffer()).unwrap().len() % 64,
            0
        );
        assert_ne!(buffer.address(), 0);
    }

    #[test]
    fn growth_rewrites_every_live_descriptor() {
        let (device, mut render) = render();
        let mut buffer = textures(&render, 2, 256);
        let first = buffer.write(&mut render, &[texture(1), texture(2)]).unwrap();
        buffer.free(first[0]).unwrap();
        let old_buffer = buffer.buffer();
        let old_address = buffer.address();
        let pending_before = render.pending_deletions();

        let more = buffer.write(&mut render, &[texture(3), texture(4)]).unwrap();
        assert_eq!(more, vec![first[0], 2]);
        assert_eq!(buffer.capacity(), DYN_DESC_PAGE_SIZE);
        assert_eq!(buffer.resize_count(), 1);
        assert_ne!(buffer.buffer(), old_buffer);
        assert_ne!(buffer.address(), old_address);

        // The survivor was carried over next to the new writes
        for (idx, raw) in [(first[1], 2), (more[0], 3), (more[1], 4)] {
            assert_eq!(
                stored(&device, &buffer, idx),
                encoded(&device, &texture(raw), buffer.stride())
            );
            assert_eq!(buffer.descriptor(idx), Some(texture(raw)));
        }
        // Frames in flight may still read the old buffer
        assert_eq!(render.pending_deletions(), pending_before + 1);
        assert!(device.buffer_contents(old_buffer).is_some());
    }

    #[test]
    fn growth_is_bounded() {
        let (_device, mut render) = render();
        let mut buffer = textures(&render, 2, 3);
        buffer.write(&mut render, &[texture(1), texture(2)]).unwrap();
        buffer.write(&mut render, &[texture(3)]).unwrap();
        assert_eq!(buffer.capacity(), 3);
        assert!(matches!(
            buffer.write(&mut render, &[texture(4)]),
            Err(RenderError::Core(seaglass_core::Error::CapacityExceeded { .. }))
        ));
        assert_eq!(buffer.count(), 3);
    }

    #[test]
    fn freed_indices_are_reused_first() {
        let (_device, mut render) = render();
        let mut buffer = textures(&render, 4, 256);
        let first = buffer
            .write(&mut render, &[texture(1), texture(2), texture(3)])
            .unwrap();
        buffer.free(first[1]).unwrap();
        assert_eq!(buffer.descriptor(first[1]), None);
        assert!(buffer.free(first[1]).is_err());

        assert_eq!(buffer.write(&mut render, &[texture(9)]).unwrap(), vec![first[1]]);
        assert_eq!(buffer.resize_count(), 0);
        assert_eq!(buffer.descriptor(first[1]), Some(texture(9)));
    }

    #[test]
    fn reset_frees_every_index() {
        let (_device, mut render) = render();
        let mut buffer = textures(&render, 4, 256);
        buffer
            .write(&mut render, &[texture(1), texture(2), texture(3)])
            .unwrap();
        buffer.reset();
        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.descriptor(0), None);
        assert_eq!(buffer.write(&mut render, &[texture(5)]).unwrap(), vec![0]);
    }

    #[test]
    fn mismatched_descriptors_leave_the_array_untouched() {
        let (_device, mut render) = render();
        let mut buffer = textures(&render, 4, 256);
        let storage = DescriptorData::storage_buffer(vk::Buffer::from_raw(5), 0, 64);
        assert!(buffer.write(&mut render, &[texture(1), storage]).is_err());
        assert_eq!(buffer.count(), 0);
    }

    #[test]
    fn storage_buffers_are_addressed() {
        let (device, mut render) = render();
        let target = render
            .alloc_gpu_buffer(
                4096,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                "lights",
            )
            .unwrap();
        let mut buffer = DescriptorBuffer::new(
            &render,
            "storage",
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
            8,
            64,
        )
        .unwrap();
        let data = DescriptorData::storage_buffer(target.buffer, 1024, 2048);
        let idx = buffer.write(&mut render, &[data]).unwrap()[0];

        let address = device.buffer_device_address(&target).unwrap();
        let bytes = stored(&device, &buffer, idx);
        assert_eq!(bytes[8..16], (address + 1024).to_le_bytes());
    }

    #[test]
    fn bind_records_address_and_offset() {
        let (device, render) = render();
        let buffer = textures(&render, 4, 256);
        let layout = render
            .create_pipeline_layout(&[buffer.layout()], &[], "textured")
            .unwrap();
        let cmd = vk::CommandBuffer::from_raw(0xBEEF);
        device.take_commands();

        buffer.bind(
            device.as_encoder(),
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            1,
        );
        assert_eq!(
            device.take_commands(),
            vec![
                RecordedCommand::BindDescriptorBuffers {
                    cmd,
                    addresses: vec![buffer.address()],
                },
                RecordedCommand::SetDescriptorBufferOffsets {
                    cmd,
                    layout,
                    first_set: 1,
                    buffer_indices: vec![0],
                    offsets: vec![0],
                },
            ]
        );
    }

    #[test]
    fn destroy_releases_buffer_and_layout() {
        let (device, render) = render();
        let layouts = device.live(ResourceKind::DescriptorSetLayout);
        let buffers = device.live(ResourceKind::Buffer);
        let mut buffer = textures(&render, 4, 256);
        assert_eq!(device.live(ResourceKind::Buffer), buffers + 1);

        buffer.destroy(&render);
        assert_eq!(device.live(ResourceKind::Buffer), buffers);
        assert_eq!(device.live(ResourceKind::DescriptorSetLayout), layouts);
        assert_eq!(buffer.buffer(), vk::Buffer::null());
    }

    #[test]
    fn devices_without_support_are_refused() {
        let (device, render) = render();
        let layouts = device.live(ResourceKind::DescriptorSetLayout);
        device.disable_descriptor_buffers();
        let result = DescriptorBuffer::new(
            &render,
            "textures",
            0,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::ShaderStageFlags::FRAGMENT,
            4,
            256,
        );
        assert!(matches!(result, Err(RenderError::InvalidState(_))));
        assert_eq!(device.live(ResourceKind::DescriptorSetLayout), layouts);
    }
}
