//! Descriptor pools with frame-slot aware lifetimes.
//!
//! Three shapes cover the engine's needs:
//! - [`FrameDescriptorPool`]: sets that live for one frame, reallocated every tick.
//! - [`DescriptorSetPool`]: persistent sets whose count only grows.
//! - [`DynamicDescriptorPool`]: one bindless array, mirrored per slot, that
//!   grows without touching slots still in flight.

use crate::error::{RenderError, Result};
use crate::render_system::RenderSystem;
use ash::vk;
use seaglass_core::constants::{DYN_DESC_PAGE_SIZE, FRAME_STATE_COUNT};
use seaglass_core::FreeList;
use seaglass_gpu::{DescriptorData, DescriptorPoolDesc, DescriptorSetLayoutBuilder, DescriptorWrite};

#[derive(Debug, Default)]
struct FramePoolSlot {
    pool: vk::DescriptorPool,
    capacity: u32,
    sets: Vec<vk::DescriptorSet>,
}

/// One Vulkan pool per frame slot. Sets are freed and reallocated on every tick.
#[derive(Debug)]
pub struct FrameDescriptorPool {
    name: String,
    slots: Vec<FramePoolSlot>,
}

impl FrameDescriptorPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: (0..FRAME_STATE_COUNT).map(|_| FramePoolSlot::default()).collect(),
        }
    }

    /// Prepare this tick's sets in the current slot, one per layout.
    ///
    /// The slot's pool is recreated only when it cannot hold `layouts.len()`
    /// sets; other slots are left alone since they may still be in flight.
    pub fn tick(
        &mut self,
        render: &RenderSystem,
        desc: &DescriptorPoolDesc,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: Option<&[u32]>,
    ) -> Result<()> {
        let idx = render.frame_idx();
        let slot = &mut self.slots[idx];
        let needed = layouts.len() as u32;

        if slot.pool == vk::DescriptorPool::null() || needed > slot.capacity {
            if slot.pool != vk::DescriptorPool::null() {
                render.destroy_descriptor_pool(slot.pool);
                slot.pool = vk::DescriptorPool::null();
            }
            let capacity = needed.max(desc.max_sets).max(1);
            slot.pool = render.create_descriptor_pool(
                &desc.with_max_sets(capacity),
                &format!("{}_{idx}", self.name),
            )?;
            slot.capacity = capacity;
            tracing::debug!(pool = %self.name, slot = idx, capacity, "Recreated frame descriptor pool");
        } else {
            render.reset_descriptor_pool(slot.pool)?;
        }

        slot.sets.clear();
        if !layouts.is_empty() {
            slot.sets = render.allocate_descriptor_sets(slot.pool, layouts, variable_counts)?;
        }
        Ok(())
    }

    /// Set `idx` of the current slot, as allocated by the last tick.
    pub fn set(&self, render: &RenderSystem, idx: usize) -> Option<vk::DescriptorSet> {
        self.slots[render.frame_idx()].sets.get(idx).copied()
    }

    pub fn set_count(&self, render: &RenderSystem) -> usize {
        self.slots[render.frame_idx()].sets.len()
    }

    /// Sets the pool of `slot` can hold without being recreated.
    pub fn capacity(&self, slot: usize) -> u32 {
        self.slots.get(slot).map_or(0, |s| s.capacity)
    }

    /// Destroy every slot's pool. No frame using them may be in flight.
    pub fn destroy(&mut self, render: &RenderSystem) {
        for slot in &mut self.slots {
            if slot.pool != vk::DescriptorPool::null() {
                render.destroy_descriptor_pool(slot.pool);
            }
            *slot = FramePoolSlot::default();
        }
    }
}

/// A persistent pool whose set count only grows.
#[derive(Debug)]
pub struct DescriptorSetPool {
    name: String,
    pool: vk::DescriptorPool,
    capacity: u32,
    sets: Vec<vk::DescriptorSet>,
}

impl DescriptorSetPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: vk::DescriptorPool::null(),
            capacity: 0,
            sets: Vec::new(),
        }
    }

    /// Make room for one set per layout. Returns whether the pool was recreated,
    /// in which case every previous set is gone and must be written again.
    ///
    /// Recreation destroys the old pool immediately, so no frame may be using it.
    pub fn resize(
        &mut self,
        render: &RenderSystem,
        desc: &DescriptorPoolDesc,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<bool> {
        let needed = layouts.len() as u32;
        if needed <= self.capacity {
            return Ok(false);
        }

        if self.pool != vk::DescriptorPool::null() {
            render.destroy_descriptor_pool(self.pool);
            self.pool = vk::DescriptorPool::null();
            self.sets.clear();
        }
        self.pool = render.create_descriptor_pool(&desc.with_max_sets(needed), &self.name)?;
        self.capacity = needed;
        self.sets = render.allocate_descriptor_sets(self.pool, layouts, None)?;
        tracing::debug!(pool = %self.name, capacity = needed, "Resized descriptor set pool");
        Ok(true)
    }

    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn destroy(&mut self, render: &RenderSystem) {
        if self.pool != vk::DescriptorPool::null() {
            render.destroy_descriptor_pool(self.pool);
        }
        self.pool = vk::DescriptorPool::null();
        self.capacity = 0;
        self.sets.clear();
    }
}

#[derive(Debug)]
struct DynamicSlot {
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    capacity: u32,
    needs_resize: bool,
    pending: Vec<u32>,
}

/// A growable bindless array of one descriptor type.
///
/// Indices are stable for as long as they are held. Each slot has its own
/// pool and set; a write reaches a slot on that slot's next [`tick`], so an
/// index is only safe to use from shaders once [`is_ready`] reports it.
///
/// [`tick`]: Self::tick
/// [`is_ready`]: Self::is_ready
#[derive(Debug)]
pub struct DynamicDescriptorPool {
    name: String,
    binding: u32,
    desc_type: vk::DescriptorType,
    layout: vk::DescriptorSetLayout,
    max_capacity: u32,
    capacity: u32,
    free: FreeList,
    descriptors: Vec<Option<DescriptorData>>,
    /// Bit `s` of entry `i` is set once slot `s` holds descriptor `i`.
    ready: Vec<u8>,
    slots: Vec<DynamicSlot>,
    resize_count: u32,
}

const ALL_SLOTS: u8 = ((1u16 << FRAME_STATE_COUNT) - 1) as u8;

impl DynamicDescriptorPool {
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
                "Descriptor pool '{name}' capacity {initial_capacity} outside 1..={max_capacity}"
            )));
        }

        let layout_desc = DescriptorSetLayoutBuilder::new()
            .bindless(binding, desc_type, max_capacity, stages)
            .build();
        let layout = render.create_descriptor_set_layout(&layout_desc, &format!("{name}_layout"))?;

        let mut pool = Self {
            name,
            binding,
            desc_type,
            layout,
            max_capacity,
            capacity: initial_capacity,
            free: FreeList::new(initial_capacity),
            descriptors: vec![None; initial_capacity as usize],
            ready: vec![0; initial_capacity as usize],
            slots: Vec::with_capacity(FRAME_STATE_COUNT),
            resize_count: 0,
        };
        for idx in 0..FRAME_STATE_COUNT {
            match pool.create_slot(render, idx) {
                Ok(slot) => pool.slots.push(slot),
                Err(e) => {
                    pool.destroy(render);
                    return Err(e);
                }
            }
        }
        Ok(pool)
    }

    fn create_slot(&self, render: &RenderSystem, idx: usize) -> Result<DynamicSlot> {
        let desc = DescriptorPoolDesc::new(1)
            .with_size(self.desc_type, self.capacity)
            .with_flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);
        let pool = render.create_descriptor_pool(&desc, &format!("{}_{idx}", self.name))?;
        let set = match render.allocate_descriptor_sets(pool, &[self.layout], Some(&[self.capacity])) {
            Ok(sets) => sets[0],
            Err(e) => {
                render.destroy_descriptor_pool(pool);
                return Err(e);
            }
        };
        Ok(DynamicSlot {
            pool,
            set,
            capacity: self.capacity,
            needs_resize: false,
            pending: Vec::new(),
        })
    }

    /// Store descriptors and return their indices.
    ///
    /// Released indices are reused first. When they run out the array doubles,
    /// or grows to fit `data` if that is more.
    pub fn write(&mut self, data: &[DescriptorData]) -> Result<Vec<u32>> {
        if let Some(bad) = data.iter().find(|d| d.descriptor_type() != self.desc_type) {
            return Err(seaglass_core::Error::InvalidData(format!(
                "{}: expected {:?} descriptors, got {:?}",
                self.name,
                self.desc_type,
                bad.descriptor_type()
            ))
            .into());
        }

        let needed = data.len() as u32;
        let free = self.free.len() as u32;
        if needed > free {
            self.grow(self.count() + needed)?;
        }

        let mut indices = Vec::with_capacity(data.len());
        for d in data {
            let idx = self
                .free
                .pull()
                .ok_or_else(|| seaglass_core::Error::Exhausted(self.name.clone()))?;
            self.descriptors[idx as usize] = Some(*d);
            self.ready[idx as usize] = 0;
            for slot in &mut self.slots {
                slot.pending.push(idx);
            }
            indices.push(idx);
        }
        Ok(indices)
    }

    fn grow(&mut self, required: u32) -> Result<()> {
        if required > self.max_capacity {
            return Err(seaglass_core::Error::CapacityExceeded {
                name: self.name.clone(),
                requested: u64::from(required),
                available: u64::from(self.max_capacity - self.count()),
                capacity: u64::from(self.max_capacity),
            }
            .into());
        }

        // Doubling below one page, whole pages above it.
        let step = if self.capacity < DYN_DESC_PAGE_SIZE {
            self.capacity.saturating_mul(2)
        } else {
            required.div_ceil(DYN_DESC_PAGE_SIZE).saturating_mul(DYN_DESC_PAGE_SIZE)
        };
        let capacity = step.max(required).min(self.max_capacity);
        self.free.grow(capacity);
        self.descriptors.resize(capacity as usize, None);
        self.ready.resize(capacity as usize, 0);
        self.capacity = capacity;
        self.resize_count += 1;
        for slot in &mut self.slots {
            slot.needs_resize = true;
        }
        tracing::debug!(pool = %self.name, capacity, "Grew dynamic descriptor pool");
        Ok(())
    }

    /// Return `idx` for reuse. The slot sets keep the stale descriptor until
    /// the index is written again.
    pub fn release(&mut self, idx: u32) -> Result<()> {
        self.free.give_back(idx)?;
        self.descriptors[idx as usize] = None;
        self.ready[idx as usize] = 0;
        Ok(())
    }

    /// Contents stored at `idx`, if it is live.
    pub fn descriptor(&self, idx: u32) -> Option<DescriptorData> {
        self.descriptors.get(idx as usize).copied().flatten()
    }

    /// Bring the current slot up to date. Call after `begin_frame`, once the
    /// slot's previous frame has retired.
    pub fn tick(&mut self, render: &RenderSystem) -> Result<()> {
        let idx = render.frame_idx();
        if self.slots[idx].needs_resize {
            let fresh = self.create_slot(render, idx)?;
            let old = std::mem::replace(&mut self.slots[idx], fresh);
            render.destroy_descriptor_pool(old.pool);

            let live: Vec<u32> = (0..self.capacity)
                .filter(|&i| self.descriptors[i as usize].is_some())
                .collect();
            self.write_slot(render, idx, &live);
            tracing::debug!(
                pool = %self.name,
                slot = idx,
                capacity = self.capacity,
                rewritten = live.len(),
                "Recreated dynamic descriptor slot"
            );
        } else {
            let pending = std::mem::take(&mut self.slots[idx].pending);
            self.write_slot(render, idx, &pending);
        }
        Ok(())
    }

    fn write_slot(&mut self, render: &RenderSystem, slot: usize, indices: &[u32]) {
        let set = self.slots[slot].set;
        let bit = 1u8 << slot;
        let mut writes = Vec::with_capacity(indices.len());
        for &i in indices {
            // Released since it was queued
            let Some(data) = self.descriptors[i as usize] else {
                continue;
            };
            writes.push(DescriptorWrite {
                set,
                binding: self.binding,
                array_element: i,
                data,
            });
            self.ready[i as usize] |= bit;
        }
        render.update_descriptors(&writes);
    }

    /// Whether every slot's set holds descriptor `idx`.
    pub fn is_ready(&self, idx: u32) -> bool {
        self.descriptor(idx).is_some() && self.ready[idx as usize] == ALL_SLOTS
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Live descriptors.
    pub fn count(&self) -> u32 {
        self.capacity - self.free.len() as u32
    }

    /// Number of times the array has grown.
    pub const fn resize_count(&self) -> u32 {
        self.resize_count
    }

    /// The current slot's set.
    pub fn set(&self, render: &RenderSystem) -> vk::DescriptorSet {
        self.slots[render.frame_idx()].set
    }

    /// Size of the array in the set of `slot`, which lags [`capacity`](Self::capacity)
    /// until that slot ticks.
    pub fn slot_capacity(&self, slot: usize) -> u32 {
        self.slots.get(slot).map_or(0, |s| s.capacity)
    }

    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Destroy the pools and layout. No frame using them may be in flight.
    pub fn destroy(&mut self, render: &RenderSystem) {
        for slot in self.slots.drain(..) {
            render.destroy_descriptor_pool(slot.pool);
        }
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
    use seaglass_gpu::{RecordingDevice, ResourceKind};
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

    /// Run one empty frame, ticking `pool` in it.
    fn frame(render: &mut RenderSystem, pool: &mut DynamicDescriptorPool) {
        render.begin_frame().unwrap();
        pool.tick(render).unwrap();
        render.submit_frame().unwrap();
    }

    fn bindless(render: &RenderSystem, initial: u32) -> DynamicDescriptorPool {
        DynamicDescriptorPool::new(
            render,
            "textures",
            0,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::ShaderStageFlags::FRAGMENT,
            initial,
            1024,
        )
        .unwrap()
    }

    #[test]
    fn fifth_texture_grows_pool_once() {
        let (device, mut render) = render();
        let mut pool = bindless(&render, 4);

        let data: Vec<_> = (1..=5).map(|i| texture(0x100 + i)).collect();
        let indices = pool.write(&data).unwrap();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.resize_count(), 1);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.count(), 5);
        assert_eq!(pool.descriptor(4), Some(texture(0x105)));

        for _ in 0..FRAME_STATE_COUNT {
            frame(&mut render, &mut pool);
        }
        for slot in 0..FRAME_STATE_COUNT {
            assert_eq!(pool.slot_capacity(slot), 8);
        }
        assert!(indices.iter().all(|&i| pool.is_ready(i)));

        // The current slot's set holds the data through the device
        render.wait_idle().unwrap();
        let set = pool.set(&render);
        assert_eq!(device.descriptor(set, 0, 4), Some(texture(0x105)));
        // One layout, one pool per slot
        assert_eq!(device.live(ResourceKind::DescriptorPool), FRAME_STATE_COUNT as u32);
    }

    #[test]
    fn count_never_exceeds_capacity() {
        let (_device, render) = render();
        let mut pool = bindless(&render, 2);

        let mut live = Vec::new();
        for round in 0..20u64 {
            live.extend(pool.write(&[texture(round + 1)]).unwrap());
            if round % 3 == 0 {
                let idx = live.remove(0);
                pool.release(idx).unwrap();
            }
            assert!(pool.count() <= pool.capacity());
            assert_eq!(pool.count() as usize, live.len());
        }
        assert!(pool.release(live[0]).is_ok());
        assert!(pool.release(live[0]).is_err());
    }

    #[test]
    fn large_pools_grow_by_pages() {
        let (_device, render) = render();
        let mut pool = DynamicDescriptorPool::new(
            &render,
            "paged",
            0,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::ShaderStageFlags::FRAGMENT,
            DYN_DESC_PAGE_SIZE,
            DYN_DESC_PAGE_SIZE * 8,
        )
        .unwrap();
        let data: Vec<_> = (0..=u64::from(DYN_DESC_PAGE_SIZE)).map(|i| texture(i + 1)).collect();
        pool.write(&data).unwrap();
        assert_eq!(pool.capacity(), DYN_DESC_PAGE_SIZE * 2);

        let more: Vec<_> = (0..u64::from(DYN_DESC_PAGE_SIZE)).map(|i| texture(i + 500)).collect();
        pool.write(&more).unwrap();
        assert_eq!(pool.capacity(), DYN_DESC_PAGE_SIZE * 3);
        assert_eq!(pool.resize_count(), 2);
    }

    #[test]
    fn released_indices_are_reused_first() {
        let (_device, render) = render();
        let mut pool = bindless(&render, 4);
        let first = pool.write(&[texture(1), texture(2), texture(3)]).unwrap();
        pool.release(first[1]).unwrap();

        assert_eq!(pool.write(&[texture(9)]).unwrap(), vec![first[1]]);
        assert_eq!(pool.resize_count(), 0);
        assert_eq!(pool.descriptor(first[1]), Some(texture(9)));
    }

    #[test]
    fn writes_reach_slots_one_tick_at_a_time() {
        let (_device, mut render) = render();
        let mut pool = bindless(&render, 4);
        let idx = pool.write(&[texture(7)]).unwrap()[0];

        for _ in 0..FRAME_STATE_COUNT - 1 {
            frame(&mut render, &mut pool);
            assert!(!pool.is_ready(idx));
        }
        frame(&mut render, &mut pool);
        assert!(pool.is_ready(idx));
        render.wait_idle().unwrap();
    }

    #[test]
    fn wrong_descriptor_type_is_rejected() {
        let (_device, render) = render();
        let mut pool = bindless(&render, 4);
        let buffer = DescriptorData::storage_buffer(vk::Buffer::from_raw(5), 0, 64);
        assert!(pool.write(&[texture(1), buffer]).is_err());
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn growth_is_bounded() {
        let (_device, render) = render();
        let mut pool = DynamicDescriptorPool::new(
            &render,
            "small",
            0,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::ShaderStageFlags::FRAGMENT,
            2,
            3,
        )
        .unwrap();
        pool.write(&[texture(1), texture(2)]).unwrap();
        pool.write(&[texture(3)]).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert!(matches!(
            pool.write(&[texture(4)]),
            Err(RenderError::Core(seaglass_core::Error::CapacityExceeded { .. }))
        ));
    }

    #[test]
    fn frame_pool_regrows_only_current_slot() {
        let (device, mut render) = render();
        let layout = render
            .create_descriptor_set_layout(
                &DescriptorSetLayoutBuilder::new()
                    .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
                    .build(),
                "fxaa",
            )
            .unwrap();
        let desc = DescriptorPoolDesc::new(1).with_size(vk::DescriptorType::SAMPLED_IMAGE, 1);
        let mut pool = FrameDescriptorPool::new("fxaa");

        render.begin_frame().unwrap();
        render
            .frame_desc_pool_tick(&mut pool, &desc, &[layout], None)
            .unwrap();
        assert_eq!(pool.set_count(&render), 1);
        assert!(pool.set(&render, 0).is_some());
        render.submit_frame().unwrap();

        render.begin_frame().unwrap();
        render
            .frame_desc_pool_tick(&mut pool, &desc, &[layout; 3], None)
            .unwrap();
        assert_eq!(pool.capacity(0), 1);
        assert_eq!(pool.capacity(1), 3);
        assert_eq!(pool.set_count(&render), 3);
        render.submit_frame().unwrap();
        render.wait_idle().unwrap();

        // Slot 0 again: same capacity, so the pool is reset and reused
        let pools_before = device.created(ResourceKind::DescriptorPool);
        render.begin_frame().unwrap();
        render.submit_frame().unwrap();
        render.begin_frame().unwrap();
        assert_eq!(render.frame_idx(), 0);
        render
            .frame_desc_pool_tick(&mut pool, &desc, &[layout], None)
            .unwrap();
        assert_eq!(device.created(ResourceKind::DescriptorPool), pools_before);
        render.submit_frame().unwrap();
        render.wait_idle().unwrap();

        pool.destroy(&render);
        render.destroy_descriptor_set_layout(layout);
        assert_eq!(device.live(ResourceKind::DescriptorPool), 0);
    }

    #[test]
    fn set_pool_grows_monotonically() {
        let (device, render) = render();
        let layout = render
            .create_descriptor_set_layout(
                &DescriptorSetLayoutBuilder::new()
                    .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
                    .build(),
                "camera",
            )
            .unwrap();
        let desc = DescriptorPoolDesc::new(1).with_size(vk::DescriptorType::UNIFORM_BUFFER, 1);
        let mut pool = DescriptorSetPool::new("camera");

        assert!(pool.resize(&render, &desc, &[layout; 2]).unwrap());
        let sets = pool.sets().to_vec();
        assert!(!pool.resize(&render, &desc, &[layout]).unwrap());
        assert_eq!(pool.sets(), sets.as_slice());
        assert!(pool.resize(&render, &desc, &[layout; 4]).unwrap());
        assert_eq!(pool.capacity(), 4);
        assert_eq!(device.live(ResourceKind::DescriptorPool), 1);

        pool.destroy(&render);
        assert_eq!(device.live(ResourceKind::DescriptorPool), 0);
    }
}
