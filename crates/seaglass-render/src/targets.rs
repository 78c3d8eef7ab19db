//! Render targets: per-slot images with full and per-subresource views.

use crate::error::{RenderError, Result};
use crate::render_system::RenderSystem;
use ash::vk;
use seaglass_core::constants::{FRAME_STATE_COUNT, SHADOW_CASCADE_COUNT};
use seaglass_core::RenderTargetId;
use seaglass_gpu::memory::{aspect_for_format, is_depth_format};
use seaglass_gpu::GpuImage;

/// Side length of each shadow cascade.
pub const SHADOW_MAP_SIZE: u32 = 2048;
/// Mip levels in the bloom chain.
pub const BLOOM_MIP_COUNT: u32 = 5;

/// Shape of a render target.
#[derive(Debug, Clone)]
pub struct RenderTargetDesc {
    pub name: String,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_count: u32,
    pub layer_count: u32,
    pub view_type: vk::ImageViewType,
}

impl RenderTargetDesc {
    pub fn new_2d(name: impl Into<String>, format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_count: 1,
            layer_count: 1,
            view_type: vk::ImageViewType::TYPE_2D,
        }
    }

    #[must_use]
    pub const fn with_mips(mut self, mip_count: u32) -> Self {
        self.mip_count = mip_count;
        self
    }

    /// Layered target viewed as a 2D array.
    #[must_use]
    pub const fn with_layers(mut self, layer_count: u32) -> Self {
        self.layer_count = layer_count;
        self.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
        self
    }

    fn usage(&self) -> vk::ImageUsageFlags {
        if is_depth_format(self.format) {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
        }
    }

    fn image_info(&self) -> vk::ImageCreateInfo<'static> {
        let flags = if self.view_type == vk::ImageViewType::CUBE
            || self.view_type == vk::ImageViewType::CUBE_ARRAY
        {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(self.mip_count.max(1))
            .array_layers(self.layer_count.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }

    fn range(&self, base_mip: u32, mips: u32, base_layer: u32, layers: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_for_format(self.format),
            base_mip_level: base_mip,
            level_count: mips,
            base_array_layer: base_layer,
            layer_count: layers,
        }
    }
}

enum TargetImages {
    Owned(Vec<GpuImage>),
    Imported(Vec<vk::Image>),
}

struct RenderTarget {
    desc: RenderTargetDesc,
    images: TargetImages,
    /// Full view per slot.
    views: Vec<vk::ImageView>,
    /// Per slot, one 2D view per (mip, layer), mip-major.
    sub_views: Vec<Vec<vk::ImageView>>,
}

impl TargetImages {
    fn image(&self, frame: usize) -> vk::Image {
        match self {
            Self::Owned(images) => images[frame].image,
            Self::Imported(images) => images[frame % images.len()],
        }
    }
}

/// Full and per-subresource views of one target, per slot.
type TargetViews = (Vec<vk::ImageView>, Vec<Vec<vk::ImageView>>);

/// Create every view of every slot's image. On failure the views created so
/// far are destroyed and nothing is returned.
fn create_views(
    render: &RenderSystem,
    desc: &RenderTargetDesc,
    images: &TargetImages,
) -> Result<TargetViews> {
    let mut views = Vec::with_capacity(FRAME_STATE_COUNT);
    let mut sub_views = Vec::with_capacity(FRAME_STATE_COUNT);
    match push_views(render, desc, images, &mut views, &mut sub_views) {
        Ok(()) => Ok((views, sub_views)),
        Err(e) => {
            for view in views.into_iter().chain(sub_views.into_iter().flatten()) {
                render.destroy_image_view(view);
            }
            Err(e)
        }
    }
}

fn push_views(
    render: &RenderSystem,
    desc: &RenderTargetDesc,
    images: &TargetImages,
    views: &mut Vec<vk::ImageView>,
    sub_views: &mut Vec<Vec<vk::ImageView>>,
) -> Result<()> {
    for frame in 0..FRAME_STATE_COUNT {
        let image = images.image(frame);
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(desc.range(0, desc.mip_count, 0, desc.layer_count));
        views.push(render.create_image_view(&info, &format!("{}_{frame}", desc.name))?);

        sub_views.push(Vec::with_capacity((desc.mip_count * desc.layer_count) as usize));
        for mip in 0..desc.mip_count {
            for layer in 0..desc.layer_count {
                let info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(desc.format)
                    .subresource_range(desc.range(mip, 1, layer, 1));
                let name = format!("{}_{frame}_m{mip}_l{layer}", desc.name);
                let view = render.create_image_view(&info, &name)?;
                if let Some(subs) = sub_views.last_mut() {
                    subs.push(view);
                }
            }
        }
    }
    Ok(())
}

impl RenderTarget {
    fn release_views(&mut self, render: &mut RenderSystem) {
        for view in self.views.drain(..) {
            render.free_image_view_deferred(view);
        }
        for view in self.sub_views.drain(..).flatten() {
            render.free_image_view_deferred(view);
        }
    }

    fn destroy(self, render: &RenderSystem) -> Result<()> {
        for view in self.views.into_iter().chain(self.sub_views.into_iter().flatten()) {
            render.destroy_image_view(view);
        }
        if let TargetImages::Owned(images) = self.images {
            for image in images {
                render.free_gpu_image(image)?;
            }
        }
        Ok(())
    }
}

/// Owns every render target.
#[derive(Default)]
pub struct RenderTargetSystem {
    targets: Vec<RenderTarget>,
}

fn validate(desc: &mut RenderTargetDesc) -> Result<()> {
    if desc.extent.width == 0 || desc.extent.height == 0 {
        return Err(RenderError::InvalidState(format!(
            "Render target '{}' has an empty extent",
            desc.name
        )));
    }
    desc.mip_count = desc.mip_count.max(1);
    desc.layer_count = desc.layer_count.max(1);
    desc.extent.depth = desc.extent.depth.max(1);
    Ok(())
}

impl RenderTargetSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate one image per frame slot plus their views.
    pub fn create_render_target(
        &mut self,
        render: &RenderSystem,
        mut desc: RenderTargetDesc,
    ) -> Result<RenderTargetId> {
        validate(&mut desc)?;
        let info = desc.image_info();

        let mut images = Vec::with_capacity(FRAME_STATE_COUNT);
        for frame in 0..FRAME_STATE_COUNT {
            match render.alloc_gpu_image(&info, &format!("{}_{frame}", desc.name)) {
                Ok(image) => images.push(image),
                Err(e) => {
                    for image in images {
                        render.free_gpu_image(image)?;
                    }
                    return Err(e);
                }
            }
        }

        self.insert(
            render,
            RenderTarget {
                desc,
                images: TargetImages::Owned(images),
                views: Vec::new(),
                sub_views: Vec::new(),
            },
        )
    }

    /// Wrap images owned elsewhere, such as swapchain images. Slot `i` uses
    /// `images[i % images.len()]`.
    pub fn import_render_target(
        &mut self,
        render: &RenderSystem,
        mut desc: RenderTargetDesc,
        images: &[vk::Image],
    ) -> Result<RenderTargetId> {
        validate(&mut desc)?;
        if images.is_empty() {
            return Err(RenderError::InvalidState(format!(
                "Render target '{}' imported without images",
                desc.name
            )));
        }
        self.insert(
            render,
            RenderTarget {
                desc,
                images: TargetImages::Imported(images.to_vec()),
                views: Vec::new(),
                sub_views: Vec::new(),
            },
        )
    }

    fn insert(&mut self, render: &RenderSystem, mut target: RenderTarget) -> Result<RenderTargetId> {
        match create_views(render, &target.desc, &target.images) {
            Ok((views, sub_views)) => {
                target.views = views;
                target.sub_views = sub_views;
            }
            Err(e) => {
                target.destroy(render)?;
                return Err(e);
            }
        }
        let id = RenderTargetId(self.targets.len() as u32);
        tracing::debug!(
            name = %target.desc.name,
            format = ?target.desc.format,
            width = target.desc.extent.width,
            height = target.desc.extent.height,
            mips = target.desc.mip_count,
            layers = target.desc.layer_count,
            imported = matches!(target.images, TargetImages::Imported(_)),
            "Created render target {id}"
        );
        self.targets.push(target);
        Ok(id)
    }

    /// Rebind an imported target to new images, e.g. after a swapchain resize.
    pub fn reimport_render_target(
        &mut self,
        render: &mut RenderSystem,
        id: RenderTargetId,
        extent: vk::Extent2D,
        images: &[vk::Image],
    ) -> Result<()> {
        let target = self.get_mut(id)?;
        if !matches!(target.images, TargetImages::Imported(_)) {
            return Err(RenderError::InvalidState(format!(
                "Render target '{}' is not imported",
                target.desc.name
            )));
        }
        if images.is_empty() || extent.width == 0 || extent.height == 0 {
            return Err(RenderError::InvalidState(format!(
                "Render target '{}' reimported without images or extent",
                target.desc.name
            )));
        }

        // The target keeps its old images and views unless every new view exists
        let mut desc = target.desc.clone();
        desc.extent.width = extent.width;
        desc.extent.height = extent.height;
        let new_images = TargetImages::Imported(images.to_vec());
        let (views, sub_views) = create_views(render, &desc, &new_images)?;

        target.release_views(render);
        target.desc = desc;
        target.images = new_images;
        target.views = views;
        target.sub_views = sub_views;
        tracing::debug!(width = extent.width, height = extent.height, "Reimported render target {id}");
        Ok(())
    }

    /// Recreate an owned target at a new size. The old images are freed once
    /// the frames using them retire.
    pub fn resize_render_target(
        &mut self,
        render: &mut RenderSystem,
        id: RenderTargetId,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let target = self.get(id)?;
        if !matches!(target.images, TargetImages::Owned(_)) {
            return Err(RenderError::InvalidState(format!(
                "Render target '{}' is imported; reimport it instead",
                target.desc.name
            )));
        }
        let mut desc = target.desc.clone();
        desc.extent.width = extent.width;
        desc.extent.height = extent.height;

        // Build the replacement first so a failure leaves the old target intact
        let mut replacement = Self::new();
        let new_id = replacement.create_render_target(render, desc)?;
        let fresh = replacement.targets.swap_remove(new_id.index());

        let mut old = std::mem::replace(&mut self.targets[id.index()], fresh);
        old.release_views(render);
        if let TargetImages::Owned(images) = old.images {
            for image in images {
                render.free_gpu_image_deferred(image);
            }
        }
        Ok(())
    }

    fn get(&self, id: RenderTargetId) -> Result<&RenderTarget> {
        self.targets
            .get(id.index())
            .ok_or(RenderError::UnknownRenderTarget(id))
    }

    fn get_mut(&mut self, id: RenderTargetId) -> Result<&mut RenderTarget> {
        self.targets
            .get_mut(id.index())
            .ok_or(RenderError::UnknownRenderTarget(id))
    }

    pub fn contains(&self, id: RenderTargetId) -> bool {
        id.index() < self.targets.len()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn desc(&self, id: RenderTargetId) -> Result<&RenderTargetDesc> {
        Ok(&self.get(id)?.desc)
    }

    pub fn is_imported(&self, id: RenderTargetId) -> Result<bool> {
        Ok(matches!(self.get(id)?.images, TargetImages::Imported(_)))
    }

    pub fn format(&self, id: RenderTargetId) -> Result<vk::Format> {
        Ok(self.get(id)?.desc.format)
    }

    pub fn extent(&self, id: RenderTargetId) -> Result<vk::Extent3D> {
        Ok(self.get(id)?.desc.extent)
    }

    /// Extent of `mip`, never smaller than one texel per axis.
    pub fn mip_extent(&self, id: RenderTargetId, mip: u32) -> Result<vk::Extent3D> {
        let extent = self.extent(id)?;
        let shrink = |v: u32| v.checked_shr(mip).unwrap_or(0).max(1);
        Ok(vk::Extent3D {
            width: shrink(extent.width),
            height: shrink(extent.height),
            depth: shrink(extent.depth),
        })
    }

    pub fn mip_count(&self, id: RenderTargetId) -> Result<u32> {
        Ok(self.get(id)?.desc.mip_count)
    }

    pub fn layer_count(&self, id: RenderTargetId) -> Result<u32> {
        Ok(self.get(id)?.desc.layer_count)
    }

    /// Subresource range covering every mip and layer.
    pub fn full_range(&self, id: RenderTargetId) -> Result<vk::ImageSubresourceRange> {
        let desc = &self.get(id)?.desc;
        Ok(desc.range(0, desc.mip_count, 0, desc.layer_count))
    }

    pub fn image(&self, frame: usize, id: RenderTargetId) -> Result<vk::Image> {
        Ok(self.get(id)?.images.image(frame % FRAME_STATE_COUNT))
    }

    pub fn view(&self, frame: usize, id: RenderTargetId) -> Result<vk::ImageView> {
        let target = self.get(id)?;
        target
            .views
            .get(frame % FRAME_STATE_COUNT)
            .copied()
            .ok_or_else(|| RenderError::ResourceNotFound(format!("'{}' has no views", target.desc.name)))
    }

    /// 2D view of a single mip and layer.
    pub fn sub_view(
        &self,
        frame: usize,
        id: RenderTargetId,
        mip: u32,
        layer: u32,
    ) -> Result<vk::ImageView> {
        let target = self.get(id)?;
        let desc = &target.desc;
        if mip >= desc.mip_count || layer >= desc.layer_count {
            return Err(RenderError::ResourceNotFound(format!(
                "'{}' has no mip {mip} layer {layer}",
                desc.name
            )));
        }
        let idx = (mip * desc.layer_count + layer) as usize;
        target
            .sub_views
            .get(frame % FRAME_STATE_COUNT)
            .and_then(|subs| subs.get(idx))
            .copied()
            .ok_or_else(|| RenderError::ResourceNotFound(format!("'{}' has no views", desc.name)))
    }

    /// Destroy every target. No frame may be in flight.
    pub fn destroy(&mut self, render: &RenderSystem) -> Result<()> {
        let count = self.targets.len();
        for target in self.targets.drain(..) {
            target.destroy(render)?;
        }
        tracing::debug!(count, "Destroyed render targets");
        Ok(())
    }
}

/// Where the final image of the standard graph goes.
#[derive(Debug, Clone, Copy)]
pub enum OutputTarget<'a> {
    /// Render into images owned by the target system.
    Owned(vk::Format),
    /// Render into external images, e.g. a swapchain.
    Imported {
        format: vk::Format,
        images: &'a [vk::Image],
    },
}

/// The render targets used by the standard pass graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardTargets {
    pub depth: RenderTargetId,
    pub normal: RenderTargetId,
    pub hdr_color: RenderTargetId,
    pub depth_copy: RenderTargetId,
    pub color_copy: RenderTargetId,
    pub shadow_map: RenderTargetId,
    pub brightness: RenderTargetId,
    pub bloom: RenderTargetId,
    pub ldr_color: RenderTargetId,
    pub output: RenderTargetId,
}

impl StandardTargets {
    pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
    pub const NORMAL_FORMAT: vk::Format = vk::Format::A2B10G10R10_UNORM_PACK32;
    pub const HDR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
    pub const DEPTH_COPY_FORMAT: vk::Format = vk::Format::R32_SFLOAT;
    pub const LDR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    pub fn create(
        targets: &mut RenderTargetSystem,
        render: &RenderSystem,
        extent: vk::Extent2D,
        output: OutputTarget<'_>,
    ) -> Result<Self> {
        let vk::Extent2D { width, height } = extent;
        let (half_w, half_h) = ((width / 2).max(1), (height / 2).max(1));
        let mut create = |desc| targets.create_render_target(render, desc);

        let depth = create(RenderTargetDesc::new_2d("depth", Self::DEPTH_FORMAT, width, height))?;
        let normal = create(RenderTargetDesc::new_2d("normal", Self::NORMAL_FORMAT, width, height))?;
        let hdr_color = create(RenderTargetDesc::new_2d("hdr_color", Self::HDR_FORMAT, width, height))?;
        let depth_copy = create(RenderTargetDesc::new_2d(
            "depth_copy",
            Self::DEPTH_COPY_FORMAT,
            width,
            height,
        ))?;
        let color_copy = create(RenderTargetDesc::new_2d("color_copy", Self::HDR_FORMAT, width, height))?;
        let shadow_map = create(
            RenderTargetDesc::new_2d("shadow_map", Self::DEPTH_FORMAT, SHADOW_MAP_SIZE, SHADOW_MAP_SIZE)
                .with_layers(SHADOW_CASCADE_COUNT as u32),
        )?;
        let brightness = create(RenderTargetDesc::new_2d("brightness", Self::HDR_FORMAT, half_w, half_h))?;
        let bloom = create(
            RenderTargetDesc::new_2d("bloom", Self::HDR_FORMAT, half_w, half_h).with_mips(BLOOM_MIP_COUNT),
        )?;
        let ldr_color = create(RenderTargetDesc::new_2d("ldr_color", Self::LDR_FORMAT, width, height))?;

        let output = match output {
            OutputTarget::Owned(format) => {
                create(RenderTargetDesc::new_2d("output", format, width, height))?
            }
            OutputTarget::Imported { format, images } => targets.import_render_target(
                render,
                RenderTargetDesc::new_2d("output", format, width, height),
                images,
            )?,
        };

        tracing::info!(width, height, "Created standard render targets");
        Ok(Self {
            depth,
            normal,
            hdr_color,
            depth_copy,
            color_copy,
            shadow_map,
            brightness,
            bloom,
            ldr_color,
            output,
        })
    }

    /// Targets whose size follows the output.
    pub const fn screen_targets(&self) -> [RenderTargetId; 8] {
        [
            self.depth,
            self.normal,
            self.hdr_color,
            self.depth_copy,
            self.color_copy,
            self.brightness,
            self.bloom,
            self.ldr_color,
        ]
    }

    /// Resize every screen-sized target and, when owned, the output.
    /// Imported output must be reimported separately.
    pub fn resize(
        &self,
        targets: &mut RenderTargetSystem,
        render: &mut RenderSystem,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let half = vk::Extent2D {
            width: (extent.width / 2).max(1),
            height: (extent.height / 2).max(1),
        };
        for id in self.screen_targets() {
            let size = if id == self.brightness || id == self.bloom {
                half
            } else {
                extent
            };
            targets.resize_render_target(render, id, size)?;
        }
        if !targets.is_imported(self.output)? {
            targets.resize_render_target(render, self.output, extent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use ash::vk::Handle;
    use seaglass_gpu::{RecordingDevice, ResourceKind};
    use std::sync::Arc;

    fn setup() -> (Arc<RecordingDevice>, RenderSystem, RenderTargetSystem) {
        let device = Arc::new(RecordingDevice::new());
        let render = RenderSystem::new(
            device.clone(),
            RenderConfig::new().with_temp_buffer_size(256),
        )
        .unwrap();
        (device, render, RenderTargetSystem::new())
    }

    #[test]
    fn owned_target_has_views_per_slot() {
        let (device, render, mut targets) = setup();
        let id = targets
            .create_render_target(
                &render,
                RenderTargetDesc::new_2d("bloom", vk::Format::R16G16B16A16_SFLOAT, 64, 32)
                    .with_mips(3)
                    .with_layers(2),
            )
            .unwrap();

        let n = FRAME_STATE_COUNT as u32;
        assert_eq!(device.created(ResourceKind::Image), n);
        // Full view plus 3 mips x 2 layers per slot
        assert_eq!(device.created(ResourceKind::ImageView), n * 7);

        assert_ne!(targets.image(0, id).unwrap(), targets.image(1, id).unwrap());
        assert_ne!(
            targets.sub_view(0, id, 2, 1).unwrap(),
            targets.sub_view(0, id, 2, 0).unwrap()
        );
        assert!(targets.sub_view(0, id, 3, 0).is_err());
        assert_eq!(
            device.name_of(targets.sub_view(1, id, 1, 1).unwrap()).as_deref(),
            Some("bloom_1_m1_l1")
        );

        let mip2 = targets.mip_extent(id, 2).unwrap();
        assert_eq!((mip2.width, mip2.height), (16, 8));
        let tiny = targets.mip_extent(id, 10).unwrap();
        assert_eq!((tiny.width, tiny.height, tiny.depth), (1, 1, 1));

        targets.destroy(&render).unwrap();
        assert_eq!(device.live(ResourceKind::Image), 0);
        assert_eq!(device.live(ResourceKind::ImageView), 0);
    }

    #[test]
    fn unknown_target_is_reported() {
        let (_device, _render, targets) = setup();
        let missing = RenderTargetId(9);
        assert_eq!(
            targets.format(missing),
            Err(RenderError::UnknownRenderTarget(missing))
        );
        assert!(!targets.contains(missing));
    }

    #[test]
    fn imported_target_cycles_images_and_reimports() {
        let (device, mut render, mut targets) = setup();
        let images = [vk::Image::from_raw(0xA1), vk::Image::from_raw(0xA2)];
        let id = targets
            .import_render_target(
                &render,
                RenderTargetDesc::new_2d("swapchain", vk::Format::B8G8R8A8_SRGB, 800, 600),
                &images,
            )
            .unwrap();
        assert_eq!(targets.image(2, id).unwrap(), images[0]);
        assert_eq!(device.created(ResourceKind::Image), 0);
        let old_view = targets.view(0, id).unwrap();

        let resized = [vk::Image::from_raw(0xB1)];
        targets
            .reimport_render_target(
                &mut render,
                id,
                vk::Extent2D {
                    width: 1024,
                    height: 768,
                },
                &resized,
            )
            .unwrap();
        assert_eq!(targets.image(1, id).unwrap(), resized[0]);
        assert_eq!(targets.extent(id).unwrap().width, 1024);
        assert_ne!(targets.view(0, id).unwrap(), old_view);
        // Old views wait for the frames that may use them
        assert_eq!(render.pending_deletions(), 2 * FRAME_STATE_COUNT);

        assert!(targets
            .import_render_target(
                &render,
                RenderTargetDesc::new_2d("empty", vk::Format::B8G8R8A8_SRGB, 8, 8),
                &[],
            )
            .is_err());
    }

    #[test]
    fn failed_reimport_keeps_the_previous_views() {
        let (device, mut render, mut targets) = setup();
        let images = [vk::Image::from_raw(0xA1)];
        let id = targets
            .import_render_target(
                &render,
                RenderTargetDesc::new_2d("swapchain", vk::Format::B8G8R8A8_SRGB, 800, 600),
                &images,
            )
            .unwrap();
        let views: Vec<_> = (0..FRAME_STATE_COUNT)
            .map(|frame| targets.view(frame, id).unwrap())
            .collect();
        let live = device.live(ResourceKind::ImageView);

        // Fail halfway through the second slot
        device.fail_image_view_after(3);
        let extent = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        assert!(targets
            .reimport_render_target(&mut render, id, extent, &[vk::Image::from_raw(0xB1)])
            .is_err());

        assert_eq!(device.live(ResourceKind::ImageView), live);
        assert_eq!(render.pending_deletions(), 0);
        assert_eq!(targets.extent(id).unwrap().width, 800);
        assert_eq!(targets.image(0, id).unwrap(), images[0]);
        for (frame, view) in views.iter().enumerate() {
            assert_eq!(targets.view(frame, id).unwrap(), *view);
            assert!(targets.sub_view(frame, id, 0, 0).is_ok());
        }
    }

    #[test]
    fn owned_targets_cannot_be_reimported() {
        let (_device, mut render, mut targets) = setup();
        let id = targets
            .create_render_target(
                &render,
                RenderTargetDesc::new_2d("depth", vk::Format::D32_SFLOAT, 8, 8),
            )
            .unwrap();
        let extent = vk::Extent2D {
            width: 16,
            height: 16,
        };
        assert!(targets
            .reimport_render_target(&mut render, id, extent, &[vk::Image::from_raw(1)])
            .is_err());

        let old = targets.image(0, id).unwrap();
        targets.resize_render_target(&mut render, id, extent).unwrap();
        assert_ne!(targets.image(0, id).unwrap(), old);
        assert_eq!(targets.extent(id).unwrap().height, 16);
        // Two views and one image per slot
        assert_eq!(render.pending_deletions(), 3 * FRAME_STATE_COUNT);
    }

    #[test]
    fn standard_targets_cover_the_graph() {
        let (device, render, mut targets) = setup();
        let std_targets = StandardTargets::create(
            &mut targets,
            &render,
            vk::Extent2D {
                width: 320,
                height: 240,
            },
            OutputTarget::Owned(StandardTargets::LDR_FORMAT),
        )
        .unwrap();

        assert_eq!(targets.len(), 10);
        assert_eq!(
            targets.layer_count(std_targets.shadow_map).unwrap(),
            SHADOW_CASCADE_COUNT as u32
        );
        assert_eq!(targets.mip_count(std_targets.bloom).unwrap(), BLOOM_MIP_COUNT);
        assert_eq!(targets.extent(std_targets.brightness).unwrap().width, 160);
        assert_eq!(
            targets.format(std_targets.depth).unwrap(),
            StandardTargets::DEPTH_FORMAT
        );
        assert_eq!(device.created(ResourceKind::Image), 10 * FRAME_STATE_COUNT as u32);
    }
}
