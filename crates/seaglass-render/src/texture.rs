//! Ref-counted sampled textures.

use crate::error::{RenderError, Result};
use crate::render_system::RenderSystem;
use ash::vk;
use seaglass_core::hash::resource_key;
use seaglass_core::{ResourceRegistry, TextureId};
use seaglass_gpu::memory::aspect_for_format;
use seaglass_gpu::GpuImage;

/// Decoded pixel data ready for upload.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub mip_count: u32,
    pub layer_count: u32,
    pub bytes: Vec<u8>,
    /// Copy regions into the image. Empty uploads `bytes` as mip 0 of every layer.
    pub regions: Vec<vk::BufferImageCopy>,
}

impl TextureData {
    /// A single-mip 2D texture.
    pub fn new_2d(width: u32, height: u32, format: vk::Format, bytes: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            mip_count: 1,
            layer_count: 1,
            bytes,
            regions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mips(mut self, mip_count: u32, regions: Vec<vk::BufferImageCopy>) -> Self {
        self.mip_count = mip_count.max(1);
        self.regions = regions;
        self
    }

    #[must_use]
    pub const fn with_layers(mut self, layer_count: u32) -> Self {
        self.layer_count = if layer_count == 0 { 1 } else { layer_count };
        self
    }

    fn image_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            })
            .mip_levels(self.mip_count)
            .array_layers(self.layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

/// A resident texture.
#[derive(Debug)]
pub struct Texture {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl Texture {
    pub const fn extent(&self) -> vk::Extent3D {
        self.image.extent
    }

    pub const fn format(&self) -> vk::Format {
        self.image.format
    }
}

/// Loads each `(path, name)` pair once and shares it between users.
pub struct TextureSystem {
    textures: ResourceRegistry<Texture>,
}

impl Default for TextureSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureSystem {
    pub fn new() -> Self {
        Self {
            textures: ResourceRegistry::new("texture"),
        }
    }

    /// Acquire the texture named `name` in `path`.
    ///
    /// `loader` only runs when the texture is not resident. Otherwise its
    /// reference count grows and the existing id is returned.
    pub fn load_texture<F>(
        &mut self,
        render: &mut RenderSystem,
        path: &str,
        name: &str,
        loader: F,
    ) -> Result<TextureId>
    where
        F: FnOnce() -> Result<TextureData>,
    {
        let key = resource_key(path, name);
        let source = format!("{path}:{name}");
        self.textures
            .acquire(key, &source, || upload(render, name, &loader()?))
            .map(TextureId)
    }

    pub fn get_texture(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id.0)
    }

    pub fn image_view(&self, id: TextureId) -> Option<vk::ImageView> {
        self.get_texture(id).map(|t| t.view)
    }

    pub fn ref_count(&self, id: TextureId) -> u32 {
        self.textures.ref_count(id.0)
    }

    /// Number of resident textures.
    pub fn len(&self) -> usize {
        self.textures.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop one reference. The last one frees the texture once no frame in
    /// flight can sample it.
    pub fn release_texture(&mut self, render: &mut RenderSystem, id: TextureId) -> Result<()> {
        if let Some(texture) = self.textures.release(id.0)? {
            render.free_image_view_deferred(texture.view);
            render.free_gpu_image_deferred(texture.image);
        }
        Ok(())
    }

    /// Free every texture. Textures still referenced are freed as well and
    /// reported as leaks.
    pub fn destroy(&mut self, render: &mut RenderSystem) -> Result<()> {
        let live = self.textures.drain_live();
        if live.is_empty() {
            return Ok(());
        }

        let mut sources = Vec::with_capacity(live.len());
        for leaked in live {
            tracing::warn!(
                source = %leaked.source,
                refs = leaked.ref_count,
                "Texture still referenced at shutdown"
            );
            render.free_image_view_deferred(leaked.resource.view);
            render.free_gpu_image_deferred(leaked.resource.image);
            sources.push(leaked.source);
        }
        sources.sort();
        Err(RenderError::LeakedResources {
            kind: self.textures.kind(),
            count: sources.len(),
            sources,
        })
    }
}

fn upload(render: &mut RenderSystem, name: &str, data: &TextureData) -> Result<Texture> {
    let image = render.create_gpu_image_with_data(&data.image_info(), &data.bytes, &data.regions, name)?;

    let view_type = if data.layer_count > 1 {
        vk::ImageViewType::TYPE_2D_ARRAY
    } else {
        vk::ImageViewType::TYPE_2D
    };
    let info = vk::ImageViewCreateInfo::default()
        .image(image.image)
        .view_type(view_type)
        .format(data.format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_for_format(data.format),
            base_mip_level: 0,
            level_count: data.mip_count,
            base_array_layer: 0,
            layer_count: data.layer_count,
        });
    match render.create_image_view(&info, name) {
        Ok(view) => Ok(Texture { image, view }),
        Err(e) => {
            // The upload is already queued on this frame
            render.free_gpu_image_deferred(image);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use seaglass_gpu::{RecordedCommand, RecordingDevice, ResourceKind};
    use std::sync::Arc;

    fn setup() -> (Arc<RecordingDevice>, RenderSystem) {
        let device = Arc::new(RecordingDevice::new());
        let mut render = RenderSystem::new(
            device.clone(),
            RenderConfig::new().with_temp_buffer_size(4096),
        )
        .unwrap();
        render.begin_frame().unwrap();
        (device, render)
    }

    fn checker() -> Result<TextureData> {
        Ok(TextureData::new_2d(
            4,
            4,
            vk::Format::R8G8B8A8_UNORM,
            vec![0xAB; 64],
        ))
    }

    #[test]
    fn repeated_load_shares_one_image() {
        let (device, mut render) = setup();
        let mut textures = TextureSystem::new();
        let mut loads = 0;

        let first = textures
            .load_texture(&mut render, "a.ktx2", "tex1", || {
                loads += 1;
                checker()
            })
            .unwrap();
        let second = textures
            .load_texture(&mut render, "a.ktx2", "tex1", || {
                loads += 1;
                checker()
            })
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(loads, 1);
        assert_eq!(textures.ref_count(first), 2);
        assert_eq!(device.created(ResourceKind::Image), 1);
        assert_eq!(device.created(ResourceKind::ImageView), 1);
        assert_eq!(textures.get_texture(first).unwrap().extent().width, 4);

        render.submit_frame().unwrap();
        render.wait_idle().unwrap();
        let uploads = device
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::CopyBufferToImage { .. }))
            .count();
        assert_eq!(uploads, 1);
    }

    #[test]
    fn last_release_frees_after_frames_retire() {
        let (device, mut render) = setup();
        let mut textures = TextureSystem::new();
        let id = textures
            .load_texture(&mut render, "a.ktx2", "tex1", checker)
            .unwrap();
        textures
            .load_texture(&mut render, "a.ktx2", "tex1", checker)
            .unwrap();

        textures.release_texture(&mut render, id).unwrap();
        assert!(textures.image_view(id).is_some());
        textures.release_texture(&mut render, id).unwrap();
        assert!(textures.image_view(id).is_none());
        assert!(matches!(
            textures.release_texture(&mut render, id),
            Err(RenderError::Core(seaglass_core::Error::ReleaseUnreferenced(_)))
        ));

        // Still owned by the deferred queue until the frames retire
        assert_eq!(device.live(ResourceKind::Image), 1);
        render.submit_frame().unwrap();
        render.shutdown().unwrap();
        assert_eq!(device.live(ResourceKind::Image), 0);
        assert_eq!(device.live(ResourceKind::ImageView), 0);
    }

    #[test]
    fn split_point_between_path_and_name_matters() {
        let (device, mut render) = setup();
        let mut textures = TextureSystem::new();
        let first = textures.load_texture(&mut render, "ab", "c", checker).unwrap();
        let second = textures.load_texture(&mut render, "a", "bc", checker).unwrap();

        assert_ne!(first, second);
        assert_eq!(textures.len(), 2);
        assert_eq!(device.created(ResourceKind::Image), 2);
        render.submit_frame().unwrap();
        render.wait_idle().unwrap();
    }

    #[test]
    fn loader_errors_leave_nothing_behind() {
        let (device, mut render) = setup();
        let mut textures = TextureSystem::new();
        let result = textures.load_texture(&mut render, "broken.ktx2", "tex", || {
            Err(RenderError::ResourceNotFound("broken.ktx2".to_string()))
        });
        assert!(matches!(result, Err(RenderError::ResourceNotFound(_))));
        assert!(textures.is_empty());
        assert_eq!(device.created(ResourceKind::Image), 0);
    }

    #[test]
    fn destroy_reports_leaks() {
        let (device, mut render) = setup();
        let mut textures = TextureSystem::new();
        textures
            .load_texture(&mut render, "b.ktx2", "grass", checker)
            .unwrap();
        let rock = textures
            .load_texture(&mut render, "b.ktx2", "rock", checker)
            .unwrap();
        textures.release_texture(&mut render, rock).unwrap();

        match textures.destroy(&mut render) {
            Err(RenderError::LeakedResources {
                kind,
                count,
                sources,
            }) => {
                assert_eq!(kind, "texture");
                assert_eq!(count, 1);
                assert_eq!(sources, vec!["b.ktx2:grass".to_string()]);
            }
            other => panic!("expected leak report, got {other:?}"),
        }
        assert!(textures.is_empty());

        render.submit_frame().unwrap();
        render.shutdown().unwrap();
        assert_eq!(device.live(ResourceKind::Image), 0);
    }
}
