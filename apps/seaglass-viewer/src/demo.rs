//! The viewer's one feature: a bindless texture table and per-frame uniforms.

use ash::vk;
use seaglass_app::{FeatureSystem, TickContext};
use seaglass_core::TextureId;
use seaglass_gpu::DescriptorData;
use seaglass_render::{DynamicDescriptorPool, TextureData};

const CHECKER_SIZE: u32 = 64;

/// Uploads a checker texture into a bindless table and streams frame
/// uniforms through the temporary buffer every tick.
#[derive(Default)]
pub struct FrameDemo {
    table: Option<DynamicDescriptorPool>,
    checker: Option<TextureId>,
    checker_index: u32,
    elapsed: f32,
}

impl FrameDemo {
    pub fn new() -> Self {
        Self::default()
    }
}

fn checker() -> TextureData {
    let mut bytes = Vec::with_capacity((CHECKER_SIZE * CHECKER_SIZE * 4) as usize);
    for y in 0..CHECKER_SIZE {
        for x in 0..CHECKER_SIZE {
            let v = if (x / 8 + y / 8) % 2 == 0 { 0xFF } else { 0x40 };
            bytes.extend_from_slice(&[v, v, v, 0xFF]);
        }
    }
    TextureData::new_2d(CHECKER_SIZE, CHECKER_SIZE, vk::Format::R8G8B8A8_UNORM, bytes)
}

impl FeatureSystem for FrameDemo {
    fn name(&self) -> &str {
        "frame_demo"
    }

    fn init(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        let id = ctx
            .textures
            .load_texture(ctx.render, "builtin", "checker", || Ok(checker()))?;
        self.checker = Some(id);

        let mut table = DynamicDescriptorPool::new(
            ctx.render,
            "demo_textures",
            0,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE,
            16,
            1024,
        )?;
        let view = ctx
            .textures
            .image_view(id)
            .ok_or_else(|| anyhow::anyhow!("checker texture vanished"))?;
        self.checker_index = table.write(&[DescriptorData::sampled_image(view)])?[0];
        self.table = Some(table);
        Ok(())
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        let Some(table) = &mut self.table else {
            return Ok(());
        };
        table.tick(ctx.render)?;

        self.elapsed += ctx.delta_time;
        let uniforms = [
            self.elapsed,
            ctx.delta_time,
            ctx.frame_number as f32,
            f32::from(u8::from(table.is_ready(self.checker_index))),
        ];
        let offset = ctx.render.copy_pod_to_temp_buffer(&uniforms)?;
        tracing::trace!(frame = ctx.frame_number, offset, "Frame uniforms");
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        if let Some(mut table) = self.table.take() {
            table.destroy(ctx.render);
        }
        if let Some(id) = self.checker.take() {
            ctx.textures.release_texture(ctx.render, id)?;
        }
        Ok(())
    }
}
