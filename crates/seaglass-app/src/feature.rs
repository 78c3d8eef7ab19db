//! The interface between the engine and the systems that feed it.

use seaglass_render::{
    RenderPipelineSystem, RenderSystem, RenderTargetSystem, StandardPasses, StandardTargets,
    TextureSystem,
};

/// Everything a feature may touch during a callback.
pub struct TickContext<'a> {
    pub render: &'a mut RenderSystem,
    pub targets: &'a RenderTargetSystem,
    pub standard_targets: &'a StandardTargets,
    pub pipelines: &'a mut RenderPipelineSystem,
    pub passes: &'a StandardPasses,
    pub textures: &'a mut TextureSystem,
    /// Frame being built; zero during `init`.
    pub frame_number: u64,
    /// Seconds since the previous tick.
    pub delta_time: f32,
}

/// A system that produces GPU work every tick, such as a mesh or sky renderer.
///
/// Features own their pipelines, layouts and buffers. They register draw or
/// dispatch contexts in [`init`](Self::init) and issue batches in
/// [`tick`](Self::tick).
pub trait FeatureSystem {
    fn name(&self) -> &str;

    /// Called once when the feature is added to the engine.
    #[allow(unused_variables)]
    fn init(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called every tick between `begin_frame` and the pipeline flush.
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()>;

    /// Called after the screen-sized targets were recreated. The GPU is idle.
    #[allow(unused_variables)]
    fn resize(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release GPU resources. The GPU is idle. Features shut down in reverse order.
    #[allow(unused_variables)]
    fn shutdown(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}
