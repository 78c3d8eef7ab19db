//! The engine: owns the render stack and runs features once per tick.

use crate::feature::{FeatureSystem, TickContext};
use anyhow::Context;
use ash::vk;
use seaglass_gpu::{GpuContextBuilder, GpuDevice, DEFAULT_PIPELINE_CACHE_PATH};
use seaglass_render::{
    OutputTarget, RenderConfig, RenderPipelineSystem, RenderSystem, RenderTargetSystem, SlotState,
    StandardPasses, StandardTargets, TextureSystem,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Application name reported to Vulkan.
    pub app_name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Pipeline cache file; `None` keeps the cache in memory.
    pub pipeline_cache_path: Option<PathBuf>,
    /// Frames rendered by [`Engine::run_to_limit`].
    pub frame_limit: u64,
    /// Initial output width.
    pub width: u32,
    /// Initial output height.
    pub height: u32,
    /// Format of the final image.
    pub output_format: vk::Format,
    /// External images to render into, e.g. a swapchain. Empty renders into
    /// an owned output target.
    pub output_images: Vec<vk::Image>,
    pub render: RenderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "Seaglass".to_string(),
            validation: cfg!(debug_assertions),
            pipeline_cache_path: Some(PathBuf::from(DEFAULT_PIPELINE_CACHE_PATH)),
            frame_limit: 300,
            width: 1280,
            height: 720,
            output_format: vk::Format::B8G8R8A8_UNORM,
            output_images: Vec::new(),
            render: RenderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub fn with_pipeline_cache_path(mut self, path: Option<PathBuf>) -> Self {
        self.pipeline_cache_path = path;
        self
    }

    #[must_use]
    pub const fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = frames;
        self
    }

    /// A GPU context builder carrying this config's name, validation and cache path.
    pub fn gpu_context_builder(&self) -> GpuContextBuilder {
        GpuContextBuilder::new()
            .app_name(self.app_name.clone())
            .validation(self.validation)
            .pipeline_cache_path(self.pipeline_cache_path.clone())
    }

    /// Set the output dimensions.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub const fn with_output_format(mut self, format: vk::Format) -> Self {
        self.output_format = format;
        self
    }

    /// Render into `images` instead of an owned target.
    #[must_use]
    pub fn with_output_images(mut self, images: Vec<vk::Image>) -> Self {
        self.output_images = images;
        self
    }

    #[must_use]
    pub fn with_render_config(mut self, render: RenderConfig) -> Self {
        self.render = render;
        self
    }

    const fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: if self.width == 0 { 1 } else { self.width },
            height: if self.height == 0 { 1 } else { self.height },
        }
    }
}

/// Frame time statistics over the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    pub min_fps: f64,
    pub max_fps: f64,
    fps_sum: f64,
    timed: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frames: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            timed: 0,
        }
    }
}

impl FrameStats {
    fn record(&mut self, dt: f32) {
        self.frames += 1;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
            self.timed += 1;
        }
    }

    pub fn avg_fps(&self) -> f64 {
        if self.timed == 0 {
            0.0
        } else {
            self.fps_sum / self.timed as f64
        }
    }
}

/// Builds a [`TickContext`] from the engine's fields, leaving `features` free.
macro_rules! tick_context {
    ($engine:ident, $frame:expr, $dt:expr) => {
        TickContext {
            render: &mut $engine.render,
            targets: &$engine.targets,
            standard_targets: &$engine.standard_targets,
            pipelines: &mut $engine.pipelines,
            passes: &$engine.passes,
            textures: &mut $engine.textures,
            frame_number: $frame,
            delta_time: $dt,
        }
    };
}

/// Owns the render stack and drives feature systems.
pub struct Engine {
    render: RenderSystem,
    targets: RenderTargetSystem,
    standard_targets: StandardTargets,
    pipelines: RenderPipelineSystem,
    passes: StandardPasses,
    textures: TextureSystem,
    features: Vec<Box<dyn FeatureSystem>>,
    extent: vk::Extent2D,
    frame_limit: u64,
    last_tick: Option<Instant>,
    stats: FrameStats,
    shut_down: bool,
}

impl Engine {
    /// Build the render stack and the standard pass graph on `device`.
    pub fn new(device: Arc<dyn GpuDevice>, config: EngineConfig) -> anyhow::Result<Self> {
        let extent = config.extent();
        let frame_limit = config.frame_limit;
        let render =
            RenderSystem::new(device, config.render).context("Failed to create render system")?;

        let mut targets = RenderTargetSystem::new();
        let output = if config.output_images.is_empty() {
            OutputTarget::Owned(config.output_format)
        } else {
            OutputTarget::Imported {
                format: config.output_format,
                images: &config.output_images,
            }
        };
        let standard_targets = match StandardTargets::create(&mut targets, &render, extent, output) {
            Ok(t) => t,
            Err(e) => {
                release_targets(&mut targets, &render);
                return Err(e).context("Failed to create render targets");
            }
        };

        let mut pipelines = RenderPipelineSystem::new();
        let passes = match StandardPasses::create(&mut pipelines, &targets, &standard_targets) {
            Ok(p) => p,
            Err(e) => {
                release_targets(&mut targets, &render);
                return Err(e).context("Failed to create render passes");
            }
        };

        tracing::info!(
            width = extent.width,
            height = extent.height,
            passes = pipelines.pass_count(),
            targets = targets.len(),
            "Engine ready"
        );

        Ok(Self {
            render,
            targets,
            standard_targets,
            pipelines,
            passes,
            textures: TextureSystem::new(),
            features: Vec::new(),
            extent,
            frame_limit,
            last_tick: None,
            stats: FrameStats::default(),
            shut_down: false,
        })
    }

    /// Initialize `feature` and append it to the tick order.
    ///
    /// `init` uploads land in the current slot, which must not be flushing;
    /// add features that upload before the first tick or right after `begin_frame`.
    pub fn add_feature(&mut self, feature: impl FeatureSystem + 'static) -> anyhow::Result<()> {
        let mut feature = Box::new(feature);
        let frame = self.render.frame_number();
        let mut ctx = tick_context!(self, frame, 0.0);
        feature
            .init(&mut ctx)
            .with_context(|| format!("Failed to initialize feature '{}'", feature.name()))?;

        tracing::info!(feature = feature.name(), "Added feature");
        self.features.push(feature);
        Ok(())
    }

    /// Run one frame: begin, tick every feature, flush.
    ///
    /// A failing feature or flush still ends the frame, without any of the
    /// frame's batches, so the next tick can proceed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn tick(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        let dt = self
            .last_tick
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32());
        self.last_tick = Some(now);

        if self.shut_down {
            anyhow::bail!("Engine is shut down");
        }
        self.render.begin_frame().context("Failed to begin frame")?;
        let frame = self.render.frame_number();

        let mut failure = None;
        for feature in &mut self.features {
            let mut ctx = tick_context!(self, frame, dt);
            if let Err(e) = feature.tick(&mut ctx) {
                failure = Some(e.context(format!("Feature '{}' failed on frame {frame}", feature.name())));
                break;
            }
        }

        if let Some(e) = failure {
            self.abandon_frame()?;
            return Err(e);
        }

        if let Err(e) = self.pipelines.flush(&mut self.render, &self.targets) {
            self.abandon_frame()?;
            return Err(e).context("Failed to flush frame");
        }
        self.stats.record(dt);
        Ok(())
    }

    /// Drop the frame's batches and submit whatever is left of the slot so
    /// the next tick starts on a fresh one.
    fn abandon_frame(&mut self) -> anyhow::Result<()> {
        self.pipelines.clear_batches();
        if self.render.slot_state(self.render.frame_idx()) == Some(SlotState::Accumulating) {
            self.render
                .submit_frame()
                .context("Failed to submit abandoned frame")?;
        }
        Ok(())
    }

    /// Tick `frames` times.
    pub fn run(&mut self, frames: u64) -> anyhow::Result<()> {
        let start = Instant::now();
        for _ in 0..frames {
            self.tick()?;
        }
        self.render.wait_idle()?;

        let elapsed = start.elapsed();
        tracing::info!(
            frames,
            elapsed_ms = elapsed.as_millis() as u64,
            avg_fps = fps(frames, elapsed),
            "Run complete"
        );
        Ok(())
    }

    /// Tick until the configured frame limit is reached.
    pub fn run_to_limit(&mut self) -> anyhow::Result<()> {
        let remaining = self.frame_limit.saturating_sub(self.frame_number());
        self.run(remaining)
    }

    /// Recreate the screen-sized targets at `width` x `height`.
    ///
    /// When the output is imported, `output_images` are its new images.
    pub fn resize(
        &mut self,
        width: u32,
        height: u32,
        output_images: Option<&[vk::Image]>,
    ) -> anyhow::Result<()> {
        let extent = vk::Extent2D {
            width: width.max(1),
            height: height.max(1),
        };
        if self.shut_down {
            anyhow::bail!("Engine is shut down");
        }
        if extent == self.extent && output_images.is_none() {
            return Ok(());
        }

        self.render.wait_idle()?;
        self.standard_targets
            .resize(&mut self.targets, &mut self.render, extent)?;
        match output_images {
            Some(images) if self.targets.is_imported(self.standard_targets.output)? => {
                self.pipelines.on_swapchain_resize(
                    &mut self.render,
                    &mut self.targets,
                    self.standard_targets.output,
                    images,
                    extent,
                )?;
            }
            _ => self.pipelines.clear_batches(),
        }
        self.extent = extent;

        let frame = self.render.frame_number();
        for feature in &mut self.features {
            let mut ctx = tick_context!(self, frame, 0.0);
            feature
                .resize(&mut ctx)
                .with_context(|| format!("Feature '{}' failed to resize", feature.name()))?;
        }
        tracing::info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Shut down features in reverse order, then the render stack.
    ///
    /// Cleanup continues past failures; the first one is returned.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        tracing::info!("Starting cleanup...");

        let mut first_error: Option<anyhow::Error> = None;
        let mut keep = |result: anyhow::Result<()>| {
            if let Err(e) = result {
                tracing::error!("{e:#}");
                first_error.get_or_insert(e);
            }
        };

        keep(self.render.wait_idle().map_err(Into::into));

        let frame = self.render.frame_number();
        let mut features = std::mem::take(&mut self.features);
        while let Some(mut feature) = features.pop() {
            let mut ctx = tick_context!(self, frame, 0.0);
            let name = feature.name().to_owned();
            keep(
                feature
                    .shutdown(&mut ctx)
                    .with_context(|| format!("Feature '{name}' failed to shut down")),
            );
        }

        keep(self.textures.destroy(&mut self.render).map_err(Into::into));
        keep(self.targets.destroy(&self.render).map_err(Into::into));
        keep(self.render.shutdown().map_err(Into::into));

        if self.stats.frames > 0 {
            tracing::info!(
                frames = self.stats.frames,
                min_fps = if self.stats.timed == 0 { 0.0 } else { self.stats.min_fps },
                max_fps = self.stats.max_fps,
                avg_fps = self.stats.avg_fps(),
                "FPS statistics"
            );
        }
        tracing::info!("Cleanup complete");

        first_error.map_or(Ok(()), Err)
    }

    pub const fn render(&self) -> &RenderSystem {
        &self.render
    }

    pub fn render_mut(&mut self) -> &mut RenderSystem {
        &mut self.render
    }

    pub const fn targets(&self) -> &RenderTargetSystem {
        &self.targets
    }

    pub const fn standard_targets(&self) -> &StandardTargets {
        &self.standard_targets
    }

    pub const fn pipelines(&self) -> &RenderPipelineSystem {
        &self.pipelines
    }

    pub fn pipelines_mut(&mut self) -> &mut RenderPipelineSystem {
        &mut self.pipelines
    }

    pub const fn passes(&self) -> &StandardPasses {
        &self.passes
    }

    pub const fn textures(&self) -> &TextureSystem {
        &self.textures
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Frames begun so far.
    pub fn frame_number(&self) -> u64 {
        self.render.frame_number()
    }

    pub const fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Engine shutdown failed: {e:#}");
        }
    }
}

fn release_targets(targets: &mut RenderTargetSystem, render: &RenderSystem) {
    if let Err(e) = targets.destroy(render) {
        tracing::warn!("Failed to release render targets: {e}");
    }
}

fn fps(frames: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use seaglass_core::constants::FRAME_STATE_COUNT;
    use seaglass_gpu::{RecordedCommand, RecordingDevice, ResourceKind};
    use seaglass_render::{DrawBatch, DrawContextDesc, DrawContextId, PassRecorder, TextureData};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records its callbacks and draws one triangle into the opaque pass.
    struct LoggedFeature {
        name: &'static str,
        log: Log,
        ctx: Option<DrawContextId<u32>>,
        fail_on: Option<u64>,
    }

    impl LoggedFeature {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                ctx: None,
                fail_on: None,
            }
        }
    }

    impl FeatureSystem for LoggedFeature {
        fn name(&self) -> &str {
            self.name
        }

        fn init(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
            self.ctx = Some(ctx.pipelines.register_draw_context(DrawContextDesc::new(
                self.name,
                ctx.passes.opaque_color,
                |rec: &PassRecorder<'_>, batches: &[DrawBatch<u32>]| {
                    for batch in batches {
                        rec.bind_draw_state(batch);
                        rec.draw(3, batch.payload);
                    }
                },
            ))?);
            self.log.lock().unwrap().push(format!("{}:init", self.name));
            Ok(())
        }

        fn tick(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:tick:{}", self.name, ctx.frame_number));
            if self.fail_on == Some(ctx.frame_number) {
                anyhow::bail!("boom");
            }
            let extent = ctx.targets.extent(ctx.standard_targets.hdr_color)?;
            let batch = DrawBatch::covering(
                vk::PipelineLayout::null(),
                vk::Pipeline::null(),
                vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
                1u32,
            );
            ctx.pipelines.issue_draw_batch(self.ctx.unwrap(), [batch])?;
            Ok(())
        }

        fn shutdown(&mut self, _ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{}:shutdown", self.name));
            Ok(())
        }
    }

    fn engine() -> (Arc<RecordingDevice>, Engine) {
        let device = Arc::new(RecordingDevice::new());
        let config = EngineConfig::default()
            .with_size(64, 32)
            .with_render_config(RenderConfig::new().with_temp_buffer_size(4096));
        let engine = Engine::new(device.clone(), config).unwrap();
        (device, engine)
    }

    fn draws(device: &RecordingDevice) -> usize {
        device
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Draw { .. }))
            .count()
    }

    #[test]
    fn features_tick_in_insertion_order() {
        let (device, mut engine) = engine();
        let log = Log::default();
        engine.add_feature(LoggedFeature::new("mesh", &log)).unwrap();
        engine.add_feature(LoggedFeature::new("sky", &log)).unwrap();

        engine.run(2).unwrap();
        assert_eq!(engine.frame_number(), 2);
        assert_eq!(
            *log.lock().unwrap(),
            ["mesh:init", "sky:init", "mesh:tick:0", "sky:tick:0", "mesh:tick:1", "sky:tick:1"]
        );
        assert_eq!(draws(&device), 4);

        engine.shutdown().unwrap();
        assert_eq!(
            log.lock().unwrap()[6..],
            ["sky:shutdown".to_string(), "mesh:shutdown".to_string()]
        );
    }

    #[test]
    fn failing_feature_skips_the_frame() {
        let (device, mut engine) = engine();
        let log = Log::default();
        let mut feature = LoggedFeature::new("mesh", &log);
        feature.fail_on = Some(1);
        engine.add_feature(feature).unwrap();

        engine.tick().unwrap();
        let err = engine.tick().unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        engine.tick().unwrap();
        engine.render_mut().wait_idle().unwrap();

        assert_eq!(engine.frame_number(), 3);
        assert_eq!(draws(&device), 2);
    }

    #[test]
    fn failed_flush_still_ends_the_frame() {
        let (_device, mut engine) = engine();
        let ctx = engine
            .pipelines
            .register_draw_context(DrawContextDesc::new(
                "late",
                engine.passes.opaque_color,
                |_: &PassRecorder<'_>, _: &[DrawBatch<u32>]| {},
            ))
            .unwrap();
        engine.run(1).unwrap();

        // Passes now reference targets that no longer exist
        engine.targets.destroy(&engine.render).unwrap();
        let batch = DrawBatch::covering(
            vk::PipelineLayout::null(),
            vk::Pipeline::null(),
            vk::Extent2D {
                width: 1,
                height: 1,
            },
            7u32,
        );
        engine.pipelines.issue_draw_batch(ctx, [batch]).unwrap();

        let err = engine.tick().unwrap_err();
        assert!(format!("{err:#}").contains("Failed to flush frame"));
        assert_eq!(engine.pipelines.pending_draw_batches(ctx), 0);
        assert_eq!(engine.frame_number(), 2);

        let err = engine.tick().unwrap_err();
        assert!(!format!("{err:#}").contains("already begun"));
        assert_eq!(engine.frame_number(), 3);
        engine.render_mut().wait_idle().unwrap();
    }

    #[test]
    fn tick_after_shutdown_is_an_error() {
        let (_device, mut engine) = engine();
        engine.run(1).unwrap();
        engine.shutdown().unwrap();
        let err = engine.tick().unwrap_err();
        assert!(format!("{err:#}").contains("shut down"));
        assert!(engine.run_to_limit().is_err());
    }

    #[test]
    fn shutdown_releases_everything() {
        let (device, mut engine) = engine();
        engine.run(FRAME_STATE_COUNT as u64 + 1).unwrap();
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();

        for kind in [
            ResourceKind::Buffer,
            ResourceKind::Image,
            ResourceKind::ImageView,
        ] {
            assert_eq!(device.live(kind), 0, "{kind:?} leaked");
        }
    }

    #[test]
    fn leaked_texture_fails_shutdown_but_still_frees() {
        let (device, mut engine) = engine();
        engine.render_mut().begin_frame().unwrap();
        let Engine {
            render, textures, ..
        } = &mut engine;
        textures
            .load_texture(render, "ui.ktx2", "font", || {
                Ok(TextureData::new_2d(2, 2, vk::Format::R8G8B8A8_UNORM, vec![0; 16]))
            })
            .unwrap();
        engine.render_mut().submit_frame().unwrap();

        let err = engine.shutdown().unwrap_err();
        assert!(format!("{err:#}").contains("ui.ktx2:font"));
        assert_eq!(device.live(ResourceKind::Image), 0);
    }

    #[test]
    fn resize_recreates_screen_targets() {
        let (_device, mut engine) = engine();
        engine.run(1).unwrap();
        engine.resize(128, 96, None).unwrap();

        let hdr = engine.standard_targets().hdr_color;
        let bloom = engine.standard_targets().bloom;
        assert_eq!(engine.targets().extent(hdr).unwrap().width, 128);
        assert_eq!(engine.targets().extent(bloom).unwrap().height, 48);
        assert_eq!(engine.extent().height, 96);
        engine.run(1).unwrap();
    }

    #[test]
    fn imported_output_is_rebound() {
        let device = Arc::new(RecordingDevice::new());
        let images: Vec<_> = (0..3).map(|i| vk::Image::from_raw(0x5000 + i)).collect();
        let config = EngineConfig::default()
            .with_size(64, 64)
            .with_output_images(images)
            .with_render_config(RenderConfig::new().with_temp_buffer_size(4096));
        let mut engine = Engine::new(device, config).unwrap();
        let output = engine.standard_targets().output;
        assert!(engine.targets().is_imported(output).unwrap());

        let fresh: Vec<_> = (0..3).map(|i| vk::Image::from_raw(0x6000 + i)).collect();
        engine.resize(80, 60, Some(fresh.as_slice())).unwrap();
        assert_eq!(engine.targets().image(1, output).unwrap(), fresh[1]);
        engine.shutdown().unwrap();
    }

    #[test]
    fn run_to_limit_stops_at_limit() {
        let device = Arc::new(RecordingDevice::new());
        let config = EngineConfig::new("limit")
            .with_size(32, 32)
            .with_frame_limit(4)
            .with_render_config(RenderConfig::new().with_temp_buffer_size(1024));
        let mut engine = Engine::new(device, config).unwrap();
        engine.run(1).unwrap();
        engine.run_to_limit().unwrap();
        assert_eq!(engine.frame_number(), 4);
        engine.run_to_limit().unwrap();
        assert_eq!(engine.frame_number(), 4);
    }

    #[test]
    fn stats_average_timed_frames() {
        let mut stats = FrameStats::default();
        stats.record(0.0);
        stats.record(0.5);
        stats.record(0.25);
        assert_eq!(stats.frames, 3);
        assert!((stats.avg_fps() - 3.0).abs() < 1e-9);
        assert!((stats.min_fps - 2.0).abs() < 1e-9);
    }
}
