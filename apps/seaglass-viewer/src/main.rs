//! Seaglass headless viewer.
//!
//! Builds a Vulkan device, the standard render targets and pass graph, and
//! runs a fixed number of frames without a window.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p seaglass-viewer -- [OPTIONS]
//! ```
//!
//! See `--help` for options. `RUST_LOG` sets the log level.

mod args;
mod demo;

use std::sync::Arc;

use seaglass_app::{init_logging, Engine, EngineConfig};
use seaglass_core::constants::FRAME_STATE_COUNT;
use seaglass_gpu::VulkanDevice;

use crate::args::{print_help, ViewerArgs};
use crate::demo::FrameDemo;

fn main() -> anyhow::Result<()> {
    let args = ViewerArgs::from_env()?;
    if args.help {
        print_help();
        return Ok(());
    }

    init_logging();
    tracing::info!(
        frames = args.frames,
        width = args.width,
        height = args.height,
        validation = args.validation,
        "Seaglass viewer starting..."
    );

    let config = EngineConfig::new("Seaglass Viewer")
        .with_size(args.width, args.height)
        .with_validation(args.validation)
        .with_pipeline_cache_path(args.pipeline_cache)
        .with_frame_limit(args.frames);

    let gpu = config.gpu_context_builder().build()?;
    tracing::info!("GPU: {}", gpu.capabilities().summary());

    let device = Arc::new(VulkanDevice::new(gpu, FRAME_STATE_COUNT)?);
    let mut engine = Engine::new(device, config)?;
    engine.add_feature(FrameDemo::new())?;

    let result = engine.run_to_limit();
    let shutdown = engine.shutdown();
    result?;
    shutdown
}
