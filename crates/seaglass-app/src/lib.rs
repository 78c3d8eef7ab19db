//! Engine loop for the Seaglass renderer.
//!
//! [`Engine`] owns the render, target, pipeline and texture systems and drives
//! a list of [`FeatureSystem`]s once per tick:
//! - begin the frame on the next slot
//! - tick every feature in the order it was added
//! - flush the pass graph to the render thread
//!
//! # Example
//!
//! ```no_run
//! use seaglass_app::{init_logging, Engine, EngineConfig, FeatureSystem, TickContext};
//! use seaglass_gpu::{GpuContextBuilder, VulkanDevice};
//! use std::sync::Arc;
//!
//! struct Clock;
//!
//! impl FeatureSystem for Clock {
//!     fn name(&self) -> &str {
//!         "clock"
//!     }
//!
//!     fn tick(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
//!         tracing::trace!(frame = ctx.frame_number, dt = ctx.delta_time);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging();
//!     let gpu = GpuContextBuilder::new().app_name("demo").build()?;
//!     let device = Arc::new(VulkanDevice::new(gpu, seaglass_core::constants::FRAME_STATE_COUNT)?);
//!     let mut engine = Engine::new(device, EngineConfig::default())?;
//!     engine.add_feature(Clock)?;
//!     engine.run(100)?;
//!     engine.shutdown()
//! }
//! ```

mod engine;
mod feature;
mod logging;

pub use engine::{Engine, EngineConfig, FrameStats};
pub use feature::{FeatureSystem, TickContext};
pub use logging::{init_logging, init_logging_with};

// Re-export commonly used types for convenience
pub use seaglass_render::{RenderSystem, StandardPasses, StandardTargets};
