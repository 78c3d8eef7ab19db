//! Render graph and frame resource management for the Seaglass renderer.
//!
//! This crate provides:
//! - Frame slot rotation with per-slot temporary upload buffers
//! - A dedicated render thread that records and submits each frame
//! - Render targets, render passes and their execution order
//! - Typed draw/dispatch contexts that batch work from feature systems
//! - Descriptor pools, descriptor buffers and ref-counted textures
//!
//! A tick follows one shape:
//! 1. [`RenderSystem::begin_frame`] claims the next slot.
//! 2. Feature systems upload data and issue batches.
//! 3. [`RenderPipelineSystem::flush`] hands the slot to the render thread.

pub mod batch;
pub mod config;
pub mod descriptor_buffer;
pub mod descriptor_pool;
pub mod error;
mod frame;
pub mod pass;
pub mod pipeline_system;
pub mod render_system;
mod render_thread;
pub mod standard_passes;
pub mod targets;
pub mod texture;

pub use batch::{
    DispatchBatch, DispatchContextDesc, DispatchContextId, DrawBatch, DrawContextDesc, DrawContextId,
    PassRecorder,
};
pub use config::RenderConfig;
pub use descriptor_buffer::DescriptorBuffer;
pub use descriptor_pool::{DescriptorSetPool, DynamicDescriptorPool, FrameDescriptorPool};
pub use error::{RenderError, Result};
pub use frame::{BufferUpload, SlotState};
pub use pass::{LayoutTracker, PassAttachment, PassTransition, RenderPassDesc};
pub use pipeline_system::RenderPipelineSystem;
pub use render_system::{RenderSystem, StagedBuffer};
pub use standard_passes::StandardPasses;
pub use targets::{OutputTarget, RenderTargetDesc, RenderTargetSystem, StandardTargets};
pub use texture::{Texture, TextureData, TextureSystem};
