//! Vulkan abstraction layer for the Seaglass renderer.
//!
//! This crate provides:
//! - The [`GpuDevice`] / [`CommandEncoder`] contract the renderer is written against
//! - A Vulkan implementation built on ash and gpu-allocator ([`VulkanDevice`])
//! - Memory allocation, descriptor, pipeline and pipeline-cache helpers
//! - Deferred deletion for resources still referenced by frames in flight
//! - A headless recording device for tests (feature `recording`)

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod pipeline_cache;
#[cfg(any(test, feature = "recording"))]
pub mod recording;
pub mod sync;
pub mod vulkan;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder, DEFAULT_PIPELINE_CACHE_PATH};
pub use deferred::{DeferredDeletionQueue, DeferredResource};
pub use descriptors::{
    DescriptorBufferProperties, DescriptorData, DescriptorPoolDesc, DescriptorSetLayoutBuilder,
    DescriptorSetLayoutDesc, DescriptorWrite, LayoutBinding,
};
pub use device::{
    ClearValue, CommandEncoder, FrameCommands, GpuDevice, ImageBarrier, RenderingAttachment,
    RenderingDesc,
};
pub use error::{GpuError, Result};
pub use gpu_allocator::MemoryLocation;
pub use memory::{AllocatorStats, GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::GraphicsPipelineConfig;
pub use pipeline_cache::{CacheIdentity, PipelineCache};
#[cfg(any(test, feature = "recording"))]
pub use recording::{
    RecordedCommand, RecordingDevice, ResourceKind, RECORDED_DESCRIPTOR_PROPERTIES,
};
pub use vulkan::VulkanDevice;
