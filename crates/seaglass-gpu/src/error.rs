//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Errors raised by the GPU layer and by [`crate::GpuDevice`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader library could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    #[error("No suitable GPU found")]
    NoSuitableDevice,

    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Pipeline cache could not be read or written.
    #[error("Pipeline cache error: {0}")]
    PipelineCache(String),

    /// A handle the device never created, or already destroyed.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A frame slot index outside the device's slot range.
    #[error("Frame slot {slot} out of range (device has {count})")]
    FrameSlot { slot: usize, count: usize },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
