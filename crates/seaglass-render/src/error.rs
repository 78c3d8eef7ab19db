//! Render error types.

use seaglass_core::{RenderPassId, RenderTargetId};
use seaglass_gpu::GpuError;
use thiserror::Error;

/// Errors raised by the render system, render graph and descriptor pools.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Device-level failure.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Capacity, free-list or reference-count failure.
    #[error(transparent)]
    Core(#[from] seaglass_core::Error),

    #[error("Unknown render pass {0}")]
    UnknownPass(RenderPassId),

    #[error("Unknown render target {0}")]
    UnknownRenderTarget(RenderTargetId),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A render pass description breaks a graph limit.
    #[error("Invalid render pass '{name}': {reason}")]
    InvalidPass { name: String, reason: String },

    /// A context was registered against a pass of the wrong kind.
    #[error("Context '{context}' cannot record into pass '{pass}': {reason}")]
    ContextPassMismatch {
        context: String,
        pass: String,
        reason: &'static str,
    },

    /// Batches submitted with a type other than the one the context was registered with.
    #[error("Context '{context}' records {expected} but was given {found}")]
    BatchTypeMismatch {
        context: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Unknown context #{0}")]
    UnknownContext(u32),

    #[error("Dispatch batch for '{context}' has {count} groups (max {max})")]
    TooManyDispatchGroups {
        context: String,
        count: usize,
        max: usize,
    },

    /// Resources still referenced when their system was destroyed.
    #[error("{count} {kind} resource(s) leaked: {sources:?}")]
    LeakedResources {
        kind: &'static str,
        count: usize,
        sources: Vec<String>,
    },

    /// The render thread stopped or reported a failure.
    #[error("Render thread: {0}")]
    RenderThread(String),

    #[error("Invalid render configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
