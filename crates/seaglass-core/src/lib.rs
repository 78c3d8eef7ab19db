//! Core primitives for the Seaglass renderer.
//!
//! This crate provides the building blocks used by every other layer:
//! - Linear (bump) allocation over fixed-capacity regions
//! - Index free lists and a mutex-guarded work queue
//! - Resource hashing and ref-counted resource registries
//! - Opaque handle types and engine-wide constants

pub mod bump;
pub mod error;
pub mod free_list;
pub mod hash;
pub mod ids;
pub mod queue;
pub mod registry;

pub use bump::BumpAllocator;
pub use error::{Error, Result};
pub use free_list::FreeList;
pub use ids::{RenderPassId, RenderTargetId, TextureId};
pub use queue::SyncQueue;
pub use registry::ResourceRegistry;

/// Engine-wide constants
pub mod constants {
    /// Number of rotating frame slots (frames in flight)
    pub const FRAME_STATE_COUNT: usize = 3;
    /// Default capacity of each frame slot's temporary upload buffer (256 MiB)
    pub const TMP_HOST_BUFFER_SIZE: u64 = 256 * 1024 * 1024;
    /// Maximum attachments a single render pass may bind
    pub const MAX_ATTACHMENTS: usize = 4;
    /// Maximum number of passes a render pass may depend on
    pub const MAX_RENDER_PASS_DEPS: usize = 8;
    /// Maximum image transitions recorded before a render pass
    pub const MAX_RENDER_PASS_TRANSITIONS: usize = 16;
    /// Maximum dispatch group counts carried by one dispatch batch
    pub const MAX_DISPATCH_GROUPS: usize = 8;
    /// Growth granularity hint for descriptor free lists
    pub const DYN_DESC_PAGE_SIZE: u32 = 64;
    /// Number of shadow cascades rendered per frame
    pub const SHADOW_CASCADE_COUNT: usize = 4;
}
