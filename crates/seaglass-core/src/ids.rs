//! Opaque handle types shared across the renderer.

/// Handle to a render pass owned by the render pipeline system.
///
/// Pass ids are dense and stable for the lifetime of the pipeline system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RenderPassId(pub u32);

impl RenderPassId {
    /// Position of the pass in creation order.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a render target owned by the render target system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RenderTargetId(pub u32);

impl RenderTargetId {
    /// Index of the target in its owning system.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a ref-counted texture.
///
/// The value is the resource key of the texture's source path and name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TextureId(pub u64);

impl std::fmt::Display for RenderPassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pass#{}", self.0)
    }
}

impl std::fmt::Display for RenderTargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "texture#{:016x}", self.0)
    }
}
