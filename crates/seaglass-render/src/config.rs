//! Render system configuration.

use seaglass_core::constants::{FRAME_STATE_COUNT, TMP_HOST_BUFFER_SIZE};

/// Configuration for [`crate::RenderSystem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderConfig {
    /// Size of each frame slot's temporary host and GPU buffers.
    pub temp_buffer_size: u64,
    /// Frames a deferred free waits before the resource is destroyed.
    pub deferred_free_latency: usize,
    /// Name of the thread that records and submits frames.
    pub render_thread_name: String,
    /// Persist the pipeline cache when the render system shuts down.
    pub save_pipeline_cache: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            temp_buffer_size: TMP_HOST_BUFFER_SIZE,
            deferred_free_latency: FRAME_STATE_COUNT,
            render_thread_name: "seaglass-render".to_string(),
            save_pipeline_cache: true,
        }
    }
}

impl RenderConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the temporary buffer size per frame slot.
    #[must_use]
    pub const fn with_temp_buffer_size(mut self, size: u64) -> Self {
        self.temp_buffer_size = size;
        self
    }

    /// Set how many frames deferred frees are held back. Values below
    /// `FRAME_STATE_COUNT` are rejected by [`crate::RenderSystem::new`].
    #[must_use]
    pub const fn with_deferred_free_latency(mut self, frames: usize) -> Self {
        self.deferred_free_latency = frames;
        self
    }

    /// Set the render thread name.
    #[must_use]
    pub fn with_render_thread_name(mut self, name: impl Into<String>) -> Self {
        self.render_thread_name = name.into();
        self
    }

    /// Enable or disable saving the pipeline cache on shutdown.
    #[must_use]
    pub const fn with_save_pipeline_cache(mut self, save: bool) -> Self {
        self.save_pipeline_cache = save;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = RenderConfig::new()
            .with_temp_buffer_size(4096)
            .with_deferred_free_latency(5)
            .with_render_thread_name("gfx")
            .with_save_pipeline_cache(false);
        assert_eq!(config.temp_buffer_size, 4096);
        assert_eq!(config.deferred_free_latency, 5);
        assert_eq!(config.render_thread_name, "gfx");
        assert!(!config.save_pipeline_cache);
    }

    #[test]
    fn defaults_follow_engine_constants() {
        let config = RenderConfig::default();
        assert_eq!(config.temp_buffer_size, TMP_HOST_BUFFER_SIZE);
        assert_eq!(config.deferred_free_latency, FRAME_STATE_COUNT);
    }
}
