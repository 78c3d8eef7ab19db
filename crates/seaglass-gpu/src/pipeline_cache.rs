//! Pipeline cache persistence.
//!
//! The driver blob is stored inside a small envelope that records which
//! device produced it. A blob written by another device or driver is dropped
//! instead of being handed back to Vulkan.

use crate::error::{GpuError, Result};
use ash::vk;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CACHE_MAGIC: [u8; 4] = *b"SGPC";
const CACHE_VERSION: u32 = 1;

/// Identifies the device and driver that produced a cache blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIdentity {
    pub pipeline_cache_uuid: [u8; 16],
    pub vendor_id: u32,
    pub device_id: u32,
}

impl CacheIdentity {
    pub const fn from_properties(props: &vk::PhysicalDeviceProperties) -> Self {
        Self {
            pipeline_cache_uuid: props.pipeline_cache_uuid,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    magic: [u8; 4],
    version: u32,
    identity: CacheIdentity,
    data: Vec<u8>,
}

/// Wrap a driver blob for storage.
pub fn encode(identity: CacheIdentity, data: Vec<u8>) -> Result<Vec<u8>> {
    let envelope = CacheEnvelope {
        magic: CACHE_MAGIC,
        version: CACHE_VERSION,
        identity,
        data,
    };
    bincode::serialize(&envelope).map_err(|e| GpuError::PipelineCache(e.to_string()))
}

/// Unwrap a stored blob, returning `None` when it does not belong to `identity`.
pub fn decode(identity: CacheIdentity, bytes: &[u8]) -> Option<Vec<u8>> {
    let envelope: CacheEnvelope = match bincode::deserialize(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Discarding unreadable pipeline cache: {e}");
            return None;
        }
    };

    if envelope.magic != CACHE_MAGIC || envelope.version != CACHE_VERSION {
        tracing::warn!(
            version = envelope.version,
            "Discarding pipeline cache with unknown format"
        );
        return None;
    }
    if envelope.identity != identity {
        tracing::warn!(
            vendor = envelope.identity.vendor_id,
            device = envelope.identity.device_id,
            "Discarding pipeline cache written by a different device or driver"
        );
        return None;
    }

    Some(envelope.data)
}

/// A `VkPipelineCache` bound to an optional file on disk.
pub struct PipelineCache {
    handle: vk::PipelineCache,
    identity: CacheIdentity,
    path: Option<PathBuf>,
}

impl PipelineCache {
    /// Create the cache, seeding it from `path` when a matching blob exists.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        identity: CacheIdentity,
        path: Option<&Path>,
    ) -> Result<Self> {
        let initial = path
            .and_then(|p| match std::fs::read(p) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    tracing::warn!("Failed to read pipeline cache {}: {e}", p.display());
                    None
                }
            })
            .and_then(|bytes| decode(identity, &bytes))
            .unwrap_or_default();

        if !initial.is_empty() {
            tracing::info!(bytes = initial.len(), "Loaded pipeline cache");
        }

        let info = vk::PipelineCacheCreateInfo::default().initial_data(&initial);
        // SAFETY: the caller guarantees the device is valid.
        let handle = unsafe { device.create_pipeline_cache(&info, None)? };

        Ok(Self {
            handle,
            identity,
            path: path.map(Path::to_path_buf),
        })
    }

    pub const fn handle(&self) -> vk::PipelineCache {
        self.handle
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the current cache contents to disk. Does nothing without a path.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn save(&self, device: &ash::Device) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // SAFETY: the caller guarantees the device is valid.
        let data = unsafe { device.get_pipeline_cache_data(self.handle)? };
        let len = data.len();
        let bytes = encode(self.identity, data)?;
        std::fs::write(path, bytes).map_err(|e| {
            GpuError::PipelineCache(format!("Failed to write {}: {e}", path.display()))
        })?;

        tracing::debug!(bytes = len, path = %path.display(), "Saved pipeline cache");
        Ok(())
    }

    /// Destroy the cache.
    ///
    /// # Safety
    /// The device must be valid and no pipeline creation may be in progress.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.handle != vk::PipelineCache::null() {
            // SAFETY: the caller guarantees the device is valid.
            unsafe { device.destroy_pipeline_cache(self.handle, None) };
            self.handle = vk::PipelineCache::null();
        }
    }
}
