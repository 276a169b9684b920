//! Pipeline cache persistence.
//!
//! The blob is opaque: it is handed to the driver as-is and returned as-is.
//! The driver rejects blobs from other devices or driver versions by
//! ignoring them.

use crate::device::Device;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// A pipeline cache seeded from an optional serialized blob.
pub struct PipelineCache {
    device: Arc<Device>,
    handle: vk::PipelineCache,
}

impl PipelineCache {
    pub fn new(device: Arc<Device>, initial_data: Option<&[u8]>) -> Result<Self> {
        let create_info =
            vk::PipelineCacheCreateInfo::default().initial_data(initial_data.unwrap_or_default());

        // SAFETY: the initial data slice outlives the call.
        let handle = unsafe { device.raw().create_pipeline_cache(&create_info, None)? };
        tracing::debug!(
            "Created pipeline cache from {} bytes",
            initial_data.map_or(0, <[u8]>::len)
        );

        Ok(Self { device, handle })
    }

    /// Get the raw cache handle.
    pub fn handle(&self) -> vk::PipelineCache {
        self.handle
    }

    /// The driver's current serialized cache contents.
    pub fn data(&self) -> Result<Vec<u8>> {
        // SAFETY: the cache belongs to this device.
        Ok(unsafe { self.device.raw().get_pipeline_cache_data(self.handle)? })
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        // SAFETY: pipelines created from the cache do not reference it.
        unsafe { self.device.raw().destroy_pipeline_cache(self.handle, None) };
    }
}
