//! Synchronization primitives.
//!
//! Fence waits are always bounded by a caller-supplied timeout. A timed-out
//! wait does not cancel the GPU work: resources referenced by the fenced
//! submission must stay alive until the fence is eventually observed
//! signaled.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Default bound for fence waits: five seconds.
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 5_000_000_000;

fn map_wait_result(result: VkResult<()>, timeout_ns: u64) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::SynchronizationTimeout { timeout_ns }),
        Err(e) => Err(e.into()),
    }
}

/// A GPU-side semaphore.
pub struct Semaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
}

impl Semaphore {
    /// Create an unsignaled binary semaphore.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the create info references nothing external.
        let handle = unsafe { device.raw().create_semaphore(&create_info, None)? };
        Ok(Self { device, handle })
    }

    /// Get the raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: callers must not drop a semaphore a pending submission uses.
        unsafe { self.device.raw().destroy_semaphore(self.handle, None) };
    }
}

/// A CPU-observable fence.
pub struct Fence {
    device: Arc<Device>,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: Arc<Device>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the create info references nothing external.
        let handle = unsafe { device.raw().create_fence(&create_info, None)? };
        Ok(Self { device, handle })
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until the fence is signaled or `timeout_ns` elapses.
    ///
    /// # Errors
    /// [`GpuError::SynchronizationTimeout`] when the timeout expires first.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        // SAFETY: the fence belongs to this device.
        let result = unsafe {
            self.device
                .raw()
                .wait_for_fences(&[self.handle], true, timeout_ns)
        };
        map_wait_result(result, timeout_ns)
    }

    /// Reset the fence to unsignaled.
    pub fn reset(&self) -> Result<()> {
        // SAFETY: callers must not reset a fence a pending submission signals.
        unsafe { self.device.raw().reset_fences(&[self.handle])? };
        Ok(())
    }

    /// Whether the fence is signaled, without blocking.
    ///
    /// Not-ready is `Ok(false)`; a lost device is an error.
    pub fn is_signaled(&self) -> Result<bool> {
        // SAFETY: the fence belongs to this device.
        Ok(unsafe { self.device.raw().get_fence_status(self.handle)? })
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: callers must not drop a fence a pending submission signals.
        unsafe { self.device.raw().destroy_fence(self.handle, None) };
    }
}

/// Wait on several fences of `device` at once.
///
/// With `wait_all` false the call returns as soon as any fence is signaled.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn wait_for_fences(
    device: &Device,
    fences: &[&Fence],
    wait_all: bool,
    timeout_ns: u64,
) -> Result<()> {
    if fences.is_empty() {
        return Ok(());
    }
    let handles: Vec<vk::Fence> = fences.iter().map(|fence| fence.handle).collect();
    // SAFETY: the fences are owned by live `Fence` values of this device.
    let result = unsafe { device.raw().wait_for_fences(&handles, wait_all, timeout_ns) };
    map_wait_result(result, timeout_ns)
}

/// Per-frame synchronization for a presentation loop.
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready.
    pub image_available: Semaphore,
    /// Signaled when rendering to the image is complete.
    pub render_finished: Semaphore,
    /// Signaled when the frame's submission has completed. Starts signaled.
    pub in_flight: Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            in_flight: Fence::new(device.clone(), true)?,
        })
    }

    /// Wait for the previous use of this frame, then reset its fence.
    pub fn begin_frame(&self, timeout_ns: u64) -> Result<()> {
        self.in_flight.wait(timeout_ns)?;
        self.in_flight.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_timeout_maps_to_synchronization_timeout() {
        assert_eq!(
            map_wait_result(Err(vk::Result::TIMEOUT), 1_000),
            Err(GpuError::SynchronizationTimeout { timeout_ns: 1_000 })
        );
    }

    #[test]
    fn other_wait_results_pass_through() {
        assert_eq!(map_wait_result(Ok(()), 10), Ok(()));
        assert_eq!(
            map_wait_result(Err(vk::Result::ERROR_DEVICE_LOST), 10),
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        );
    }
}
