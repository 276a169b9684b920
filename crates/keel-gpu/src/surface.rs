//! Presentation surfaces.
//!
//! Window-system integration stops at the surface handle: callers bring a
//! window implementing the `raw-window-handle` traits, or a surface they
//! created themselves.

use crate::error::{GpuError, Result};
use crate::instance::Instance;
use crate::swapchain::SwapchainSupport;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// An owned `VkSurfaceKHR` and the surface extension functions.
pub struct Surface {
    loader: ash::khr::surface::Instance,
    handle: vk::SurfaceKHR,
    instance: Arc<Instance>,
}

impl Surface {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The window must outlive the returned surface, and the instance must
    /// have been created with the window system's surface extensions.
    pub unsafe fn from_window<W>(instance: Arc<Instance>, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let handle = ash_window::create_surface(
            instance.entry(),
            instance.raw(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        Ok(Self::from_raw(instance, handle))
    }

    /// Take ownership of an externally created surface.
    ///
    /// # Safety
    /// `handle` must be a live surface of `instance` that nothing else will
    /// destroy.
    pub unsafe fn from_raw(instance: Arc<Instance>, handle: vk::SurfaceKHR) -> Self {
        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.raw());
        Self {
            loader,
            handle,
            instance,
        }
    }

    /// Get the raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// The instance the surface belongs to.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Whether `queue_family` of `physical_device` can present to this surface.
    pub fn supports_presentation(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        // SAFETY: the physical device belongs to the surface's instance.
        Ok(unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.handle,
            )?
        })
    }

    /// Query capabilities, formats and present modes.
    pub fn query_support(&self, physical_device: vk::PhysicalDevice) -> Result<SwapchainSupport> {
        // SAFETY: the physical device belongs to the surface's instance.
        unsafe {
            Ok(SwapchainSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.handle)?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.handle)?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.handle)?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: every swapchain holds an Arc to its surface, so none remain.
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}
