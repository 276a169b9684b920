//! Swapchain negotiation, creation and rebuild.
//!
//! Negotiation is a pure function of the surface's reported support and a
//! [`SwapchainConfig`]. A swapchain is never mutated in place: a rebuild
//! creates a new one with the current handle passed as `oldSwapchain`, and
//! the old handle is destroyed only after the new one is complete.

use crate::device::{Device, Queue};
use crate::error::{GpuError, Result};
use crate::surface::Surface;
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// What the application would like; negotiation adapts it to the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub image_usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            present_mode: vk::PresentModeKHR::FIFO,
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        }
    }
}

impl SwapchainConfig {
    pub fn extent(mut self, width: u32, height: u32) -> Self {
        self.extent = vk::Extent2D { width, height };
        self
    }

    pub fn present_mode(mut self, present_mode: vk::PresentModeKHR) -> Self {
        self.present_mode = present_mode;
        self
    }

    pub fn surface_format(mut self, format: vk::Format, color_space: vk::ColorSpaceKHR) -> Self {
        self.surface_format = vk::SurfaceFormatKHR {
            format,
            color_space,
        };
        self
    }

    pub fn image_usage(mut self, image_usage: vk::ImageUsageFlags) -> Self {
        self.image_usage = image_usage;
        self
    }

    pub fn pre_transform(mut self, pre_transform: vk::SurfaceTransformFlagsKHR) -> Self {
        self.pre_transform = pre_transform;
        self
    }
}

/// Everything a surface reports about what it supports.
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// The parameters a swapchain is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedSwapchain {
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub extent: vk::Extent2D,
}

/// One more than the minimum, clamped to the maximum when there is one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// The desired mode if supported, otherwise FIFO, which every surface supports.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    desired: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&desired) {
        desired
    } else {
        tracing::debug!("Present mode {desired:?} unsupported, falling back to FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// The desired usage, which must be fully supported.
pub fn choose_image_usage(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::ImageUsageFlags,
) -> Result<vk::ImageUsageFlags> {
    let supported = capabilities.supported_usage_flags;
    if desired & supported == desired {
        Ok(desired)
    } else {
        Err(GpuError::UnsupportedImageUsage {
            requested: desired,
            supported,
        })
    }
}

/// The desired transform if supported, otherwise the current one.
pub fn choose_transform(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::SurfaceTransformFlagsKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if capabilities.supported_transforms.contains(desired) {
        desired
    } else {
        capabilities.current_transform
    }
}

/// Exact format and color space, else the format in any color space, else
/// the first format reported.
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> Result<vk::SurfaceFormatKHR> {
    if available.contains(&desired) {
        return Ok(desired);
    }

    if let Some(same_format) = available.iter().find(|f| f.format == desired.format) {
        tracing::warn!(
            "Color space {:?} unavailable for {:?}, using {:?}",
            desired.color_space,
            desired.format,
            same_format.color_space
        );
        return Ok(*same_format);
    }

    available.first().copied().ok_or_else(|| {
        GpuError::InvalidUsage("surface reports no supported formats".to_string())
    })
}

/// The current extent when the surface fixes it, otherwise the desired
/// extent clamped to the surface limits.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

pub fn choose_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|alpha| capabilities.supported_composite_alpha.contains(*alpha))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

/// Negotiate every swapchain parameter against the surface's support.
pub fn negotiate(support: &SwapchainSupport, config: &SwapchainConfig) -> Result<NegotiatedSwapchain> {
    let capabilities = &support.capabilities;
    let present_mode = choose_present_mode(&support.present_modes, config.present_mode);
    let image_count = choose_image_count(capabilities);
    let image_usage = choose_image_usage(capabilities, config.image_usage)?;
    let pre_transform = choose_transform(capabilities, config.pre_transform);
    let surface_format = choose_surface_format(&support.formats, config.surface_format)?;

    Ok(NegotiatedSwapchain {
        image_count,
        surface_format,
        present_mode,
        image_usage,
        pre_transform,
        composite_alpha: choose_composite_alpha(capabilities),
        extent: choose_extent(capabilities, config.extent),
    })
}

/// Create one color view per image. If any creation fails, views created so
/// far are destroyed before the error is returned.
fn create_image_views<FCreate, FDestroy>(
    images: &[vk::Image],
    format: vk::Format,
    mut create_view: FCreate,
    mut destroy_view: FDestroy,
) -> Result<Vec<vk::ImageView>>
where
    FCreate: FnMut(&vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>,
    FDestroy: FnMut(vk::ImageView),
{
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        match create_view(&create_info) {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views.drain(..) {
                    destroy_view(view);
                }
                return Err(e.into());
            }
        }
    }
    Ok(views)
}

fn map_acquire_result(result: VkResult<(u32, bool)>, timeout_ns: u64) -> Result<AcquiredImage> {
    match result {
        Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::NeedsSwapchainRebuild),
        Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
            Err(GpuError::SynchronizationTimeout { timeout_ns })
        }
        Err(e) => Err(e.into()),
    }
}

fn map_present_result(result: VkResult<bool>) -> Result<()> {
    match result {
        Ok(false) => Ok(()),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::NeedsSwapchainRebuild),
        Err(e) => Err(e.into()),
    }
}

/// Result of a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The image is usable, but the swapchain should be rebuilt soon.
    pub suboptimal: bool,
}

/// A swapchain with its images and one view per image.
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    parts: SwapchainParts,
    negotiated: NegotiatedSwapchain,
    surface: Arc<Surface>,
    device: Arc<Device>,
}

impl Swapchain {
    /// Negotiate against the surface and create the swapchain.
    ///
    /// # Errors
    /// [`GpuError::PresentationUnsupported`] when the device's queue family
    /// cannot present to `surface`.
    pub fn new(device: Arc<Device>, surface: Arc<Surface>, config: &SwapchainConfig) -> Result<Self> {
        let queue_family = device.queue_family();
        if !surface.supports_presentation(device.physical_device(), queue_family)? {
            return Err(GpuError::PresentationUnsupported { queue_family });
        }

        let loader = ash::khr::swapchain::Device::new(device.instance().raw(), device.raw());
        let support = surface.query_support(device.physical_device())?;
        let negotiated = negotiate(&support, config)?;

        // SAFETY: the surface and device share an instance.
        let parts = unsafe {
            create_swapchain(
                &device,
                &loader,
                surface.handle(),
                &negotiated,
                vk::SwapchainKHR::null(),
            )?
        };

        Ok(Self {
            loader,
            parts,
            negotiated,
            surface,
            device,
        })
    }

    /// Rebuild after a resize or a [`GpuError::NeedsSwapchainRebuild`].
    ///
    /// The current swapchain stays valid until the new one is complete; it
    /// is then destroyed after a device idle wait. On failure `self` is left
    /// unchanged and any new swapchain is destroyed again, although the
    /// driver has retired the current one, so acquires will keep asking for
    /// a rebuild.
    pub fn recreate(&mut self, config: &SwapchainConfig) -> Result<()> {
        let support = self.surface.query_support(self.device.physical_device())?;
        let negotiated = negotiate(&support, config)?;

        // SAFETY: the surface and device share an instance; the current
        // handle is passed as the retiring swapchain.
        let rebuilt = unsafe {
            create_swapchain(
                &self.device,
                &self.loader,
                self.surface.handle(),
                &negotiated,
                self.parts.handle,
            )?
        };

        let (device, loader) = (&self.device, &self.loader);
        let old = install_replacement(
            &mut self.parts,
            rebuilt,
            || device.wait_idle(),
            // SAFETY: the unused swapchain was never handed out.
            |unused| unsafe { destroy_swapchain(device, loader, &unused) },
        )?;
        self.negotiated = negotiated;

        // SAFETY: the device is idle, so nothing references the old swapchain.
        unsafe { destroy_swapchain(&self.device, &self.loader, &old) };
        Ok(())
    }

    /// Acquire the next presentable image, signaling `semaphore` and/or
    /// `fence` when it is ready.
    ///
    /// # Errors
    /// - [`GpuError::NeedsSwapchainRebuild`] when the swapchain is out of
    ///   date; no image was acquired.
    /// - [`GpuError::SynchronizationTimeout`] when no image became available.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        // SAFETY: the swapchain is live and the sync objects belong to the device.
        let result = unsafe {
            self.loader
                .acquire_next_image(self.parts.handle, timeout_ns, semaphore, fence)
        };
        map_acquire_result(result, timeout_ns)
    }

    /// Present `image_index` on `queue` after `wait_semaphores` signal.
    ///
    /// A suboptimal or out-of-date swapchain surfaces as
    /// [`GpuError::NeedsSwapchainRebuild`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(
        &self,
        queue: &Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        let swapchains = [self.parts.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: the queue lock serializes presents with submissions.
        let result = queue.with_lock(|raw_queue| unsafe {
            self.loader.queue_present(raw_queue, &present_info)
        });
        map_present_result(result)
    }

    /// Get the raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.parts.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.parts.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.parts.views
    }

    pub fn format(&self) -> vk::Format {
        self.negotiated.surface_format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.negotiated.extent
    }

    /// The parameters the current swapchain was created with.
    pub fn negotiated(&self) -> &NegotiatedSwapchain {
        &self.negotiated
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // SAFETY: callers must not drop a swapchain with presents in flight.
        unsafe { destroy_swapchain(&self.device, &self.loader, &self.parts) };
    }
}

/// Driver objects that make up one generation of a swapchain.
struct SwapchainParts {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

/// Move `replacement` into `current` once `settle` succeeds, returning the
/// previous value. If `settle` fails, `replacement` goes to `discard` and
/// `current` is left as it was.
fn install_replacement<T>(
    current: &mut T,
    replacement: T,
    settle: impl FnOnce() -> Result<()>,
    discard: impl FnOnce(T),
) -> Result<T> {
    if let Err(e) = settle() {
        discard(replacement);
        return Err(e);
    }
    Ok(std::mem::replace(current, replacement))
}

unsafe fn create_swapchain(
    device: &Device,
    loader: &ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    negotiated: &NegotiatedSwapchain,
    old_swapchain: vk::SwapchainKHR,
) -> Result<SwapchainParts> {
    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(negotiated.image_count)
        .image_format(negotiated.surface_format.format)
        .image_color_space(negotiated.surface_format.color_space)
        .image_extent(negotiated.extent)
        .image_array_layers(1)
        .image_usage(negotiated.image_usage)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(negotiated.pre_transform)
        .composite_alpha(negotiated.composite_alpha)
        .present_mode(negotiated.present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = loader
        .create_swapchain(&create_info, None)
        .map_err(GpuError::SwapchainCreationFailed)?;

    let images = match loader.get_swapchain_images(handle) {
        Ok(images) => images,
        Err(e) => {
            loader.destroy_swapchain(handle, None);
            return Err(e.into());
        }
    };

    let raw = device.raw();
    let views = create_image_views(
        &images,
        negotiated.surface_format.format,
        |info| raw.create_image_view(info, None),
        |view| raw.destroy_image_view(view, None),
    );
    let views = match views {
        Ok(views) => views,
        Err(e) => {
            loader.destroy_swapchain(handle, None);
            return Err(e);
        }
    };

    tracing::info!(
        "Created swapchain: {} images, {}x{}, {:?}, {:?}",
        images.len(),
        negotiated.extent.width,
        negotiated.extent.height,
        negotiated.surface_format.format,
        negotiated.present_mode
    );
    Ok(SwapchainParts {
        handle,
        images,
        views,
    })
}

unsafe fn destroy_swapchain(
    device: &Device,
    loader: &ash::khr::swapchain::Device,
    parts: &SwapchainParts,
) {
    for &view in &parts.views {
        device.raw().destroy_image_view(view, None);
    }
    loader.destroy_swapchain(parts.handle, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn capabilities(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        }
    }

    fn srgb() -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn unbounded_surface_gets_min_plus_one_and_current_extent() {
        let support = SwapchainSupport {
            capabilities: capabilities(2, 0, (800, 600)),
            formats: vec![srgb()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        let negotiated = negotiate(&support, &SwapchainConfig::default()).unwrap();
        assert_eq!(negotiated.image_count, 3);
        assert_eq!(
            negotiated.extent,
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn image_count_is_clamped_to_maximum() {
        assert_eq!(choose_image_count(&capabilities(3, 3, (1, 1))), 3);
        assert_eq!(choose_image_count(&capabilities(2, 8, (1, 1))), 3);
        assert_eq!(choose_image_count(&capabilities(1, 0, (1, 1))), 2);
    }

    #[test]
    fn unsupported_present_mode_falls_back_to_fifo() {
        let mode = choose_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX);
        assert_eq!(mode, vk::PresentModeKHR::FIFO);

        let support = SwapchainSupport {
            capabilities: capabilities(2, 0, (800, 600)),
            formats: vec![srgb()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let config = SwapchainConfig::default().present_mode(vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            negotiate(&support, &config).unwrap().present_mode,
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn supported_present_mode_is_kept() {
        let mode = choose_present_mode(
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            vk::PresentModeKHR::MAILBOX,
        );
        assert_eq!(mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn image_usage_is_never_downgraded() {
        let caps = capabilities(2, 0, (800, 600));
        assert_eq!(
            choose_image_usage(&caps, vk::ImageUsageFlags::COLOR_ATTACHMENT).unwrap(),
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        );

        let requested = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE;
        assert_eq!(
            choose_image_usage(&caps, requested).unwrap_err(),
            GpuError::UnsupportedImageUsage {
                requested,
                supported: caps.supported_usage_flags,
            }
        );
    }

    #[test]
    fn unsupported_transform_uses_current() {
        let mut caps = capabilities(2, 0, (800, 600));
        caps.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;

        assert_eq!(
            choose_transform(&caps, vk::SurfaceTransformFlagsKHR::ROTATE_180),
            vk::SurfaceTransformFlagsKHR::ROTATE_90
        );
        assert_eq!(
            choose_transform(&caps, vk::SurfaceTransformFlagsKHR::IDENTITY),
            vk::SurfaceTransformFlagsKHR::IDENTITY
        );
    }

    #[test]
    fn surface_format_fallback_order() {
        let hdr = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        assert_eq!(choose_surface_format(&[unorm, hdr, srgb()], srgb()).unwrap(), srgb());
        assert_eq!(choose_surface_format(&[unorm, hdr], srgb()).unwrap(), hdr);
        assert_eq!(choose_surface_format(&[unorm], srgb()).unwrap(), unorm);
        assert!(choose_surface_format(&[], srgb()).is_err());
    }

    #[test]
    fn variable_extent_is_clamped() {
        let mut caps = capabilities(2, 0, (u32::MAX, u32::MAX));
        caps.min_image_extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };

        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 4000,
                height: 200,
            },
        );
        assert_eq!(
            extent,
            vk::Extent2D {
                width: 1920,
                height: 480
            }
        );
    }

    #[test]
    fn composite_alpha_preference() {
        let mut caps = capabilities(2, 0, (1, 1));
        caps.supported_composite_alpha =
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED | vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(
            choose_composite_alpha(&caps),
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
        );

        caps.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(
            choose_composite_alpha(&caps),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn acquire_results_map_to_rebuild_signal() {
        assert_eq!(
            map_acquire_result(Ok((2, true)), 0).unwrap(),
            AcquiredImage {
                index: 2,
                suboptimal: true
            }
        );
        assert_eq!(
            map_acquire_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), 0).unwrap_err(),
            GpuError::NeedsSwapchainRebuild
        );
        assert_eq!(
            map_acquire_result(Err(vk::Result::TIMEOUT), 50).unwrap_err(),
            GpuError::SynchronizationTimeout { timeout_ns: 50 }
        );
        assert_eq!(
            map_acquire_result(Err(vk::Result::ERROR_SURFACE_LOST_KHR), 0).unwrap_err(),
            GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR)
        );
    }

    #[test]
    fn present_results_map_to_rebuild_signal() {
        assert_eq!(map_present_result(Ok(false)), Ok(()));
        assert_eq!(
            map_present_result(Ok(true)),
            Err(GpuError::NeedsSwapchainRebuild)
        );
        assert_eq!(
            map_present_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Err(GpuError::NeedsSwapchainRebuild)
        );
        assert_eq!(
            map_present_result(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        );
    }

    #[test]
    fn failed_view_creation_destroys_earlier_views() {
        let images: Vec<_> = (1..=3).map(vk::Image::from_raw).collect();
        let mut created = 0u64;
        let mut destroyed = Vec::new();

        let result = create_image_views(
            &images,
            vk::Format::B8G8R8A8_SRGB,
            |info| {
                if info.image == images[2] {
                    return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                }
                created += 1;
                Ok(vk::ImageView::from_raw(100 + created))
            },
            |view| destroyed.push(view.as_raw()),
        );

        assert_eq!(
            result.unwrap_err(),
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(destroyed, [101, 102]);
    }

    #[test]
    fn views_are_created_per_image() {
        let images: Vec<_> = (1..=3).map(vk::Image::from_raw).collect();
        let views = create_image_views(
            &images,
            vk::Format::B8G8R8A8_SRGB,
            |info| Ok(vk::ImageView::from_raw(info.image.as_raw() + 10)),
            |_| panic!("nothing should be destroyed"),
        )
        .unwrap();

        let raw: Vec<_> = views.iter().map(|v| v.as_raw()).collect();
        assert_eq!(raw, [11, 12, 13]);
    }

    #[test]
    fn failed_settle_discards_replacement() {
        let mut current = vec![1u32, 2];
        let mut discarded = None;

        let err = install_replacement(
            &mut current,
            vec![7u32, 8, 9],
            || Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
            |unused| discarded = Some(unused),
        )
        .unwrap_err();

        assert_eq!(err, GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(current, [1, 2]);
        assert_eq!(discarded, Some(vec![7, 8, 9]));
    }

    #[test]
    fn settled_replacement_returns_previous() {
        let mut current = vec![1u32, 2];
        let mut discarded = false;

        let old = install_replacement(&mut current, vec![3u32], || Ok(()), |_| discarded = true)
            .unwrap();

        assert_eq!(old, [1, 2]);
        assert_eq!(current, [3]);
        assert!(!discarded);
    }
}
