//! Vulkan instance creation.
//!
//! [`Instance`] owns the exported and instance-level function tables
//! (`ash::Entry` and `ash::Instance`). Device-level tables live on
//! [`crate::device::Device`] and are resolved per logical device.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Surface extensions for the current platform.
pub fn surface_instance_extensions() -> Vec<&'static CStr> {
    let extensions = vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
    ];

    extensions
}

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance creation parameters.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub app_name: String,
    pub enable_validation: bool,
    /// Skip window-system extensions.
    pub headless: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "keel".to_string(),
            enable_validation: cfg!(debug_assertions),
            headless: cfg!(feature = "headless"),
        }
    }
}

/// A Vulkan instance together with the loaded library entry.
///
/// Children (devices, surfaces) hold an `Arc<Instance>`, so the instance is
/// destroyed only after all of them.
pub struct Instance {
    entry: ash::Entry,
    raw: ash::Instance,
}

impl Instance {
    /// Load the Vulkan library and create an instance.
    pub fn new(config: &InstanceConfig) -> Result<Self> {
        // SAFETY: loading the system Vulkan library; no other invariants.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        // SAFETY: entry was just loaded.
        let raw = unsafe { create_instance(&entry, config) }?;

        tracing::debug!(
            app = %config.app_name,
            validation = config.enable_validation,
            headless = config.headless,
            "Created Vulkan instance"
        );

        Ok(Self { entry, raw })
    }

    /// Exported/global function table.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Instance-level function table.
    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Destroying Vulkan instance");
        // SAFETY: every child holds an Arc to this instance, so none remain.
        unsafe { self.raw.destroy_instance(None) };
    }
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
unsafe fn create_instance(entry: &ash::Entry, config: &InstanceConfig) -> Result<ash::Instance> {
    let app_name = CString::new(config.app_name.as_str())
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let engine_name = c"keel";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions = if config.headless {
        Vec::new()
    } else {
        surface_instance_extensions()
    };
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);

    // Drop window-system extensions the loader does not expose.
    let available_extensions = entry.enumerate_instance_extension_properties(None)?;
    extensions.retain(|ext| {
        let found = available_extensions
            .iter()
            .any(|props| CStr::from_ptr(props.extension_name.as_ptr()) == *ext);
        if !found {
            tracing::warn!("Instance extension {:?} not available", ext);
        }
        found
    });
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let layers = if config.enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Only request layers that are actually installed
    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}
