//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Vulkan error not covered by a more specific kind.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan library could not be loaded.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Physical device enumeration reported zero devices.
    #[error("No Vulkan devices found")]
    NoDevicesFound,

    /// No enumerated device supports every required extension.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionUnsupported(String),

    /// No queue family supports the requested operations.
    #[error("No queue family supports {0:?}")]
    NoMatchingQueueFamily(vk::QueueFlags),

    /// The driver rejected logical device creation.
    #[error("Logical device creation failed: {0}")]
    DeviceCreationFailed(vk::Result),

    /// No memory type matches the requirement bits and property flags.
    #[error("No compatible memory type (type bits {type_bits:#b}, properties {required:?})")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The resource already has memory bound to it.
    #[error("Resource already has memory bound")]
    AlreadyBound,

    /// The resource id was destroyed earlier.
    #[error("Resource {0} was already destroyed")]
    AlreadyDestroyed(u64),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The format lacks a feature required for the requested usage.
    #[error("Format {format:?} does not support {features:?}")]
    FormatFeatureUnsupported {
        format: vk::Format,
        features: vk::FormatFeatureFlags,
    },

    /// Reset requested on a command pool created without reset support.
    #[error("Command pool was not created resettable")]
    PoolNotResettable,

    /// A handle was used in a state that forbids the operation.
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// A parallel recording task failed; nothing was submitted.
    #[error("Recording task {task} failed: {reason}")]
    RecordingFailed { task: usize, reason: String },

    /// Queue submission failed.
    #[error("Queue submission failed: {0}")]
    SubmissionFailed(vk::Result),

    /// A fence wait exceeded its timeout. The GPU work is not cancelled.
    #[error("Synchronization timed out after {timeout_ns} ns")]
    SynchronizationTimeout { timeout_ns: u64 },

    /// The queue family cannot present to the surface.
    #[error("Queue family {queue_family} cannot present to the surface")]
    PresentationUnsupported { queue_family: u32 },

    /// The surface does not support every requested image usage.
    #[error("Surface image usage {requested:?} unsupported (supported: {supported:?})")]
    UnsupportedImageUsage {
        requested: vk::ImageUsageFlags,
        supported: vk::ImageUsageFlags,
    },

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreationFailed(vk::Result),

    /// The swapchain is out of date or suboptimal and must be rebuilt.
    #[error("Swapchain needs to be rebuilt")]
    NeedsSwapchainRebuild,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
