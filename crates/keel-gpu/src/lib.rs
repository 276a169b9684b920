//! Vulkan device and resource layer.
//!
//! This crate provides:
//! - Instance creation and physical device selection
//! - Logical devices with lock-guarded queues
//! - Memory allocation and binding
//! - Buffer, image, sampler and shader module creation
//! - Pipeline barriers and command buffer management
//! - Parallel command recording on a bounded worker pool
//! - Surface and swapchain negotiation

pub mod arena;
pub mod barrier;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod memory;
pub mod parallel;
pub mod pipeline_cache;
pub mod resource;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod mock;

pub use arena::ResourceId;
pub use barrier::{issue_barriers, BufferTransition, ImageTransition};
pub use capabilities::{GpuVendor, PhysicalDeviceDescriptor, QueueFamily};
pub use command::{
    execute_single_time_commands, submit, CommandBuffer, CommandBufferState, CommandPool,
    InFlightCommands, SemaphoreWait, SubmitBatch,
};
pub use context::{GpuContext, GpuContextBuilder};
pub use device::{Device, Queue};
pub use dispatch::CommandDevice;
pub use error::{GpuError, Result};
pub use instance::{Instance, InstanceConfig};
pub use memory::MemoryAllocation;
pub use parallel::{ParallelRecorder, RecordingTask};
pub use pipeline_cache::PipelineCache;
pub use resource::{Buffer, BufferDesc, BufferViewDesc, Image, ImageDesc, ResourceFactory};
pub use surface::Surface;
pub use swapchain::{AcquiredImage, Swapchain, SwapchainConfig, SwapchainSupport};
pub use sync::{wait_for_fences, Fence, FrameSync, Semaphore, DEFAULT_FENCE_TIMEOUT_NS};
