//! Device-level command dispatch.
//!
//! [`CommandDevice`] is the slice of the device function table used by
//! command pools, command buffers, barriers and queue submission. It is
//! implemented for [`crate::device::Device`] and passed by reference into
//! every component that records or submits work.

use ash::prelude::VkResult;
use ash::vk;

/// Device-level entry points for command recording and submission.
///
/// All methods mirror the Vulkan calls of the same name.
pub trait CommandDevice: Send + Sync {
    /// # Safety
    /// The create info must be valid for this device.
    unsafe fn create_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool>;

    /// # Safety
    /// No command buffer from the pool may be pending.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// # Safety
    /// The pool must belong to this device and be externally synchronized.
    unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>>;

    /// # Safety
    /// The buffers must come from `pool` and must not be pending.
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    /// # Safety
    /// No command buffer from the pool may be pending.
    unsafe fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> VkResult<()>;

    /// # Safety
    /// The command buffer must be valid and not pending.
    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()>;

    /// # Safety
    /// The command buffer must be recording.
    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// # Safety
    /// The command buffer must not be pending.
    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> VkResult<()>;

    /// # Safety
    /// The command buffer must be recording and every barrier handle valid.
    #[allow(clippy::too_many_arguments)]
    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_memory_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_memory_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    /// # Safety
    /// The queue must be externally synchronized and every handle valid.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;
}
