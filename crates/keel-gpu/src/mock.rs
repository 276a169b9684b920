//! In-memory command dispatch used by unit tests.

use crate::dispatch::CommandDevice;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreatePool,
    DestroyPool,
    Allocate(u32),
    Free(usize),
    ResetPool,
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    ResetBuffer(vk::CommandBuffer),
    Barrier { buffers: usize, images: usize },
    Submit { batches: usize, command_buffers: usize },
}

/// Records every call; never touches a driver.
#[derive(Default)]
pub struct MockDevice {
    next_handle: AtomicU64,
    calls: Mutex<Vec<MockCall>>,
    fail_submit: bool,
}

impl MockDevice {
    /// A device whose queue submissions fail with a lost device.
    pub fn failing_submits() -> Self {
        Self {
            fail_submit: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, MockCall::Submit { .. }))
            .count()
    }

    pub fn barrier_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, MockCall::Barrier { .. }))
            .count()
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

impl CommandDevice for MockDevice {
    unsafe fn create_command_pool(
        &self,
        _create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool> {
        self.record(MockCall::CreatePool);
        Ok(vk::CommandPool::from_raw(self.handle()))
    }

    unsafe fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.record(MockCall::DestroyPool);
    }

    unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let count = allocate_info.command_buffer_count;
        self.record(MockCall::Allocate(count));
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(self.handle()))
            .collect())
    }

    unsafe fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.record(MockCall::Free(buffers.len()));
    }

    unsafe fn reset_command_pool(
        &self,
        _pool: vk::CommandPool,
        _flags: vk::CommandPoolResetFlags,
    ) -> VkResult<()> {
        self.record(MockCall::ResetPool);
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        self.record(MockCall::Begin(command_buffer));
        Ok(())
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(MockCall::End(command_buffer));
        Ok(())
    }

    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferResetFlags,
    ) -> VkResult<()> {
        self.record(MockCall::ResetBuffer(command_buffer));
        Ok(())
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        _command_buffer: vk::CommandBuffer,
        _src_stage_mask: vk::PipelineStageFlags,
        _dst_stage_mask: vk::PipelineStageFlags,
        _dependency_flags: vk::DependencyFlags,
        _memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_memory_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_memory_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.record(MockCall::Barrier {
            buffers: buffer_memory_barriers.len(),
            images: image_memory_barriers.len(),
        });
    }

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        _fence: vk::Fence,
    ) -> VkResult<()> {
        if self.fail_submit {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        self.record(MockCall::Submit {
            batches: submits.len(),
            command_buffers: submits
                .iter()
                .map(|submit| submit.command_buffer_count as usize)
                .sum(),
        });
        Ok(())
    }
}
