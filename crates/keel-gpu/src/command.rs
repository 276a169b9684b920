//! Command pools, command buffer lifecycle and queue submission.
//!
//! A [`CommandPool`] and the buffers allocated from it must be used by one
//! thread at a time. The pool is `!Sync`; parallel recording uses one pool
//! per worker (see [`crate::parallel`]).

use crate::device::{Device, Queue};
use crate::dispatch::CommandDevice;
use crate::error::{GpuError, Result};
use crate::sync::Fence;
use ash::vk;
use std::marker::PhantomData;
use std::sync::Arc;

/// Lifecycle state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

/// A primary command buffer with its tracked lifecycle state.
#[derive(Debug)]
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    resettable: bool,
    state: CommandBufferState,
    usage: vk::CommandBufferUsageFlags,
}

impl CommandBuffer {
    pub(crate) fn new(handle: vk::CommandBuffer, pool: vk::CommandPool, resettable: bool) -> Self {
        Self {
            handle,
            pool,
            resettable,
            state: CommandBufferState::Initial,
            usage: vk::CommandBufferUsageFlags::empty(),
        }
    }

    /// Get the raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// The pool this buffer was allocated from.
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    fn expect_state(&self, expected: CommandBufferState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(GpuError::InvalidUsage(format!(
                "{operation} requires a {expected:?} command buffer, found {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Begin recording (Initial -> Recording).
    ///
    /// # Safety
    /// The buffer must have been allocated from `device`.
    pub unsafe fn begin<D: CommandDevice + ?Sized>(
        &mut self,
        device: &D,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.expect_state(CommandBufferState::Initial, "begin")?;

        let begin_info = vk::CommandBufferBeginInfo::default().flags(usage);
        device.begin_command_buffer(self.handle, &begin_info)?;

        self.state = CommandBufferState::Recording;
        self.usage = usage;
        Ok(())
    }

    /// End recording (Recording -> Executable).
    ///
    /// A driver failure leaves the buffer Invalid.
    ///
    /// # Safety
    /// The buffer must have been allocated from `device`.
    pub unsafe fn end<D: CommandDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        self.expect_state(CommandBufferState::Recording, "end")?;

        if let Err(e) = device.end_command_buffer(self.handle) {
            self.state = CommandBufferState::Invalid;
            return Err(e.into());
        }

        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Reset this buffer back to Initial.
    ///
    /// # Errors
    /// - [`GpuError::PoolNotResettable`] unless the pool was created resettable.
    /// - [`GpuError::InvalidUsage`] while the buffer is pending.
    ///
    /// # Safety
    /// The buffer must have been allocated from `device`.
    pub unsafe fn reset<D: CommandDevice + ?Sized>(
        &mut self,
        device: &D,
        release_resources: bool,
    ) -> Result<()> {
        if !self.resettable {
            return Err(GpuError::PoolNotResettable);
        }
        if self.state == CommandBufferState::Pending {
            return Err(GpuError::InvalidUsage(
                "cannot reset a pending command buffer".to_string(),
            ));
        }

        let flags = if release_resources {
            vk::CommandBufferResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandBufferResetFlags::empty()
        };
        device.reset_command_buffer(self.handle, flags)?;

        self.state = CommandBufferState::Initial;
        Ok(())
    }

    /// Mark a recording buffer whose recording function failed.
    pub(crate) fn invalidate(&mut self) {
        self.state = CommandBufferState::Invalid;
    }

    /// Executable -> Pending, after a successful submit.
    pub(crate) fn mark_pending(&mut self) {
        debug_assert_eq!(self.state, CommandBufferState::Executable);
        self.state = CommandBufferState::Pending;
    }

    /// Record that the submission containing this buffer has completed, as
    /// observed through its fence.
    ///
    /// Buffers of a resettable pool are reset and return to Initial. Without
    /// pool reset support, one-time-submit buffers become Invalid and others
    /// stay Executable for resubmission.
    ///
    /// # Safety
    /// The buffer must have been allocated from `device`, and the fence of
    /// its submission must have signaled.
    pub unsafe fn mark_completed<D: CommandDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        self.expect_state(CommandBufferState::Pending, "mark_completed")?;

        if self.resettable {
            let reset =
                device.reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty());
            if let Err(e) = reset {
                self.state = CommandBufferState::Invalid;
                return Err(e.into());
            }
            self.state = CommandBufferState::Initial;
        } else if self.usage.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
            self.state = CommandBufferState::Invalid;
        } else {
            self.state = CommandBufferState::Executable;
        }
        Ok(())
    }
}

/// Command pool for allocating command buffers.
pub struct CommandPool<D: CommandDevice = Device> {
    device: Arc<D>,
    pool: vk::CommandPool,
    queue_family: u32,
    resettable: bool,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl<D: CommandDevice> CommandPool<D> {
    /// Create a new command pool.
    ///
    /// A `resettable` pool lets its buffers be reset individually.
    pub fn new(device: Arc<D>, queue_family: u32, resettable: bool) -> Result<Self> {
        let flags = if resettable {
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
        } else {
            vk::CommandPoolCreateFlags::empty()
        };
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        // SAFETY: the create info references no external memory.
        let pool = unsafe { device.create_command_pool(&create_info)? };

        Ok(Self {
            device,
            pool,
            queue_family,
            resettable,
            _not_sync: PhantomData,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Whether buffers and the pool may be reset.
    pub fn is_resettable(&self) -> bool {
        self.resettable
    }

    /// The device this pool belongs to.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Allocate `count` primary command buffers in the Initial state.
    pub fn allocate(&self, count: u32) -> Result<Vec<CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        // SAFETY: the pool is owned by this thread (the type is !Sync).
        let handles = unsafe { self.device.allocate_command_buffers(&alloc_info)? };

        Ok(handles
            .into_iter()
            .map(|handle| CommandBuffer::new(handle, self.pool, self.resettable))
            .collect())
    }

    /// Reset the whole pool, returning every listed buffer to Initial.
    ///
    /// `buffers` must list the buffers allocated from this pool that the caller
    /// still tracks.
    pub fn reset(&self, buffers: &mut [CommandBuffer], release_resources: bool) -> Result<()> {
        if !self.resettable {
            return Err(GpuError::PoolNotResettable);
        }
        self.check_owned(buffers)?;
        if buffers
            .iter()
            .any(|b| b.state == CommandBufferState::Pending)
        {
            return Err(GpuError::InvalidUsage(
                "cannot reset a pool with pending command buffers".to_string(),
            ));
        }

        let flags = if release_resources {
            vk::CommandPoolResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandPoolResetFlags::empty()
        };
        // SAFETY: no listed buffer is pending.
        unsafe { self.device.reset_command_pool(self.pool, flags)? };

        for buffer in buffers {
            buffer.state = CommandBufferState::Initial;
        }
        Ok(())
    }

    /// Reset the pool after the submissions carrying `buffers` completed.
    ///
    /// Every listed buffer must be Pending. Without `release_resources` they
    /// return to Initial; releasing the pool's memory leaves them Invalid
    /// until they are reset individually.
    ///
    /// # Safety
    /// The fences of every submission carrying a listed buffer must have
    /// signaled.
    pub unsafe fn reset_completed(
        &self,
        buffers: &mut [CommandBuffer],
        release_resources: bool,
    ) -> Result<()> {
        if !self.resettable {
            return Err(GpuError::PoolNotResettable);
        }
        self.check_owned(buffers)?;
        if let Some(buffer) = buffers
            .iter()
            .find(|b| b.state != CommandBufferState::Pending)
        {
            buffer.expect_state(CommandBufferState::Pending, "reset_completed")?;
        }

        let flags = if release_resources {
            vk::CommandPoolResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandPoolResetFlags::empty()
        };
        self.device.reset_command_pool(self.pool, flags)?;

        let state = if release_resources {
            CommandBufferState::Invalid
        } else {
            CommandBufferState::Initial
        };
        for buffer in buffers {
            buffer.state = state;
        }
        Ok(())
    }

    /// Return buffers to the pool.
    pub fn free(&self, buffers: Vec<CommandBuffer>) -> Result<()> {
        self.check_owned(&buffers)?;
        if buffers
            .iter()
            .any(|b| b.state == CommandBufferState::Pending)
        {
            return Err(GpuError::InvalidUsage(
                "cannot free a pending command buffer".to_string(),
            ));
        }

        let handles: Vec<_> = buffers.iter().map(CommandBuffer::handle).collect();
        // SAFETY: every buffer came from this pool and none is pending.
        unsafe { self.device.free_command_buffers(self.pool, &handles) };
        Ok(())
    }

    fn check_owned(&self, buffers: &[CommandBuffer]) -> Result<()> {
        if buffers.iter().any(|b| b.pool != self.pool) {
            return Err(GpuError::InvalidUsage(
                "command buffer belongs to a different pool".to_string(),
            ));
        }
        Ok(())
    }
}

impl<D: CommandDevice> Drop for CommandPool<D> {
    fn drop(&mut self) {
        // SAFETY: destroying the pool frees its buffers; callers must not
        // drop a pool while its buffers are pending.
        unsafe { self.device.destroy_command_pool(self.pool) };
    }
}

/// A semaphore to wait on before the given pipeline stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// One entry of a queue submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitBatch {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<SemaphoreWait>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// Submit executable command buffers in one call.
///
/// `submissions` pairs each batch with the buffers it carries so their states
/// can be advanced to Pending on success. Callers should gather everything
/// ready for the queue into a single call instead of submitting piecemeal.
///
/// # Safety
/// Every semaphore and fence must belong to `device`, and `queue` must be a
/// queue of `device`.
pub unsafe fn submit<D: CommandDevice + ?Sized>(
    device: &D,
    queue: &Queue,
    submissions: &mut [(SubmitBatch, Vec<&mut CommandBuffer>)],
    fence: vk::Fence,
) -> Result<()> {
    for (batch, buffers) in submissions.iter() {
        for buffer in buffers {
            buffer.expect_state(CommandBufferState::Executable, "submit")?;
        }
        if batch.command_buffers.len() != buffers.len()
            || batch
                .command_buffers
                .iter()
                .zip(buffers)
                .any(|(handle, buffer)| *handle != buffer.handle)
        {
            return Err(GpuError::InvalidUsage(
                "submit batch does not match its command buffers".to_string(),
            ));
        }
    }

    let batches: Vec<SubmitBatch> = submissions.iter().map(|(batch, _)| batch.clone()).collect();
    queue.submit(device, &batches, fence)?;

    for (_, buffers) in submissions.iter_mut() {
        for buffer in buffers.iter_mut() {
            buffer.mark_pending();
        }
    }
    Ok(())
}

/// A one-off submission whose fence has not been observed signaled.
///
/// Dropping it blocks until the fence signals, so the fence is never
/// destroyed while the GPU may still write it.
pub struct InFlightCommands {
    command_buffer: Option<CommandBuffer>,
    fence: Fence,
}

impl InFlightCommands {
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Whether the submission has completed, without blocking.
    pub fn is_complete(&self) -> Result<bool> {
        self.fence.is_signaled()
    }

    /// Block until the submission completes or `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.fence.wait(timeout_ns)
    }

    /// Return the command buffer to `pool` once the submission completed.
    ///
    /// # Errors
    /// [`GpuError::InvalidUsage`] if the fence has not signaled yet.
    pub fn finish(mut self, pool: &CommandPool<Device>) -> Result<()> {
        if !self.fence.is_signaled()? {
            return Err(GpuError::InvalidUsage(
                "single-time submission is still pending".to_string(),
            ));
        }
        let Some(mut cmd) = self.command_buffer.take() else {
            return Ok(());
        };
        // SAFETY: the buffer came from `pool` and its fence has signaled.
        unsafe { cmd.mark_completed(&**pool.device())? };
        pool.free(vec![cmd])
    }
}

impl Drop for InFlightCommands {
    fn drop(&mut self) {
        if matches!(self.fence.is_signaled(), Ok(true)) {
            return;
        }
        tracing::warn!("Dropping a pending single-time submission; waiting for its fence");
        if let Err(e) = self.fence.wait(u64::MAX) {
            tracing::warn!("Fence wait before drop failed: {e}");
        }
    }
}

/// Record and execute a one-off command buffer, waiting on a fence for at
/// most `timeout_ns`.
///
/// Returns `None` once the work has completed and the command buffer is back
/// in `pool`. If the wait times out the submission keeps running and is
/// handed back; the caller must keep everything it references alive until
/// [`InFlightCommands::is_complete`] reports true.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn execute_single_time_commands<F>(
    pool: &CommandPool<Device>,
    queue: &Queue,
    timeout_ns: u64,
    record: F,
) -> Result<Option<InFlightCommands>>
where
    F: FnOnce(&Device, &CommandBuffer) -> Result<()>,
{
    let device = pool.device().clone();
    let mut cmd = pool
        .allocate(1)?
        .pop()
        .ok_or_else(|| GpuError::Other("driver returned no command buffer".to_string()))?;

    // SAFETY: the buffer was just allocated from a pool of this device.
    let recorded = unsafe {
        cmd.begin(&*device, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .and_then(|()| record(&*device, &cmd))
            .and_then(|()| cmd.end(&*device))
    };
    if let Err(e) = recorded {
        cmd.invalidate();
        pool.free(vec![cmd])?;
        return Err(e);
    }

    let fence = match Fence::new(device.clone(), false) {
        Ok(fence) => fence,
        Err(e) => {
            pool.free(vec![cmd])?;
            return Err(e);
        }
    };
    let batch = SubmitBatch {
        command_buffers: vec![cmd.handle()],
        ..Default::default()
    };
    // SAFETY: the fence and buffer belong to this device.
    let submitted =
        unsafe { submit(&*device, queue, &mut [(batch, vec![&mut cmd])], fence.handle()) };
    if let Err(e) = submitted {
        pool.free(vec![cmd])?;
        return Err(e);
    }

    let in_flight = InFlightCommands {
        command_buffer: Some(cmd),
        fence,
    };
    match in_flight.wait(timeout_ns) {
        Ok(()) => in_flight.finish(pool).map(|()| None),
        Err(GpuError::SynchronizationTimeout { .. }) => {
            tracing::warn!("Single-time submission still running after {timeout_ns} ns");
            Ok(Some(in_flight))
        }
        Err(e) => Err(e),
    }
}
