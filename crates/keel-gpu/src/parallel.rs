//! Multi-threaded command recording with a single serialized submit.
//!
//! Every task records into its own command buffer, which must come from a
//! pool no other task touches (see [`ParallelRecorder::create_worker_pools`]).
//! All tasks are joined before anything reaches the queue; if any task fails,
//! nothing is submitted.

use crate::command::{self, CommandBuffer, CommandBufferState, CommandPool, SemaphoreWait, SubmitBatch};
use crate::device::Queue;
use crate::dispatch::CommandDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

/// Recording function for one task.
pub type RecordFn<'a, D> = Box<dyn FnOnce(&D, vk::CommandBuffer) -> Result<()> + Send + 'a>;

/// One unit of parallel recording: a command buffer in the Initial state and
/// the function that fills it.
pub struct RecordingTask<'a, D: ?Sized> {
    pub command_buffer: &'a mut CommandBuffer,
    pub usage: vk::CommandBufferUsageFlags,
    pub record: RecordFn<'a, D>,
}

impl<'a, D: CommandDevice + ?Sized> RecordingTask<'a, D> {
    pub fn new<F>(command_buffer: &'a mut CommandBuffer, record: F) -> Self
    where
        F: FnOnce(&D, vk::CommandBuffer) -> Result<()> + Send + 'a,
    {
        Self {
            command_buffer,
            usage: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            record: Box::new(record),
        }
    }

    /// Override the usage flags passed to `begin`.
    pub fn usage(mut self, usage: vk::CommandBufferUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    fn run(self, device: &D) -> (&'a mut CommandBuffer, Result<()>) {
        let Self {
            command_buffer,
            usage,
            record,
        } = self;

        // SAFETY: the buffer was allocated from a pool of `device` and is
        // exclusively borrowed by this task.
        let result = unsafe { command_buffer.begin(device, usage) }
            .and_then(|()| record(device, command_buffer.handle()))
            .and_then(|()| unsafe { command_buffer.end(device) });

        if result.is_err() && command_buffer.state() == CommandBufferState::Recording {
            command_buffer.invalidate();
        }
        (command_buffer, result)
    }
}

/// Bounded worker pool for command recording.
pub struct ParallelRecorder {
    pool: rayon::ThreadPool,
}

impl ParallelRecorder {
    /// Create a recorder with `num_threads` workers; zero picks one per
    /// logical CPU.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("keel-record-{i}"))
            .build()
            .map_err(|e| GpuError::Other(format!("failed to start recording workers: {e}")))?;

        tracing::debug!("Started {} recording workers", pool.current_num_threads());
        Ok(Self { pool })
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Create one command pool per worker thread.
    pub fn create_worker_pools<D: CommandDevice>(
        &self,
        device: &Arc<D>,
        queue_family: u32,
        resettable: bool,
    ) -> Result<Vec<CommandPool<D>>> {
        (0..self.num_threads())
            .map(|_| CommandPool::new(device.clone(), queue_family, resettable))
            .collect()
    }

    /// Record every task in parallel, join, then submit all command buffers
    /// in one batch.
    ///
    /// On success every buffer is Pending. If any task fails, the error of
    /// the lowest-indexed failing task is returned as
    /// [`GpuError::RecordingFailed`], the failed buffers are Invalid, the
    /// others stay Executable, and no submission is made.
    ///
    /// Tasks whose buffers share a pool are rejected with
    /// [`GpuError::InvalidUsage`] before any recording starts.
    ///
    /// # Safety
    /// Every command buffer must come from a pool of `device`, and every
    /// semaphore and fence must belong to `device`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record_on_multiple_threads<'a, D: CommandDevice + ?Sized>(
        &self,
        device: &D,
        queue: &Queue,
        tasks: Vec<RecordingTask<'a, D>>,
        waits: &[SemaphoreWait],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let task_count = tasks.len();
        ensure_distinct_pools(&tasks)?;
        let outcomes: Vec<(&'a mut CommandBuffer, Result<()>)> = self
            .pool
            .install(|| tasks.into_par_iter().map(|task| task.run(device)).collect());

        let mut buffers = Vec::with_capacity(task_count);
        let mut first_failure = None;
        for (index, (buffer, result)) in outcomes.into_iter().enumerate() {
            if let Err(e) = result {
                tracing::warn!("Recording task {index} failed: {e}");
                first_failure.get_or_insert(GpuError::RecordingFailed {
                    task: index,
                    reason: e.to_string(),
                });
            }
            buffers.push(buffer);
        }
        if let Some(e) = first_failure {
            return Err(e);
        }

        let batch = SubmitBatch {
            command_buffers: buffers.iter().map(|b| b.handle()).collect(),
            waits: waits.to_vec(),
            signal_semaphores: signal_semaphores.to_vec(),
        };
        command::submit(device, queue, &mut [(batch, buffers)], fence)?;

        tracing::debug!("Submitted {task_count} command buffers recorded in parallel");
        Ok(())
    }
}

/// Command pools are externally synchronized, so each task needs its own.
fn ensure_distinct_pools<D: ?Sized>(tasks: &[RecordingTask<'_, D>]) -> Result<()> {
    let mut seen = HashSet::with_capacity(tasks.len());
    for (index, task) in tasks.iter().enumerate() {
        if !seen.insert(task.command_buffer.pool()) {
            return Err(GpuError::InvalidUsage(format!(
                "recording task {index} shares its command pool with an earlier task"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockDevice};
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(workers: usize) -> (Arc<MockDevice>, ParallelRecorder, Queue) {
        let device = Arc::new(MockDevice::default());
        let recorder = ParallelRecorder::new(workers).unwrap();
        (device, recorder, Queue::new(vk::Queue::null(), 0, 0))
    }

    /// One buffer from each of `count` distinct pools.
    fn worker_buffers(
        device: &Arc<MockDevice>,
        count: usize,
    ) -> (Vec<CommandPool<MockDevice>>, Vec<CommandBuffer>) {
        let pools: Vec<_> = (0..count)
            .map(|_| CommandPool::new(device.clone(), 0, true).unwrap())
            .collect();
        let buffers = pools
            .iter()
            .map(|pool| pool.allocate(1).unwrap().remove(0))
            .collect();
        (pools, buffers)
    }

    #[test]
    fn failing_task_aborts_the_whole_batch() {
        let (device, recorder, queue) = setup(3);
        let (_pools, mut buffers) = worker_buffers(&device, 3);

        let tasks: Vec<RecordingTask<'_, MockDevice>> = buffers
            .iter_mut()
            .enumerate()
            .map(|(i, buffer)| {
                RecordingTask::new(buffer, move |_: &MockDevice, _| {
                    if i == 1 {
                        Err(GpuError::Other("task 2 failed".to_string()))
                    } else {
                        Ok(())
                    }
                })
            })
            .collect();

        let result = unsafe {
            recorder.record_on_multiple_threads(&*device, &queue, tasks, &[], &[], vk::Fence::null())
        };

        assert_eq!(
            result.unwrap_err(),
            GpuError::RecordingFailed {
                task: 1,
                reason: "task 2 failed".to_string(),
            }
        );
        assert_eq!(device.submit_count(), 0);
        assert_eq!(buffers[0].state(), CommandBufferState::Executable);
        assert_eq!(buffers[1].state(), CommandBufferState::Invalid);
        assert_eq!(buffers[2].state(), CommandBufferState::Executable);
    }

    #[test]
    fn n_tasks_produce_one_submission_with_n_buffers() {
        let (device, recorder, queue) = setup(2);
        let (_pools, mut buffers) = worker_buffers(&device, 5);
        let recorded = AtomicUsize::new(0);

        let tasks: Vec<RecordingTask<'_, MockDevice>> = buffers
            .iter_mut()
            .map(|buffer| {
                let recorded = &recorded;
                RecordingTask::new(buffer, move |_: &MockDevice, _| {
                    recorded.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        unsafe {
            recorder
                .record_on_multiple_threads(&*device, &queue, tasks, &[], &[], vk::Fence::null())
                .unwrap();
        }

        assert_eq!(recorded.load(Ordering::SeqCst), 5);
        assert_eq!(device.submit_count(), 1);
        assert!(device.calls().contains(&MockCall::Submit {
            batches: 1,
            command_buffers: 5,
        }));
        assert!(buffers
            .iter()
            .all(|b| b.state() == CommandBufferState::Pending));
    }

    #[test]
    fn tasks_receive_their_own_buffer() {
        let (device, recorder, queue) = setup(4);
        let (_pools, mut buffers) = worker_buffers(&device, 4);
        let expected: Vec<_> = buffers.iter().map(CommandBuffer::handle).collect();

        let tasks: Vec<RecordingTask<'_, MockDevice>> = buffers
            .iter_mut()
            .zip(expected.clone())
            .map(|(buffer, handle)| {
                RecordingTask::new(buffer, move |_: &MockDevice, recorded: vk::CommandBuffer| {
                    if recorded == handle {
                        Ok(())
                    } else {
                        Err(GpuError::Other("wrong buffer".to_string()))
                    }
                })
            })
            .collect();

        unsafe {
            recorder
                .record_on_multiple_threads(&*device, &queue, tasks, &[], &[], vk::Fence::null())
                .unwrap();
        }
        assert_eq!(device.submit_count(), 1);
    }

    #[test]
    fn submission_failure_leaves_buffers_executable() {
        let device = Arc::new(MockDevice::failing_submits());
        let recorder = ParallelRecorder::new(2).unwrap();
        let queue = Queue::new(vk::Queue::null(), 0, 0);
        let (_pools, mut buffers) = worker_buffers(&device, 2);

        let tasks: Vec<RecordingTask<'_, MockDevice>> = buffers
            .iter_mut()
            .map(|buffer| RecordingTask::new(buffer, |_: &MockDevice, _| Ok(())))
            .collect();
        let waits = [SemaphoreWait {
            semaphore: vk::Semaphore::from_raw(9),
            stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }];

        let result = unsafe {
            recorder.record_on_multiple_threads(
                &*device,
                &queue,
                tasks,
                &waits,
                &[vk::Semaphore::from_raw(10)],
                vk::Fence::null(),
            )
        };

        assert_eq!(
            result.unwrap_err(),
            GpuError::SubmissionFailed(vk::Result::ERROR_DEVICE_LOST)
        );
        assert!(buffers
            .iter()
            .all(|b| b.state() == CommandBufferState::Executable));
    }

    #[test]
    fn worker_pools_match_thread_count() {
        let (device, recorder, _queue) = setup(3);
        let pools = recorder.create_worker_pools(&device, 0, true).unwrap();

        assert_eq!(recorder.num_threads(), 3);
        assert_eq!(pools.len(), 3);
        let mut handles: Vec<_> = pools.iter().map(|p| p.handle().as_raw()).collect();
        handles.dedup();
        assert_eq!(handles.len(), 3);
    }

    #[test]
    fn tasks_sharing_a_pool_are_rejected_before_recording() {
        let (device, recorder, queue) = setup(2);
        let pool = CommandPool::new(device.clone(), 0, true).unwrap();
        let mut buffers = pool.allocate(2).unwrap();
        let ran = AtomicUsize::new(0);

        let tasks: Vec<RecordingTask<'_, MockDevice>> = buffers
            .iter_mut()
            .map(|buffer| {
                RecordingTask::new(buffer, |_: &MockDevice, _| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let err = unsafe {
            recorder.record_on_multiple_threads(&*device, &queue, tasks, &[], &[], vk::Fence::null())
        }
        .unwrap_err();

        assert!(matches!(err, GpuError::InvalidUsage(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(device.submit_count(), 0);
        assert!(!device
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::Begin(_))));
        assert!(buffers
            .iter()
            .all(|b| b.state() == CommandBufferState::Initial));
    }
}
