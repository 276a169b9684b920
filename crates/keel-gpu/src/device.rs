//! Physical device selection and logical device management.

use crate::capabilities::{PhysicalDeviceDescriptor, QueueFamily};
use crate::command::SubmitBatch;
use crate::dispatch::CommandDevice;
use crate::error::{GpuError, Result};
use crate::instance::Instance;
use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::Arc;

/// Enumerate and snapshot every physical device.
///
/// # Errors
/// [`GpuError::NoDevicesFound`] when the driver reports zero devices.
pub fn enumerate_physical_devices(instance: &Instance) -> Result<Vec<PhysicalDeviceDescriptor>> {
    // SAFETY: the instance is alive for the duration of the call.
    let handles = unsafe { instance.raw().enumerate_physical_devices()? };

    if handles.is_empty() {
        return Err(GpuError::NoDevicesFound);
    }

    let devices: Vec<_> = handles
        .into_iter()
        // SAFETY: handles were just enumerated from this instance.
        .map(|handle| unsafe { PhysicalDeviceDescriptor::query(instance.raw(), handle) })
        .collect();

    for (i, device) in devices.iter().enumerate() {
        tracing::debug!("Physical device {i}: {}", device.summary());
    }

    Ok(devices)
}

/// Reorder devices by preference: discrete, integrated, virtual, then other,
/// ties broken by device-local memory. The sort is stable.
///
/// Selection itself is first-fit; call this beforehand to prefer stronger
/// hardware.
pub fn rank_by_preference(devices: &mut [PhysicalDeviceDescriptor]) {
    devices.sort_by_key(|device| {
        let type_rank = match device.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            _ => 3,
        };
        (type_rank, std::cmp::Reverse(device.device_local_memory_mb()))
    });
}

/// Pick the first device, in the given order, that supports every required
/// extension.
pub fn select_physical_device<'a>(
    devices: &'a [PhysicalDeviceDescriptor],
    required_extensions: &[&CStr],
) -> Result<&'a PhysicalDeviceDescriptor> {
    devices
        .iter()
        .find(|device| device.supports_extensions(required_extensions))
        .ok_or(GpuError::NoSuitableDevice)
}

/// Index of the first family whose flags contain `required` and that exposes
/// at least one queue.
pub fn select_queue_family(families: &[QueueFamily], required: vk::QueueFlags) -> Result<u32> {
    families
        .iter()
        .position(|family| family.flags.contains(required) && family.queue_count > 0)
        .map(|index| index as u32)
        .ok_or(GpuError::NoMatchingQueueFamily(required))
}

/// A device queue with its submission lock.
///
/// Submissions and presents through the same queue are serialized by the
/// lock, so a `Queue` may be shared across threads.
pub struct Queue {
    handle: vk::Queue,
    family: u32,
    index: u32,
    submit_lock: Mutex<()>,
}

impl Queue {
    pub(crate) fn new(handle: vk::Queue, family: u32, index: u32) -> Self {
        Self {
            handle,
            family,
            index,
            submit_lock: Mutex::new(()),
        }
    }

    /// Get the raw queue handle.
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Queue family index.
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Index within the family.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Submit every batch in one `vkQueueSubmit` call.
    ///
    /// # Safety
    /// Every command buffer must be executable and every semaphore and fence
    /// handle must belong to `device`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit<D: CommandDevice + ?Sized>(
        &self,
        device: &D,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_lists: Vec<(Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>)> = batches
            .iter()
            .map(|batch| {
                batch
                    .waits
                    .iter()
                    .map(|wait| (wait.semaphore, wait.stage))
                    .unzip()
            })
            .collect();

        let submits: Vec<vk::SubmitInfo<'_>> = batches
            .iter()
            .zip(&wait_lists)
            .map(|(batch, (semaphores, stages))| {
                vk::SubmitInfo::default()
                    .command_buffers(&batch.command_buffers)
                    .wait_semaphores(semaphores)
                    .wait_dst_stage_mask(stages)
                    .signal_semaphores(&batch.signal_semaphores)
            })
            .collect();

        let _guard = self.submit_lock.lock();
        device
            .queue_submit(self.handle, &submits, fence)
            .map_err(GpuError::SubmissionFailed)
    }

    /// Run `f` with the queue lock held, for calls such as present that must
    /// not race a submission.
    pub(crate) fn with_lock<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _guard = self.submit_lock.lock();
        f(self.handle)
    }

    /// Wait until the queue is idle.
    pub fn wait_idle(&self, device: &Device) -> Result<()> {
        // SAFETY: the queue belongs to this device and the lock serializes access.
        self.with_lock(|queue| unsafe { device.raw().queue_wait_idle(queue) })?;
        Ok(())
    }
}

/// A logical device, its device-level function table and its queues.
///
/// Every resource, pool, fence and swapchain holds an `Arc<Device>`; the
/// device is destroyed only once all of them are gone.
pub struct Device {
    raw: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    queues: Vec<Queue>,
    extensions: Vec<CString>,
    // Declared last so the instance outlives the device.
    instance: Arc<Instance>,
}

impl Device {
    /// Create a logical device with one queue per slot of `queue_family`,
    /// all at equal priority.
    ///
    /// # Errors
    /// - [`GpuError::ExtensionUnsupported`] when an extension is missing from
    ///   the descriptor.
    /// - [`GpuError::DeviceCreationFailed`] when the driver rejects creation.
    pub fn new(
        instance: Arc<Instance>,
        physical: &PhysicalDeviceDescriptor,
        queue_family: u32,
        extensions: &[&CStr],
        features: &vk::PhysicalDeviceFeatures,
    ) -> Result<Self> {
        for extension in extensions {
            if !physical.supports_extensions(&[*extension]) {
                return Err(GpuError::ExtensionUnsupported(
                    extension.to_string_lossy().into_owned(),
                ));
            }
        }

        let family = physical
            .queue_families
            .get(queue_family as usize)
            .ok_or_else(|| {
                GpuError::InvalidUsage(format!("queue family {queue_family} does not exist"))
            })?;
        if family.queue_count == 0 {
            return Err(GpuError::InvalidUsage(format!(
                "queue family {queue_family} exposes no queues"
            )));
        }

        let priorities = vec![1.0_f32; family.queue_count as usize];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)];

        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(features);

        // SAFETY: the physical device came from this instance and the create
        // info only references locals that outlive the call.
        let raw = unsafe {
            instance
                .raw()
                .create_device(physical.handle, &create_info, None)
                .map_err(GpuError::DeviceCreationFailed)?
        };

        let queues = (0..family.queue_count)
            // SAFETY: every index below queue_count was requested above.
            .map(|index| {
                let handle = unsafe { raw.get_device_queue(queue_family, index) };
                Queue::new(handle, queue_family, index)
            })
            .collect();

        tracing::info!(
            "Created logical device on {} with {} queue(s) from family {}",
            physical.device_name,
            family.queue_count,
            queue_family
        );

        Ok(Self {
            raw,
            physical_device: physical.handle,
            queue_family,
            queues,
            extensions: extensions.iter().map(|ext| CString::from(*ext)).collect(),
            instance,
        })
    }

    /// Device-level function table.
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    /// The instance this device was created from.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The queue family all queues were created from.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// All queues of the selected family.
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// The first queue of the selected family.
    pub fn queue(&self) -> &Queue {
        &self.queues[0]
    }

    /// Extensions the device was created with.
    pub fn enabled_extensions(&self) -> &[CString] {
        &self.extensions
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: device_wait_idle requires all queues to be externally
        // synchronized; hold every queue lock for the duration.
        let _guards: Vec<_> = self.queues.iter().map(|q| q.submit_lock.lock()).collect();
        unsafe { self.raw.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Destroying logical device");
        // SAFETY: every child holds an Arc to this device, so none remain.
        unsafe {
            let _ = self.raw.device_wait_idle();
            self.raw.destroy_device(None);
        }
    }
}

impl CommandDevice for Device {
    unsafe fn create_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool> {
        self.raw.create_command_pool(create_info, None)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.raw.destroy_command_pool(pool, None);
    }

    unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        self.raw.allocate_command_buffers(allocate_info)
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.raw.free_command_buffers(pool, buffers);
    }

    unsafe fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> VkResult<()> {
        self.raw.reset_command_pool(pool, flags)
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        self.raw.begin_command_buffer(command_buffer, begin_info)
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.raw.end_command_buffer(command_buffer)
    }

    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> VkResult<()> {
        self.raw.reset_command_buffer(command_buffer, flags)
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_memory_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_memory_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.raw.cmd_pipeline_barrier(
            command_buffer,
            src_stage_mask,
            dst_stage_mask,
            dependency_flags,
            memory_barriers,
            buffer_memory_barriers,
            image_memory_barriers,
        );
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        self.raw.queue_submit(queue, submits, fence)
    }
}
