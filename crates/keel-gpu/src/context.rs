//! GPU context management.

use crate::capabilities::PhysicalDeviceDescriptor;
use crate::device::{
    enumerate_physical_devices, rank_by_preference, select_physical_device, select_queue_family,
    Device, Queue,
};
use crate::error::Result;
use crate::instance::{Instance, InstanceConfig};
use crate::parallel::ParallelRecorder;
use crate::pipeline_cache::PipelineCache;
use crate::resource::ResourceFactory;
use crate::sync::DEFAULT_FENCE_TIMEOUT_NS;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::Arc;

/// Instance, device and the services built on them.
///
/// Fields are declared in teardown order: resources go first, the instance
/// last.
pub struct GpuContext {
    resources: Mutex<ResourceFactory>,
    pipeline_cache: Option<PipelineCache>,
    recorder: ParallelRecorder,
    device: Arc<Device>,
    physical: PhysicalDeviceDescriptor,
    instance: Arc<Instance>,
    fence_timeout_ns: u64,
}

impl GpuContext {
    /// Get the logical device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Get the instance.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// The selected physical device.
    pub fn physical_device(&self) -> &PhysicalDeviceDescriptor {
        &self.physical
    }

    /// The first queue of the selected family.
    pub fn queue(&self) -> &Queue {
        self.device.queue()
    }

    pub fn queue_family(&self) -> u32 {
        self.device.queue_family()
    }

    /// Get access to the resource factory.
    pub fn resources(&self) -> &Mutex<ResourceFactory> {
        &self.resources
    }

    /// The worker pool used for parallel recording.
    pub fn recorder(&self) -> &ParallelRecorder {
        &self.recorder
    }

    pub fn pipeline_cache(&self) -> Option<&PipelineCache> {
        self.pipeline_cache.as_ref()
    }

    /// Upper bound for every fence wait issued on behalf of the caller.
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ns
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

/// Builder for creating a GPU context.
#[derive(Debug, Clone)]
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    headless: bool,
    required_extensions: Vec<CString>,
    required_queue_flags: vk::QueueFlags,
    prefer_discrete: bool,
    worker_threads: usize,
    fence_timeout_ns: u64,
    pipeline_cache_data: Option<Vec<u8>>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        let instance = InstanceConfig::default();
        Self {
            app_name: instance.app_name,
            enable_validation: instance.enable_validation,
            headless: instance.headless,
            required_extensions: Vec::new(),
            required_queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
            prefer_discrete: true,
            worker_threads: std::thread::available_parallelism().map_or(4, usize::from),
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            pipeline_cache_data: None,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Skip window-system extensions and the swapchain device extension.
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Require a device extension in addition to the defaults.
    pub fn require_extension(mut self, name: &CStr) -> Self {
        self.required_extensions.push(name.to_owned());
        self
    }

    pub fn queue_flags(mut self, flags: vk::QueueFlags) -> Self {
        self.required_queue_flags = flags;
        self
    }

    /// Rank discrete GPUs first before first-fit selection.
    pub fn prefer_discrete(mut self, prefer: bool) -> Self {
        self.prefer_discrete = prefer;
        self
    }

    /// Number of threads recording command buffers in parallel.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    pub fn fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Seed the pipeline cache with a blob from a previous run.
    pub fn pipeline_cache_data(mut self, data: Vec<u8>) -> Self {
        self.pipeline_cache_data = Some(data);
        self
    }

    /// Device extensions requested from the selected device.
    fn device_extensions(&self) -> Vec<&CStr> {
        let mut extensions: Vec<&CStr> = Vec::new();
        if !self.headless {
            extensions.push(ash::khr::swapchain::NAME);
        }
        for extension in &self.required_extensions {
            if !extensions.contains(&extension.as_c_str()) {
                extensions.push(extension.as_c_str());
            }
        }
        extensions
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let instance = Arc::new(Instance::new(&InstanceConfig {
            app_name: self.app_name.clone(),
            enable_validation: self.enable_validation,
            headless: self.headless,
        })?);

        let mut devices = enumerate_physical_devices(&instance)?;
        if self.prefer_discrete {
            rank_by_preference(&mut devices);
        }

        let extensions = self.device_extensions();
        let physical = select_physical_device(&devices, &extensions)?.clone();
        let queue_family = select_queue_family(&physical.queue_families, self.required_queue_flags)?;

        tracing::info!("Selected GPU: {}", physical.summary());

        let device = Arc::new(Device::new(
            instance.clone(),
            &physical,
            queue_family,
            &extensions,
            &vk::PhysicalDeviceFeatures::default(),
        )?);

        let recorder = ParallelRecorder::new(self.worker_threads)?;
        let pipeline_cache = self
            .pipeline_cache_data
            .as_deref()
            .map(|data| PipelineCache::new(device.clone(), Some(data)))
            .transpose()?;
        let resources = ResourceFactory::new(device.clone(), &physical, self.fence_timeout_ns)?;

        Ok(GpuContext {
            resources: Mutex::new(resources),
            pipeline_cache,
            recorder,
            device,
            physical,
            instance,
            fence_timeout_ns: self.fence_timeout_ns,
        })
    }
}
