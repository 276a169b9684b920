//! Buffers, images, views, samplers and shader modules.
//!
//! The [`ResourceFactory`] owns everything it creates in a creation-ordered
//! arena. Creating a buffer or image is atomic: the handle, its dedicated
//! memory and the optional view are either all returned or all released.
//! Dropping the factory waits for the device and destroys survivors in
//! reverse creation order.

use crate::arena::{CreationArena, ResourceId};
use crate::barrier::{build_buffer_barriers, build_image_barriers, issue_barriers, BufferTransition, ImageTransition};
use crate::capabilities::PhysicalDeviceDescriptor;
use crate::command::{execute_single_time_commands, CommandBuffer, CommandPool, InFlightCommands};
use crate::deferred::RetireQueue;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{self, find_memory_type, BindMemory, MemoryAllocation};
use ash::prelude::VkResult;
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

/// Which feature set of a format a usage draws on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureClass {
    /// `bufferFeatures`, for texel buffers.
    Buffer,
    /// Linear or optimal tiling features, for images.
    Tiling(vk::ImageTiling),
}

/// Fail unless `properties` grants every feature in `required` for `class`.
pub fn require_format_features(
    format: vk::Format,
    properties: &vk::FormatProperties,
    class: FeatureClass,
    required: vk::FormatFeatureFlags,
) -> Result<()> {
    let supported = match class {
        FeatureClass::Buffer => properties.buffer_features,
        FeatureClass::Tiling(vk::ImageTiling::LINEAR) => properties.linear_tiling_features,
        FeatureClass::Tiling(_) => properties.optimal_tiling_features,
    };
    if supported.contains(required) {
        Ok(())
    } else {
        Err(GpuError::FormatFeatureUnsupported {
            format,
            features: required,
        })
    }
}

/// Image aspect implied by a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// View type covering a whole image.
pub fn default_view_type(image_type: vk::ImageType, array_layers: u32) -> vk::ImageViewType {
    match (image_type, array_layers > 1) {
        (vk::ImageType::TYPE_1D, false) => vk::ImageViewType::TYPE_1D,
        (vk::ImageType::TYPE_1D, true) => vk::ImageViewType::TYPE_1D_ARRAY,
        (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
        (_, false) => vk::ImageViewType::TYPE_2D,
        (_, true) => vk::ImageViewType::TYPE_2D_ARRAY,
    }
}

/// Extra usage and format features an input attachment of `format` needs.
///
/// Color formats must also be color attachments; depth/stencil formats must
/// be depth/stencil attachments.
pub fn input_attachment_requirements(
    format: vk::Format,
) -> (vk::ImageUsageFlags, vk::FormatFeatureFlags) {
    if aspect_for_format(format) == vk::ImageAspectFlags::COLOR {
        (
            vk::ImageUsageFlags::INPUT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::FormatFeatureFlags::COLOR_ATTACHMENT,
        )
    } else {
        (
            vk::ImageUsageFlags::INPUT_ATTACHMENT | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }
}

/// Parameters for a buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferViewDesc {
    pub format: vk::Format,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// Parameters for [`ResourceFactory::create_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
    pub view: Option<BufferViewDesc>,
}

impl BufferDesc {
    /// Device-local buffer.
    pub fn device_local(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            view: None,
        }
    }

    /// Host-visible, host-coherent buffer.
    pub fn host_visible(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            view: None,
        }
    }

    /// Pair the buffer with a view of its whole range.
    pub fn with_view(mut self, format: vk::Format) -> Self {
        self.view = Some(BufferViewDesc {
            format,
            offset: 0,
            range: vk::WHOLE_SIZE,
        });
        self
    }
}

/// Parameters for [`ResourceFactory::create_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
    pub with_view: bool,
}

impl ImageDesc {
    /// Single-sampled, optimally tiled, device-local 2D image.
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            with_view: false,
        }
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    /// Pair the image with a view of every level and layer.
    pub fn with_view(mut self) -> Self {
        self.with_view = true;
        self
    }
}

/// A buffer with its dedicated memory and optional view.
#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory: Option<MemoryAllocation>,
    view: Option<vk::BufferView>,
}

impl Buffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn view(&self) -> Option<vk::BufferView> {
        self.view
    }

    pub fn memory(&self) -> Option<&MemoryAllocation> {
        self.memory.as_ref()
    }

    /// Host-visible memory backing `[offset, offset + len)`.
    fn host_memory(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<&MemoryAllocation> {
        let memory = self
            .memory
            .as_ref()
            .filter(|memory| memory.is_host_visible())
            .ok_or_else(|| GpuError::InvalidUsage("buffer memory is not host-visible".to_string()))?;

        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(memory),
            _ => Err(GpuError::InvalidUsage(format!(
                "range {offset}+{len} exceeds buffer size {}",
                self.size
            ))),
        }
    }

    unsafe fn destroy(mut self, device: &ash::Device) {
        if let Some(view) = self.view.take() {
            device.destroy_buffer_view(view, None);
        }
        device.destroy_buffer(self.handle, None);
        if let Some(memory) = self.memory.take() {
            memory.free(device);
        }
    }
}

impl BindMemory for Buffer {
    fn bound_memory(&self) -> Option<&MemoryAllocation> {
        self.memory.as_ref()
    }

    unsafe fn bind_raw(
        &self,
        device: &ash::Device,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        device.bind_buffer_memory(self.handle, memory, offset)
    }

    fn attach(&mut self, allocation: MemoryAllocation) {
        self.memory = Some(allocation);
    }
}

/// An image with its dedicated memory and optional view.
#[derive(Debug)]
pub struct Image {
    handle: vk::Image,
    image_type: vk::ImageType,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
    memory: Option<MemoryAllocation>,
    view: Option<vk::ImageView>,
}

impl Image {
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn view(&self) -> Option<vk::ImageView> {
        self.view
    }

    pub fn memory(&self) -> Option<&MemoryAllocation> {
        self.memory.as_ref()
    }

    unsafe fn create_view(&self, device: &ash::Device) -> VkResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(self.handle)
            .view_type(default_view_type(self.image_type, self.array_layers))
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: self.mip_levels,
                base_array_layer: 0,
                layer_count: self.array_layers,
            });
        device.create_image_view(&create_info, None)
    }

    unsafe fn destroy(mut self, device: &ash::Device) {
        if let Some(view) = self.view.take() {
            device.destroy_image_view(view, None);
        }
        device.destroy_image(self.handle, None);
        if let Some(memory) = self.memory.take() {
            memory.free(device);
        }
    }
}

impl BindMemory for Image {
    fn bound_memory(&self) -> Option<&MemoryAllocation> {
        self.memory.as_ref()
    }

    unsafe fn bind_raw(
        &self,
        device: &ash::Device,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        device.bind_image_memory(self.handle, memory, offset)
    }

    fn attach(&mut self, allocation: MemoryAllocation) {
        self.memory = Some(allocation);
    }
}

/// Everything the factory can own.
#[derive(Debug)]
enum Owned {
    Buffer(Buffer),
    Image(Image),
    Sampler(vk::Sampler),
    ShaderModule(vk::ShaderModule),
}

impl Owned {
    fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Image(_) => "image",
            Self::Sampler(_) => "sampler",
            Self::ShaderModule(_) => "shader module",
        }
    }

    unsafe fn destroy(self, device: &ash::Device) {
        match self {
            Self::Buffer(buffer) => buffer.destroy(device),
            Self::Image(image) => image.destroy(device),
            Self::Sampler(sampler) => device.destroy_sampler(sampler, None),
            Self::ShaderModule(module) => device.destroy_shader_module(module, None),
        }
    }
}

/// Allocate dedicated memory for `resource` and bind it at offset zero.
unsafe fn back_with_memory<R: BindMemory>(
    device: &ash::Device,
    memory_types: &[vk::MemoryType],
    resource: &mut R,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<()> {
    let type_index = find_memory_type(memory_types, requirements.memory_type_bits, properties)?;
    let allocation = MemoryAllocation::allocate(device, memory_types, type_index, requirements.size)?;
    memory::bind(device, resource, allocation, 0)
}

/// An upload whose fence wait timed out, with the staging buffer it reads.
struct StalledUpload {
    commands: InFlightCommands,
    staging: ResourceId,
}

/// Creates and owns GPU resources for one device.
pub struct ResourceFactory {
    device: Arc<Device>,
    memory_types: Vec<vk::MemoryType>,
    non_coherent_atom_size: vk::DeviceSize,
    arena: CreationArena<Owned>,
    retired: RetireQueue<(ResourceId, Owned)>,
    stalled: Vec<StalledUpload>,
    upload_pool: CommandPool<Device>,
    fence_timeout_ns: u64,
}

impl ResourceFactory {
    /// Create a factory for `device`, which must have been created from
    /// `physical`. Uploads wait at most `fence_timeout_ns`.
    pub fn new(
        device: Arc<Device>,
        physical: &PhysicalDeviceDescriptor,
        fence_timeout_ns: u64,
    ) -> Result<Self> {
        let upload_pool = CommandPool::new(device.clone(), device.queue_family(), false)?;
        Ok(Self {
            device,
            memory_types: physical.memory_types.clone(),
            non_coherent_atom_size: physical.properties.limits.non_coherent_atom_size,
            arena: CreationArena::new(),
            retired: RetireQueue::new(),
            stalled: Vec::new(),
            upload_pool,
            fence_timeout_ns,
        })
    }

    /// The device resources are created on.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Number of live resources, excluding retired ones.
    pub fn live_count(&self) -> usize {
        self.arena.len()
    }

    /// Create a buffer, bind dedicated memory and, if requested, its view.
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId> {
        let device = self.device.raw();
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the create info references nothing external.
        let handle = unsafe { device.create_buffer(&create_info, None)? };
        let mut buffer = Buffer {
            handle,
            size: desc.size,
            usage: desc.usage,
            memory: None,
            view: None,
        };

        // SAFETY: the buffer was just created on this device and is unused.
        let completed = unsafe {
            let requirements = device.get_buffer_memory_requirements(handle);
            back_with_memory(device, &self.memory_types, &mut buffer, requirements, desc.memory)
                .and_then(|()| match desc.view {
                    Some(view) => {
                        buffer.view = Some(create_buffer_view(device, handle, &view)?);
                        Ok(())
                    }
                    None => Ok(()),
                })
        };
        if let Err(e) = completed {
            // SAFETY: nothing else has seen the buffer yet.
            unsafe { buffer.destroy(device) };
            return Err(e);
        }

        let id = self.arena.insert(Owned::Buffer(buffer));
        tracing::debug!("Created buffer {id} ({} bytes, {:?})", desc.size, desc.usage);
        Ok(id)
    }

    /// Create an image, bind dedicated memory and, if requested, its view.
    pub fn create_image(&mut self, desc: &ImageDesc) -> Result<ResourceId> {
        let device = self.device.raw();
        let create_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: the create info references nothing external.
        let handle = unsafe { device.create_image(&create_info, None)? };
        let mut image = Image {
            handle,
            image_type: desc.image_type,
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            usage: desc.usage,
            aspect: aspect_for_format(desc.format),
            memory: None,
            view: None,
        };

        // SAFETY: the image was just created on this device and is unused.
        let completed = unsafe {
            let requirements = device.get_image_memory_requirements(handle);
            back_with_memory(device, &self.memory_types, &mut image, requirements, desc.memory)
                .and_then(|()| {
                    if desc.with_view {
                        image.view = Some(image.create_view(device)?);
                    }
                    Ok(())
                })
        };
        if let Err(e) = completed {
            // SAFETY: nothing else has seen the image yet.
            unsafe { image.destroy(device) };
            return Err(e);
        }

        let id = self.arena.insert(Owned::Image(image));
        tracing::debug!(
            "Created image {id} ({:?} {}x{}x{})",
            desc.format,
            desc.extent.width,
            desc.extent.height,
            desc.extent.depth
        );
        Ok(id)
    }

    pub fn create_storage_buffer(&mut self, mut desc: BufferDesc) -> Result<ResourceId> {
        desc.usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        self.create_buffer(&desc)
    }

    pub fn create_uniform_buffer(&mut self, mut desc: BufferDesc) -> Result<ResourceId> {
        desc.usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        self.create_buffer(&desc)
    }

    /// Storage texel buffer with a view in `format`.
    pub fn create_storage_texel_buffer(
        &mut self,
        desc: BufferDesc,
        format: vk::Format,
    ) -> Result<ResourceId> {
        self.require(
            format,
            FeatureClass::Buffer,
            vk::FormatFeatureFlags::STORAGE_TEXEL_BUFFER,
        )?;
        let mut desc = desc.with_view(format);
        desc.usage |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        self.create_buffer(&desc)
    }

    /// Uniform texel buffer with a view in `format`.
    pub fn create_uniform_texel_buffer(
        &mut self,
        desc: BufferDesc,
        format: vk::Format,
    ) -> Result<ResourceId> {
        self.require(
            format,
            FeatureClass::Buffer,
            vk::FormatFeatureFlags::UNIFORM_TEXEL_BUFFER,
        )?;
        let mut desc = desc.with_view(format);
        desc.usage |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
        self.create_buffer(&desc)
    }

    pub fn create_storage_image(&mut self, mut desc: ImageDesc) -> Result<ResourceId> {
        self.require(
            desc.format,
            FeatureClass::Tiling(desc.tiling),
            vk::FormatFeatureFlags::STORAGE_IMAGE,
        )?;
        desc.usage |= vk::ImageUsageFlags::STORAGE;
        self.create_image(&desc)
    }

    /// Sampled image; the format must support linear filtering.
    pub fn create_sampled_image(&mut self, mut desc: ImageDesc) -> Result<ResourceId> {
        self.require(
            desc.format,
            FeatureClass::Tiling(desc.tiling),
            vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        )?;
        desc.usage |= vk::ImageUsageFlags::SAMPLED;
        self.create_image(&desc)
    }

    pub fn create_input_attachment(&mut self, mut desc: ImageDesc) -> Result<ResourceId> {
        let (usage, features) = input_attachment_requirements(desc.format);
        self.require(desc.format, FeatureClass::Tiling(desc.tiling), features)?;
        desc.usage |= usage;
        self.create_image(&desc)
    }

    fn require(
        &self,
        format: vk::Format,
        class: FeatureClass,
        required: vk::FormatFeatureFlags,
    ) -> Result<()> {
        // SAFETY: the physical device belongs to the device's instance.
        let properties = unsafe {
            self.device
                .instance()
                .raw()
                .get_physical_device_format_properties(self.device.physical_device(), format)
        };
        require_format_features(format, &properties, class, required)
    }

    /// Create the view of an image created without one.
    ///
    /// # Errors
    /// [`GpuError::InvalidUsage`] if the image already has a view.
    pub fn create_image_view(&mut self, id: ResourceId) -> Result<vk::ImageView> {
        let device = self.device.raw();
        let image = match self.arena.get_mut(id)? {
            Owned::Image(image) => image,
            other => return Err(wrong_kind(id, "image", other)),
        };
        if image.view.is_some() {
            return Err(GpuError::InvalidUsage(format!("image {id} already has a view")));
        }

        // SAFETY: the image is live and owned by this factory.
        let view = unsafe { image.create_view(device)? };
        image.view = Some(view);
        Ok(view)
    }

    /// Create the view of a buffer created without one.
    ///
    /// # Errors
    /// [`GpuError::InvalidUsage`] if the buffer already has a view.
    pub fn create_buffer_view(
        &mut self,
        id: ResourceId,
        view: &BufferViewDesc,
    ) -> Result<vk::BufferView> {
        let device = self.device.raw();
        let buffer = match self.arena.get_mut(id)? {
            Owned::Buffer(buffer) => buffer,
            other => return Err(wrong_kind(id, "buffer", other)),
        };
        if buffer.view.is_some() {
            return Err(GpuError::InvalidUsage(format!("buffer {id} already has a view")));
        }

        // SAFETY: the buffer is live and owned by this factory.
        let handle = unsafe { create_buffer_view(device, buffer.handle, view)? };
        buffer.view = Some(handle);
        Ok(handle)
    }

    pub fn create_sampler(&mut self, create_info: &vk::SamplerCreateInfo<'_>) -> Result<ResourceId> {
        // SAFETY: the create info is fully initialized by the caller.
        let sampler = unsafe { self.device.raw().create_sampler(create_info, None)? };
        Ok(self.arena.insert(Owned::Sampler(sampler)))
    }

    /// Create a shader module from SPIR-V words.
    pub fn create_shader_module(&mut self, code: &[u32]) -> Result<ResourceId> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: the code slice outlives the call.
        let module = unsafe { self.device.raw().create_shader_module(&create_info, None)? };
        Ok(self.arena.insert(Owned::ShaderModule(module)))
    }

    /// Create a shader module from SPIR-V bytes, as read from a `.spv` file.
    pub fn create_shader_module_from_bytes(&mut self, bytes: &[u8]) -> Result<ResourceId> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
            .map_err(|e| GpuError::InvalidUsage(format!("invalid SPIR-V: {e}")))?;
        self.create_shader_module(&code)
    }

    pub fn buffer(&self, id: ResourceId) -> Result<&Buffer> {
        match self.arena.get(id)? {
            Owned::Buffer(buffer) => Ok(buffer),
            other => Err(wrong_kind(id, "buffer", other)),
        }
    }

    pub fn image(&self, id: ResourceId) -> Result<&Image> {
        match self.arena.get(id)? {
            Owned::Image(image) => Ok(image),
            other => Err(wrong_kind(id, "image", other)),
        }
    }

    pub fn sampler(&self, id: ResourceId) -> Result<vk::Sampler> {
        match self.arena.get(id)? {
            Owned::Sampler(sampler) => Ok(*sampler),
            other => Err(wrong_kind(id, "sampler", other)),
        }
    }

    pub fn shader_module(&self, id: ResourceId) -> Result<vk::ShaderModule> {
        match self.arena.get(id)? {
            Owned::ShaderModule(module) => Ok(*module),
            other => Err(wrong_kind(id, "shader module", other)),
        }
    }

    /// Destroy a resource immediately, releasing its memory and view.
    ///
    /// The caller guarantees no pending submission references it; use
    /// [`Self::retire`] otherwise.
    ///
    /// # Errors
    /// [`GpuError::AlreadyDestroyed`] on a second destroy of the same id.
    pub fn destroy(&mut self, id: ResourceId) -> Result<()> {
        let owned = self.arena.remove(id)?;
        tracing::debug!("Destroying {} {id}", owned.kind());
        // SAFETY: the caller guarantees the resource is not in use.
        unsafe { owned.destroy(self.device.raw()) };
        Ok(())
    }

    /// Hand a resource over for destruction once `epoch` completes.
    pub fn retire(&mut self, id: ResourceId, epoch: u64) -> Result<()> {
        let owned = self.arena.remove(id)?;
        self.retired.retire((id, owned), epoch);
        Ok(())
    }

    /// Destroy retired resources whose epoch is at or below
    /// `completed_epoch`. Returns how many were destroyed.
    pub fn release_retired(&mut self, completed_epoch: u64) -> usize {
        let released = self.retired.release_completed(completed_epoch);
        let count = released.len();
        for (id, owned) in released {
            tracing::debug!("Releasing retired {} {id}", owned.kind());
            // SAFETY: the caller reported the referencing epoch complete.
            unsafe { owned.destroy(self.device.raw()) };
        }
        count
    }

    /// Copy `data` into host-visible buffer memory at `offset` bytes.
    ///
    /// Non-coherent memory is flushed before returning.
    pub fn write_buffer<T: Pod>(
        &self,
        id: ResourceId,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        let memory = self
            .buffer(id)?
            .host_memory(offset, bytes.len() as vk::DeviceSize)?;
        let device = self.device.raw();
        let start = map_start(offset, self.non_coherent_atom_size);

        // SAFETY: the range was checked against the buffer, which is bound at
        // offset zero, and the memory is host-visible and not mapped elsewhere.
        // The mapping runs to the end of the allocation, past `offset + len`.
        unsafe {
            let ptr = device.map_memory(
                memory.memory(),
                start,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?;
            let dst = ptr.cast::<u8>().add((offset - start) as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            let flushed = if memory.is_host_coherent() {
                Ok(())
            } else {
                device.flush_mapped_memory_ranges(&[mapped_range(memory.memory(), start)])
            };
            device.unmap_memory(memory.memory());
            flushed?;
        }
        Ok(())
    }

    /// Read `count` elements from host-visible buffer memory at `offset`.
    ///
    /// Non-coherent memory is invalidated before it is read.
    pub fn read_buffer<T: Pod>(
        &self,
        id: ResourceId,
        offset: vk::DeviceSize,
        count: usize,
    ) -> Result<Vec<T>> {
        let len = byte_len::<T>(count)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let memory = self.buffer(id)?.host_memory(offset, len as vk::DeviceSize)?;
        let device = self.device.raw();
        let start = map_start(offset, self.non_coherent_atom_size);

        // SAFETY: see `write_buffer`.
        let bytes = unsafe {
            let ptr = device.map_memory(
                memory.memory(),
                start,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?;
            let invalidated = if memory.is_host_coherent() {
                Ok(())
            } else {
                device.invalidate_mapped_memory_ranges(&[mapped_range(memory.memory(), start)])
            };
            let src = ptr.cast::<u8>().add((offset - start) as usize);
            let bytes = std::slice::from_raw_parts(src, len).to_vec();
            device.unmap_memory(memory.memory());
            invalidated?;
            bytes
        };
        Ok(decode_pod(&bytes))
    }

    /// Copy `data` into a device-local buffer through a staging buffer.
    ///
    /// Blocks until the copy completes or the fence timeout expires. The copy
    /// is made visible to every later read on the queue. A timed-out copy
    /// keeps its staging buffer until [`Self::reclaim_uploads`] releases it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload_buffer<T: Pod>(
        &mut self,
        id: ResourceId,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        self.reclaim_uploads()?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;
        let target = self.buffer(id)?;
        if offset.checked_add(size).map_or(true, |end| end > target.size) {
            return Err(GpuError::InvalidUsage(format!(
                "upload of {size} bytes at {offset} exceeds buffer {id}"
            )));
        }
        if size == 0 {
            return Ok(());
        }
        let dst = target.handle;

        let staging = self.create_staging(bytes)?;
        let src = self.buffer(staging)?.handle;

        let result = execute_single_time_commands(
            &self.upload_pool,
            self.device.queue(),
            self.fence_timeout_ns,
            |device: &Device, cmd: &CommandBuffer| {
                let region = vk::BufferCopy::default()
                    .src_offset(0)
                    .dst_offset(offset)
                    .size(size);
                let barriers = build_buffer_barriers(&[BufferTransition::whole(
                    dst,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::MEMORY_READ,
                )]);
                // SAFETY: both buffers are live and the command buffer is recording.
                unsafe {
                    device.raw().cmd_copy_buffer(cmd.handle(), src, dst, &[region]);
                    issue_barriers(
                        device,
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        &barriers,
                        &[],
                    )?;
                }
                Ok(())
            },
        );
        self.finish_staging(staging, result)
    }

    /// Copy tightly packed texel data into mip 0 of every layer of an image
    /// and leave it in `final_layout`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload_image(
        &mut self,
        id: ResourceId,
        data: &[u8],
        final_layout: vk::ImageLayout,
    ) -> Result<()> {
        self.reclaim_uploads()?;
        let image = self.image(id)?;
        let (handle, aspect, extent, layers) =
            (image.handle, image.aspect, image.extent, image.array_layers);
        let required = image_upload_size(image.format, extent, layers)?;
        if (data.len() as vk::DeviceSize) < required {
            return Err(GpuError::InvalidUsage(format!(
                "upload of {} bytes to image {id} needs {required}",
                data.len()
            )));
        }

        let staging = self.create_staging(data)?;
        let src = self.buffer(staging)?.handle;

        let result = execute_single_time_commands(
            &self.upload_pool,
            self.device.queue(),
            self.fence_timeout_ns,
            |device: &Device, cmd: &CommandBuffer| {
                let to_transfer = build_image_barriers(&[ImageTransition::layout(
                    handle,
                    aspect,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )
                .mip_levels(0, 1)]);
                let to_final = build_image_barriers(&[ImageTransition::layout(
                    handle,
                    aspect,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    final_layout,
                )
                .mip_levels(0, 1)]);
                let region = vk::BufferImageCopy::default()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: aspect,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: layers,
                    })
                    .image_extent(extent);

                // SAFETY: both resources are live and the command buffer is recording.
                unsafe {
                    issue_barriers(
                        device,
                        cmd,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                        &[],
                        &to_transfer,
                    )?;
                    device.raw().cmd_copy_buffer_to_image(
                        cmd.handle(),
                        src,
                        handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                    issue_barriers(
                        device,
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        &[],
                        &to_final,
                    )?;
                }
                Ok(())
            },
        );
        self.finish_staging(staging, result)
    }

    fn create_staging(&mut self, bytes: &[u8]) -> Result<ResourceId> {
        let staging = self.create_buffer(&BufferDesc::host_visible(
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        ))?;
        if let Err(e) = self.write_buffer(staging, 0, bytes) {
            self.destroy(staging)?;
            return Err(e);
        }
        Ok(staging)
    }

    /// Destroy a staging buffer once its copy has completed. After a timeout
    /// the copy is still running, so the buffer is parked with its fence
    /// until [`Self::reclaim_uploads`] sees it finish.
    fn finish_staging(
        &mut self,
        staging: ResourceId,
        result: Result<Option<InFlightCommands>>,
    ) -> Result<()> {
        match result {
            Ok(None) => self.destroy(staging),
            Ok(Some(commands)) => {
                tracing::warn!("Upload timed out; parking staging buffer {staging}");
                self.stalled.push(StalledUpload { commands, staging });
                Err(GpuError::SynchronizationTimeout {
                    timeout_ns: self.fence_timeout_ns,
                })
            }
            Err(e) => {
                self.destroy(staging)?;
                Err(e)
            }
        }
    }

    /// Number of uploads that timed out and are still parked.
    pub fn stalled_uploads(&self) -> usize {
        self.stalled.len()
    }

    /// Release the staging buffers of timed-out uploads that have since
    /// completed. Returns how many were released.
    pub fn reclaim_uploads(&mut self) -> Result<usize> {
        let mut released = 0;
        let mut index = 0;
        while index < self.stalled.len() {
            if !self.stalled[index].commands.is_complete()? {
                index += 1;
                continue;
            }
            let upload = self.stalled.swap_remove(index);
            upload.commands.finish(&self.upload_pool)?;
            self.destroy(upload.staging)?;
            released += 1;
        }
        if released > 0 {
            tracing::debug!("Reclaimed {released} completed uploads");
        }
        Ok(released)
    }
}

impl Drop for ResourceFactory {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::warn!("Device wait before resource teardown failed: {e}");
        }

        // Staging buffers of parked uploads are destroyed with the survivors.
        for upload in self.stalled.drain(..) {
            if let Err(e) = upload.commands.finish(&self.upload_pool) {
                tracing::warn!("Parked upload did not finish cleanly: {e}");
            }
        }

        let mut survivors: Vec<(ResourceId, Owned)> = self.retired.drain();
        survivors.extend(self.arena.drain_reverse());
        survivors.sort_by(|(a, _), (b, _)| b.cmp(a));

        tracing::debug!("Destroying {} remaining resources", survivors.len());
        for (_, owned) in survivors {
            // SAFETY: the device is idle.
            unsafe { owned.destroy(self.device.raw()) };
        }
    }
}

unsafe fn create_buffer_view(
    device: &ash::Device,
    buffer: vk::Buffer,
    view: &BufferViewDesc,
) -> Result<vk::BufferView> {
    let create_info = vk::BufferViewCreateInfo::default()
        .buffer(buffer)
        .format(view.format)
        .offset(view.offset)
        .range(view.range);
    Ok(device.create_buffer_view(&create_info, None)?)
}

/// Mapping start for host access at `offset`, rounded down so flushes and
/// invalidations begin on a `nonCoherentAtomSize` boundary.
fn map_start(offset: vk::DeviceSize, atom: vk::DeviceSize) -> vk::DeviceSize {
    if atom <= 1 {
        offset
    } else {
        offset - offset % atom
    }
}

/// Flush or invalidate range from `start` to the end of the allocation.
fn mapped_range(memory: vk::DeviceMemory, start: vk::DeviceSize) -> vk::MappedMemoryRange<'static> {
    vk::MappedMemoryRange::default()
        .memory(memory)
        .offset(start)
        .size(vk::WHOLE_SIZE)
}

/// Byte length of `count` values of `T`.
fn byte_len<T>(count: usize) -> Result<usize> {
    std::mem::size_of::<T>()
        .checked_mul(count)
        .ok_or_else(|| GpuError::InvalidUsage(format!("{count} elements overflow a byte length")))
}

/// Copy raw bytes into values; `bytes` need not be aligned for `T`.
fn decode_pod<T: Pod>(bytes: &[u8]) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    if size == 0 {
        return Vec::new();
    }
    bytes
        .chunks_exact(size)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Bytes per texel of an uncompressed, single-plane color or depth format.
///
/// Packed depth-stencil and block-compressed formats have no single size.
pub fn texel_size(format: vk::Format) -> Option<vk::DeviceSize> {
    use vk::Format as F;
    let size = match format {
        F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::R8_SRGB | F::S8_UINT => 1,
        F::R8G8_UNORM
        | F::R8G8_SNORM
        | F::R8G8_UINT
        | F::R8G8_SINT
        | F::R8G8_SRGB
        | F::R16_UNORM
        | F::R16_SNORM
        | F::R16_UINT
        | F::R16_SINT
        | F::R16_SFLOAT
        | F::R5G6B5_UNORM_PACK16
        | F::B5G6R5_UNORM_PACK16
        | F::D16_UNORM => 2,
        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SNORM
        | F::R8G8B8A8_UINT
        | F::R8G8B8A8_SINT
        | F::R8G8B8A8_SRGB
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB
        | F::A8B8G8R8_UNORM_PACK32
        | F::A2B10G10R10_UNORM_PACK32
        | F::A2R10G10B10_UNORM_PACK32
        | F::B10G11R11_UFLOAT_PACK32
        | F::E5B9G9R9_UFLOAT_PACK32
        | F::R16G16_UNORM
        | F::R16G16_SNORM
        | F::R16G16_UINT
        | F::R16G16_SINT
        | F::R16G16_SFLOAT
        | F::R32_UINT
        | F::R32_SINT
        | F::R32_SFLOAT
        | F::D32_SFLOAT
        | F::X8_D24_UNORM_PACK32 => 4,
        F::R16G16B16A16_UNORM
        | F::R16G16B16A16_SNORM
        | F::R16G16B16A16_UINT
        | F::R16G16B16A16_SINT
        | F::R16G16B16A16_SFLOAT
        | F::R32G32_UINT
        | F::R32G32_SINT
        | F::R32G32_SFLOAT => 8,
        F::R32G32B32_UINT | F::R32G32B32_SINT | F::R32G32B32_SFLOAT => 12,
        F::R32G32B32A32_UINT | F::R32G32B32A32_SINT | F::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// Bytes of tightly packed data covering mip 0 of every layer.
fn image_upload_size(
    format: vk::Format,
    extent: vk::Extent3D,
    layers: u32,
) -> Result<vk::DeviceSize> {
    let texel = texel_size(format).ok_or_else(|| {
        GpuError::InvalidUsage(format!("{format:?} has no tightly packed texel size"))
    })?;
    [extent.width, extent.height, extent.depth, layers]
        .into_iter()
        .try_fold(texel, |total, n| total.checked_mul(vk::DeviceSize::from(n)))
        .ok_or_else(|| GpuError::InvalidUsage(format!("image upload size of {extent:?} overflows")))
}

fn wrong_kind(id: ResourceId, expected: &str, found: &Owned) -> GpuError {
    GpuError::ResourceNotFound(format!("{id} is a {}, not a {expected}", found.kind()))
}
