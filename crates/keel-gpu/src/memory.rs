//! GPU memory type matching, allocation and binding.
//!
//! Allocations are dedicated: one `vkAllocateMemory` per resource. Each
//! [`MemoryAllocation`] is owned by exactly one buffer or image and is freed
//! by the [`crate::resource::ResourceFactory`] when that resource is
//! destroyed.

use crate::error::{GpuError, Result};
use ash::vk;

/// Find the lowest memory type index allowed by `type_bits` whose property
/// flags contain `required`.
///
/// The search is a pure scan over `memory_types`, so identical inputs always
/// yield the same index.
pub fn find_memory_type(
    memory_types: &[vk::MemoryType],
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory_types
        .iter()
        .enumerate()
        .take(32)
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
        .ok_or(GpuError::NoCompatibleMemoryType {
            type_bits,
            required,
        })
}

/// A block of device memory backing one resource.
#[derive(Debug)]
pub struct MemoryAllocation {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    type_index: u32,
    properties: vk::MemoryPropertyFlags,
}

impl MemoryAllocation {
    /// Allocate `size` bytes from memory type `type_index`.
    ///
    /// # Errors
    /// [`GpuError::AllocationFailed`] on an out-of-range type index or a
    /// driver-side allocation failure.
    ///
    /// # Safety
    /// `memory_types` must be the heap layout of the device `device` was
    /// created on.
    pub unsafe fn allocate(
        device: &ash::Device,
        memory_types: &[vk::MemoryType],
        type_index: u32,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let memory_type = memory_types.get(type_index as usize).ok_or_else(|| {
            GpuError::AllocationFailed(format!(
                "memory type {type_index} out of range ({} types)",
                memory_types.len()
            ))
        })?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);

        let memory = device
            .allocate_memory(&allocate_info, None)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        #[cfg(feature = "log-memory-allocations")]
        tracing::trace!(?memory, size, type_index, "Allocated device memory");

        Ok(Self {
            memory,
            size,
            type_index,
            properties: memory_type.property_flags,
        })
    }

    /// Release the memory.
    ///
    /// # Safety
    /// No resource bound to this memory may still be in use, and the memory
    /// must not be mapped.
    pub unsafe fn free(self, device: &ash::Device) {
        #[cfg(feature = "log-memory-allocations")]
        tracing::trace!(memory = ?self.memory, "Freeing device memory");

        device.free_memory(self.memory, None);
    }

    /// Get the raw memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Memory type index the allocation came from.
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Property flags of the memory type.
    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    #[cfg(test)]
    pub(crate) fn for_tests(size: vk::DeviceSize, properties: vk::MemoryPropertyFlags) -> Self {
        Self {
            memory: vk::DeviceMemory::null(),
            size,
            type_index: 0,
            properties,
        }
    }

    /// Whether the CPU can map this memory.
    pub fn is_host_visible(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Whether host writes are visible without an explicit flush.
    pub fn is_host_coherent(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// A resource that can have memory bound to it exactly once.
pub trait BindMemory {
    /// The memory currently bound, if any.
    fn bound_memory(&self) -> Option<&MemoryAllocation>;

    /// Issue the driver bind call.
    ///
    /// # Safety
    /// The memory must satisfy the resource's requirements at `offset`.
    unsafe fn bind_raw(
        &self,
        device: &ash::Device,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> ash::prelude::VkResult<()>;

    /// Record the allocation as bound.
    fn attach(&mut self, allocation: MemoryAllocation);
}

/// Fail with [`GpuError::AlreadyBound`] if the resource already has memory.
pub fn ensure_unbound<R: BindMemory + ?Sized>(resource: &R) -> Result<()> {
    if resource.bound_memory().is_some() {
        return Err(GpuError::AlreadyBound);
    }
    Ok(())
}

/// Attach `allocation` to `resource` once `bind_raw` accepts it.
///
/// On failure the allocation is handed back with the error so the caller can
/// free it. Driver rejections keep their `vk::Result`.
fn try_attach<R, F>(
    resource: &mut R,
    allocation: MemoryAllocation,
    bind_raw: F,
) -> std::result::Result<(), (MemoryAllocation, GpuError)>
where
    R: BindMemory + ?Sized,
    F: FnOnce(&R, vk::DeviceMemory) -> ash::prelude::VkResult<()>,
{
    if let Err(e) = ensure_unbound(resource) {
        return Err((allocation, e));
    }
    if let Err(e) = bind_raw(resource, allocation.memory()) {
        return Err((allocation, GpuError::Vulkan(e)));
    }
    resource.attach(allocation);
    Ok(())
}

/// Bind `allocation` to `resource` at `offset`, transferring ownership of the
/// allocation to the resource.
///
/// If the resource is already bound, or the driver rejects the bind, the
/// rejected allocation is freed before the error is returned.
///
/// # Safety
/// The allocation must come from `device` and satisfy the resource's memory
/// requirements.
pub unsafe fn bind<R: BindMemory + ?Sized>(
    device: &ash::Device,
    resource: &mut R,
    allocation: MemoryAllocation,
    offset: vk::DeviceSize,
) -> Result<()> {
    try_attach(resource, allocation, |resource, memory| {
        resource.bind_raw(device, memory, offset)
    })
    .map_err(|(rejected, e)| {
        rejected.free(device);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    fn memory_type(property_flags: vk::MemoryPropertyFlags) -> vk::MemoryType {
        vk::MemoryType {
            property_flags,
            heap_index: 0,
        }
    }

    #[test]
    fn host_visible_coherent_picks_second_heap() {
        let types = [
            memory_type(DEVICE_LOCAL),
            memory_type(HOST_VISIBLE | HOST_COHERENT),
        ];

        let index = find_memory_type(&types, 0b11, HOST_VISIBLE | HOST_COHERENT).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn returns_lowest_compatible_index() {
        let types = [
            memory_type(HOST_VISIBLE),
            memory_type(DEVICE_LOCAL | HOST_VISIBLE),
            memory_type(DEVICE_LOCAL),
            memory_type(DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT),
        ];

        assert_eq!(find_memory_type(&types, 0b1111, DEVICE_LOCAL).unwrap(), 1);
        // Bit 1 masked out by the requirements.
        assert_eq!(find_memory_type(&types, 0b1101, DEVICE_LOCAL).unwrap(), 2);
        assert_eq!(
            find_memory_type(&types, 0b1111, vk::MemoryPropertyFlags::empty()).unwrap(),
            0
        );
    }

    #[test]
    fn result_is_stable_for_identical_inputs() {
        let types = [
            memory_type(DEVICE_LOCAL),
            memory_type(DEVICE_LOCAL | HOST_VISIBLE),
            memory_type(HOST_VISIBLE | HOST_COHERENT),
        ];

        let first = find_memory_type(&types, 0b110, HOST_VISIBLE);
        for _ in 0..16 {
            assert_eq!(find_memory_type(&types, 0b110, HOST_VISIBLE), first);
        }
    }

    #[test]
    fn incompatible_requirements_fail() {
        let types = [memory_type(DEVICE_LOCAL), memory_type(HOST_VISIBLE)];

        // Right flags, wrong bit.
        let err = find_memory_type(&types, 0b01, HOST_VISIBLE).unwrap_err();
        assert_eq!(
            err,
            GpuError::NoCompatibleMemoryType {
                type_bits: 0b01,
                required: HOST_VISIBLE,
            }
        );

        // Bits beyond the exposed types never match.
        assert!(find_memory_type(&types, 0b100, vk::MemoryPropertyFlags::empty()).is_err());
        assert!(find_memory_type(&[], u32::MAX, vk::MemoryPropertyFlags::empty()).is_err());
    }

    struct FakeResource {
        memory: Option<MemoryAllocation>,
    }

    impl BindMemory for FakeResource {
        fn bound_memory(&self) -> Option<&MemoryAllocation> {
            self.memory.as_ref()
        }

        unsafe fn bind_raw(
            &self,
            _device: &ash::Device,
            _memory: vk::DeviceMemory,
            _offset: vk::DeviceSize,
        ) -> ash::prelude::VkResult<()> {
            Ok(())
        }

        fn attach(&mut self, allocation: MemoryAllocation) {
            self.memory = Some(allocation);
        }
    }

    #[test]
    fn bound_resource_rejects_second_binding() {
        let mut resource = FakeResource { memory: None };
        assert!(ensure_unbound(&resource).is_ok());

        resource.attach(MemoryAllocation::for_tests(256, HOST_VISIBLE));

        assert_eq!(ensure_unbound(&resource).unwrap_err(), GpuError::AlreadyBound);

        let (rejected, err) = try_attach(
            &mut resource,
            MemoryAllocation::for_tests(128, HOST_VISIBLE),
            |_, _| Ok(()),
        )
        .unwrap_err();
        assert_eq!(err, GpuError::AlreadyBound);
        assert_eq!(rejected.size(), 128);
        assert_eq!(resource.bound_memory().unwrap().size(), 256);
    }

    #[test]
    fn driver_bind_rejection_keeps_vulkan_result() {
        let mut resource = FakeResource { memory: None };

        let (rejected, err) = try_attach(
            &mut resource,
            MemoryAllocation::for_tests(64, DEVICE_LOCAL),
            |_, _| Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
        )
        .unwrap_err();

        assert_eq!(err, GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(rejected.size(), 64);
        assert!(resource.bound_memory().is_none());
    }

    #[test]
    fn accepted_bind_attaches_allocation() {
        let mut resource = FakeResource { memory: None };

        try_attach(
            &mut resource,
            MemoryAllocation::for_tests(64, DEVICE_LOCAL),
            |_, _| Ok(()),
        )
        .unwrap();

        assert_eq!(resource.bound_memory().unwrap().size(), 64);
    }
}
