//! Buffer and image barrier construction and issuance.
//!
//! Building barriers is pure; [`issue_barriers`] records them into a
//! command buffer as one `vkCmdPipelineBarrier`. A barrier orders commands
//! within its own command buffer only. Ordering across command buffers or
//! submissions needs semaphores.

use crate::command::{CommandBuffer, CommandBufferState};
use crate::dispatch::CommandDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Access transition for a range of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTransition {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferTransition {
    /// Transition the whole buffer without a queue family ownership change.
    pub fn whole(buffer: vk::Buffer, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        Self {
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_access,
            dst_access,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// Transfer ownership between queue families.
    pub fn with_queue_families(mut self, src: u32, dst: u32) -> Self {
        self.src_queue_family = src;
        self.dst_queue_family = dst;
        self
    }
}

/// Access and layout transition for a subresource range of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ImageTransition {
    /// Layout transition over every mip level and array layer, with access
    /// masks derived from the layouts.
    pub fn layout(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            src_access: access_for_layout(old_layout),
            dst_access: access_for_layout(new_layout),
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    /// Restrict the transition to a mip range.
    pub fn mip_levels(mut self, base: u32, count: u32) -> Self {
        self.base_mip_level = base;
        self.level_count = count;
        self
    }

    /// Restrict the transition to an array layer range.
    pub fn array_layers(mut self, base: u32, count: u32) -> Self {
        self.base_array_layer = base;
        self.layer_count = count;
        self
    }

    /// Override the access masks derived from the layouts.
    pub fn access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    /// Transfer ownership between queue families.
    pub fn with_queue_families(mut self, src: u32, dst: u32) -> Self {
        self.src_queue_family = src;
        self.dst_queue_family = dst;
        self
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.base_mip_level,
            level_count: self.level_count,
            base_array_layer: self.base_array_layer,
            layer_count: self.layer_count,
        }
    }
}

/// The accesses an image in `layout` is typically used for.
pub fn access_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::MEMORY_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// Convert buffer transitions into barriers, preserving order.
pub fn build_buffer_barriers(
    transitions: &[BufferTransition],
) -> Vec<vk::BufferMemoryBarrier<'static>> {
    transitions
        .iter()
        .map(|t| {
            vk::BufferMemoryBarrier::default()
                .buffer(t.buffer)
                .offset(t.offset)
                .size(t.size)
                .src_access_mask(t.src_access)
                .dst_access_mask(t.dst_access)
                .src_queue_family_index(t.src_queue_family)
                .dst_queue_family_index(t.dst_queue_family)
        })
        .collect()
}

/// Convert image transitions into barriers, preserving order.
pub fn build_image_barriers(transitions: &[ImageTransition]) -> Vec<vk::ImageMemoryBarrier<'static>> {
    transitions
        .iter()
        .map(|t| {
            vk::ImageMemoryBarrier::default()
                .image(t.image)
                .old_layout(t.old_layout)
                .new_layout(t.new_layout)
                .src_access_mask(t.src_access)
                .dst_access_mask(t.dst_access)
                .src_queue_family_index(t.src_queue_family)
                .dst_queue_family_index(t.dst_queue_family)
                .subresource_range(t.subresource_range())
        })
        .collect()
}

/// Record one combined pipeline barrier into a recording command buffer.
///
/// Returns `false` without recording anything when both lists are empty.
///
/// # Errors
/// [`GpuError::InvalidUsage`] unless the command buffer is recording.
///
/// # Safety
/// The command buffer must belong to `device` and every handle in the
/// barriers must be valid.
pub unsafe fn issue_barriers<D: CommandDevice + ?Sized>(
    device: &D,
    command_buffer: &CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
    image_barriers: &[vk::ImageMemoryBarrier<'_>],
) -> Result<bool> {
    if command_buffer.state() != CommandBufferState::Recording {
        return Err(GpuError::InvalidUsage(format!(
            "barriers require a recording command buffer, found {:?}",
            command_buffer.state()
        )));
    }
    if buffer_barriers.is_empty() && image_barriers.is_empty() {
        return Ok(false);
    }

    device.cmd_pipeline_barrier(
        command_buffer.handle(),
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        buffer_barriers,
        image_barriers,
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::mock::{MockCall, MockDevice};
    use ash::vk::Handle;
    use std::sync::Arc;

    fn recording_buffer(device: &Arc<MockDevice>, pool: &CommandPool<MockDevice>) -> CommandBuffer {
        let mut cmd = pool.allocate(1).unwrap().remove(0);
        unsafe {
            cmd.begin(&**device, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .unwrap();
        }
        cmd
    }

    #[test]
    fn buffer_barriers_preserve_order_and_fields() {
        let transitions = [
            BufferTransition::whole(
                vk::Buffer::from_raw(1),
                vk::AccessFlags::HOST_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
            BufferTransition::whole(
                vk::Buffer::from_raw(2),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            )
            .with_queue_families(0, 1),
        ];

        let barriers = build_buffer_barriers(&transitions);
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].buffer, vk::Buffer::from_raw(1));
        assert_eq!(barriers[0].size, vk::WHOLE_SIZE);
        assert_eq!(barriers[0].src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barriers[1].buffer, vk::Buffer::from_raw(2));
        assert_eq!(barriers[1].dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(barriers[1].src_queue_family_index, 0);
        assert_eq!(barriers[1].dst_queue_family_index, 1);
    }

    #[test]
    fn image_barriers_carry_layouts_and_ranges() {
        let transition = ImageTransition::layout(
            vk::Image::from_raw(7),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .mip_levels(2, 3)
        .array_layers(1, 1);

        let barriers = build_image_barriers(&[transition]);
        let barrier = &barriers[0];
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.subresource_range.base_mip_level, 2);
        assert_eq!(barrier.subresource_range.level_count, 3);
        assert_eq!(barrier.subresource_range.base_array_layer, 1);
        assert_eq!(barrier.subresource_range.layer_count, 1);
    }

    #[test]
    fn empty_input_records_no_barrier() {
        let device = Arc::new(MockDevice::default());
        let pool = CommandPool::new(device.clone(), 0, false).unwrap();
        let cmd = recording_buffer(&device, &pool);

        let issued = unsafe {
            issue_barriers(
                &*device,
                &cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                &[],
                &[],
            )
        }
        .unwrap();

        assert!(!issued);
        assert_eq!(device.barrier_count(), 0);
    }

    #[test]
    fn buffer_and_image_barriers_share_one_command() {
        let device = Arc::new(MockDevice::default());
        let pool = CommandPool::new(device.clone(), 0, false).unwrap();
        let cmd = recording_buffer(&device, &pool);

        let buffers = build_buffer_barriers(&[BufferTransition::whole(
            vk::Buffer::from_raw(3),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::UNIFORM_READ,
        )]);
        let images = build_image_barriers(&[
            ImageTransition::layout(
                vk::Image::from_raw(4),
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            ImageTransition::layout(
                vk::Image::from_raw(5),
                vk::ImageAspectFlags::DEPTH,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
        ]);

        let issued = unsafe {
            issue_barriers(
                &*device,
                &cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                &buffers,
                &images,
            )
        }
        .unwrap();

        assert!(issued);
        assert_eq!(device.barrier_count(), 1);
        assert!(device.calls().contains(&MockCall::Barrier {
            buffers: 1,
            images: 2
        }));
    }

    #[test]
    fn barriers_require_recording_state() {
        let device = Arc::new(MockDevice::default());
        let pool = CommandPool::new(device.clone(), 0, false).unwrap();
        let cmd = pool.allocate(1).unwrap().remove(0);

        let result = unsafe {
            issue_barriers(
                &*device,
                &cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                &[],
                &[],
            )
        };
        assert!(matches!(result, Err(GpuError::InvalidUsage(_))));
    }

    #[test]
    fn layout_access_masks() {
        assert_eq!(
            access_for_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::AccessFlags::SHADER_READ
        );
        assert_eq!(
            access_for_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AccessFlags::MEMORY_READ
        );
        assert!(access_for_layout(vk::ImageLayout::UNDEFINED).is_empty());
    }
}
