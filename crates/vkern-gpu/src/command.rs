//! Command pool and command buffer helpers.

use crate::error::Result;
use ash::vk;

/// Create a command pool whose buffers can be reset one by one.
///
/// # Safety
/// The device must be valid and the queue family must exist.
pub unsafe fn create_command_pool(device: &ash::Device, queue_family: u32) -> Result<vk::CommandPool> {
    let create_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    let pool = unsafe { device.create_command_pool(&create_info, None)? };
    Ok(pool)
}

/// Allocate `count` primary command buffers.
///
/// # Safety
/// The device and pool must be valid.
pub unsafe fn allocate_primary(
    device: &ash::Device,
    pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);

    let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
    Ok(buffers)
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}
