//! Synchronization primitives.

use crate::driver::Driver;
use crate::error::Result;
use ash::vk;
use vkern_core::KernelObject;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// The two signals gating a frame: image acquired, rendering finished.
#[derive(Debug, Default)]
pub struct SynchronizationSet {
    /// Signaled when the acquired image may be rendered to.
    pub present_complete: vk::Semaphore,
    /// Signaled when the submitted commands finished; presentation waits on it.
    pub render_complete: vk::Semaphore,
}

impl SynchronizationSet {
    /// Create both semaphores.
    ///
    /// On failure nothing is leaked.
    pub fn create<D: Driver>(driver: &D) -> Result<Self> {
        let present_complete = driver.create_semaphore()?;
        let render_complete = match driver.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                driver.destroy_semaphore(present_complete);
                return Err(e);
            }
        };

        Ok(Self {
            present_complete,
            render_complete,
        })
    }

    /// Destroy whatever semaphores are still alive.
    pub fn destroy<D: Driver>(&mut self, driver: &D) {
        if self.present_complete != vk::Semaphore::null() {
            driver.destroy_semaphore(self.present_complete);
            self.present_complete = vk::Semaphore::null();
        }
        if self.render_complete != vk::Semaphore::null() {
            driver.destroy_semaphore(self.render_complete);
            self.render_complete = vk::Semaphore::null();
        }
    }

    /// Submission wiring for this set.
    pub fn submit_template(&self) -> SubmitTemplate {
        SubmitTemplate {
            wait_semaphores: [self.present_complete],
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            signal_semaphores: [self.render_complete],
        }
    }
}

impl KernelObject for SynchronizationSet {
    fn is_ready(&self) -> bool {
        self.present_complete != vk::Semaphore::null()
            && self.render_complete != vk::Semaphore::null()
    }
}

/// Reusable submit description.
///
/// Every frame submission waits on `present_complete` at colour attachment
/// output and signals `render_complete`. Only the command buffer changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitTemplate {
    pub wait_semaphores: [vk::Semaphore; 1],
    pub wait_stages: [vk::PipelineStageFlags; 1],
    pub signal_semaphores: [vk::Semaphore; 1],
}

impl SubmitTemplate {
    /// Build the `vk::SubmitInfo` for one command buffer.
    pub fn info<'a>(&'a self, command_buffers: &'a [vk::CommandBuffer]) -> vk::SubmitInfo<'a> {
        vk::SubmitInfo::default()
            .wait_semaphores(&self.wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&self.signal_semaphores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn default_set_is_not_ready() {
        assert!(!SynchronizationSet::default().is_ready());
    }

    #[test]
    fn template_pins_semaphores() {
        let set = SynchronizationSet {
            present_complete: vk::Semaphore::from_raw(7),
            render_complete: vk::Semaphore::from_raw(9),
        };
        assert!(set.is_ready());

        let template = set.submit_template();
        let buffers = [vk::CommandBuffer::from_raw(3)];
        let info = template.info(&buffers);

        assert_eq!(info.wait_semaphore_count, 1);
        assert_eq!(info.signal_semaphore_count, 1);
        assert_eq!(info.command_buffer_count, 1);
        assert_eq!(template.wait_semaphores[0].as_raw(), 7);
        assert_eq!(template.signal_semaphores[0].as_raw(), 9);
        assert_eq!(
            template.wait_stages[0],
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
    }
}
