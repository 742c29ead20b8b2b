//! Per-frame acquire, submit and present.

use std::fmt;

use ash::prelude::VkResult;
use ash::vk;

use crate::driver::Driver;
use crate::error::GpuError;
use crate::kernel::VulkanKernel;

/// Outcome of one frame step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameResult {
    Success,
    /// The swapchain no longer matches the surface; resize and carry on.
    OutOfDate,
    Error,
    /// The GPU context is gone. Nothing else will succeed.
    DeviceLost,
}

impl FrameResult {
    /// `Error` or `DeviceLost`.
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::DeviceLost)
    }
}

impl fmt::Display for FrameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "Success",
            Self::OutOfDate => "OutOfDate",
            Self::Error => "Error",
            Self::DeviceLost => "DeviceLost",
        })
    }
}

/// Image index to render into, or why there is none.
///
/// A suboptimal acquire counts as out of date; the index is only accepted
/// when it is below `image_count`.
pub fn map_acquire(result: VkResult<(u32, bool)>, image_count: usize) -> Result<u32, FrameResult> {
    match result {
        Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(FrameResult::OutOfDate),
        Ok((index, false)) if (index as usize) < image_count => Ok(index),
        Ok(_) | Err(_) => Err(FrameResult::Error),
    }
}

/// A suboptimal present still counts as presented.
pub fn map_present(result: VkResult<bool>) -> FrameResult {
    match result {
        Ok(_) => FrameResult::Success,
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => FrameResult::OutOfDate,
        Err(_) => FrameResult::Error,
    }
}

/// Queue submission, fence and idle waits: device loss is reported on its own.
pub fn map_wait(result: VkResult<()>) -> FrameResult {
    match result {
        Ok(()) => FrameResult::Success,
        Err(vk::Result::ERROR_DEVICE_LOST) => FrameResult::DeviceLost,
        Err(_) => FrameResult::Error,
    }
}

impl<D: Driver> VulkanKernel<D> {
    /// Render one frame unless the window is collapsed.
    pub fn next_frame(&mut self) -> FrameResult {
        if self.is_paused() {
            return FrameResult::Success;
        }
        self.render()
    }

    /// Acquire the next swapchain image into the current buffer index.
    pub fn prepare_frame(&mut self) -> FrameResult {
        if self.swapchain.is_none() {
            self.log
                .error("VulkanKernel::prepare_frame: swapchain is not created!");
            return FrameResult::Error;
        }

        if self.unconsumed_acquire {
            self.log.graph(
                "VulkanKernel::prepare_frame: last acquired image was not submitted, renew synchronizations...",
            );
            let renewed = self
                .driver
                .device_wait_idle()
                .map_err(GpuError::from)
                .and_then(|()| self.renew_synchronization());
            if let Err(e) = renewed {
                self.log.error(&format!(
                    "VulkanKernel::prepare_frame: failed to renew synchronizations! Reason: {e}"
                ));
                return match e.root() {
                    GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST) => FrameResult::DeviceLost,
                    _ => FrameResult::Error,
                };
            }
        }

        let Some(swapchain) = self.swapchain.as_ref() else {
            return FrameResult::Error;
        };
        let result = self
            .driver
            .acquire_next_image(swapchain.handle, self.sync.present_complete);
        // Any successful acquire signals present_complete, suboptimal or not
        self.unconsumed_acquire = result.is_ok();
        let detail = match &result {
            Err(e) => e.to_string(),
            Ok((index, _)) => format!("image index {index} of {}", swapchain.image_count()),
        };

        match map_acquire(result, swapchain.image_count()) {
            Ok(index) => {
                self.current_buffer = index;
                FrameResult::Success
            }
            Err(FrameResult::OutOfDate) => {
                self.log
                    .log("VulkanKernel::prepare_frame: window has been resized!");
                FrameResult::OutOfDate
            }
            Err(other) => {
                self.log.error(&format!(
                    "VulkanKernel::prepare_frame: failed to acquire next image! Reason: {detail}"
                ));
                other
            }
        }
    }

    /// Present the current buffer, then wait for the graphics queue to go idle.
    pub fn submit_frame(&mut self) -> FrameResult {
        let (Some(swapchain), Some(device)) = (self.swapchain.as_ref(), self.device.as_ref())
        else {
            self.log
                .error("VulkanKernel::submit_frame: kernel is not initialized!");
            return FrameResult::Error;
        };
        let queue = device.graphics_queue();

        let result = self.driver.queue_present(
            queue,
            swapchain.handle,
            self.current_buffer,
            self.sync.render_complete,
        );
        match map_present(result) {
            FrameResult::Success => {}
            FrameResult::OutOfDate => {
                self.log
                    .log("VulkanKernel::submit_frame: window has been resized!");
                return FrameResult::OutOfDate;
            }
            other => {
                self.log.error(&format!(
                    "VulkanKernel::submit_frame: failed to queue present! Reason: {result:?}"
                ));
                return other;
            }
        }

        let result = self.driver.queue_wait_idle(queue);
        let outcome = map_wait(result);
        if outcome.is_error() {
            self.log.error(&format!(
                "VulkanKernel::submit_frame: failed to queue wait idle! Reason: {result:?}"
            ));
        }
        outcome
    }

    /// Default render step: acquire, wait for the image's fence, submit its
    /// draw command buffer, present.
    ///
    /// `Error` and `DeviceLost` raise the error flag. A kernel that failed a
    /// stage renders nothing.
    pub fn render(&mut self) -> FrameResult {
        if !self.is_post_initialized() || self.failed_stage().is_some() {
            self.log.error("VulkanKernel::render: kernel is not complete!");
            return self.track(FrameResult::Error);
        }

        let prepared = self.prepare_frame();
        if prepared != FrameResult::Success {
            return self.track(prepared);
        }

        let submitted = self.submit_current();
        if submitted != FrameResult::Success {
            return self.track(submitted);
        }

        let presented = self.submit_frame();
        self.track(presented)
    }

    fn submit_current(&mut self) -> FrameResult {
        let index = self.current_buffer as usize;
        let (Some(&fence), Some(&command_buffer), Some(template), Some(device)) = (
            self.wait_fences.get(index),
            self.draw_command_buffers.get(index),
            self.submit.as_ref(),
            self.device.as_ref(),
        ) else {
            self.log.error(&format!(
                "VulkanKernel::render: no frame resources for buffer {index}!"
            ));
            return FrameResult::Error;
        };

        let waited = map_wait(
            self.driver
                .wait_for_fence(fence, u64::MAX)
                .and_then(|()| self.driver.reset_fence(fence)),
        );
        if waited != FrameResult::Success {
            self.log
                .error("VulkanKernel::render: failed to wait for frame fence!");
            return waited;
        }

        let result = self
            .driver
            .queue_submit(device.graphics_queue(), template, command_buffer, fence);
        let submitted = map_wait(result);
        if submitted == FrameResult::Success {
            self.unconsumed_acquire = false;
        } else {
            self.log.error(&format!(
                "VulkanKernel::render: failed to submit draw command buffer! Reason: {result:?}"
            ));
        }
        submitted
    }

    fn track(&mut self, result: FrameResult) -> FrameResult {
        if result.is_error() {
            self.has_errors = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suboptimal_acquire_is_out_of_date() {
        assert_eq!(map_acquire(Ok((1, true)), 3), Err(FrameResult::OutOfDate));
        assert_eq!(
            map_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), 3),
            Err(FrameResult::OutOfDate)
        );
    }

    #[test]
    fn acquire_index_must_fit_image_count() {
        assert_eq!(map_acquire(Ok((2, false)), 3), Ok(2));
        assert_eq!(map_acquire(Ok((3, false)), 3), Err(FrameResult::Error));
    }

    #[test]
    fn other_acquire_failures_are_errors() {
        assert_eq!(
            map_acquire(Err(vk::Result::ERROR_SURFACE_LOST_KHR), 3),
            Err(FrameResult::Error)
        );
    }

    #[test]
    fn suboptimal_present_succeeds() {
        assert_eq!(map_present(Ok(true)), FrameResult::Success);
        assert_eq!(
            map_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            FrameResult::OutOfDate
        );
        assert_eq!(
            map_present(Err(vk::Result::ERROR_DEVICE_LOST)),
            FrameResult::Error
        );
    }

    #[test]
    fn device_loss_is_distinguished_on_wait() {
        assert_eq!(map_wait(Ok(())), FrameResult::Success);
        assert_eq!(
            map_wait(Err(vk::Result::ERROR_DEVICE_LOST)),
            FrameResult::DeviceLost
        );
        assert_eq!(
            map_wait(Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)),
            FrameResult::Error
        );
        assert!(FrameResult::DeviceLost.is_error());
        assert!(!FrameResult::OutOfDate.is_error());
    }
}
