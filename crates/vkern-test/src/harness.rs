//! Kernel fixtures over [`MockDriver`].

use std::sync::Arc;

use ash::vk;
use vkern_core::CaptureSink;
use vkern_gpu::{InitInfo, KernelBuilder, KernelHooks, NoHooks, PreInitInfo, VulkanKernel};

use crate::mock::MockDriver;
use crate::Result;

/// Surface factory for [`MockDriver`].
pub fn mock_surface(
    driver: &MockDriver,
    _instance: vk::Instance,
) -> vkern_gpu::Result<vk::SurfaceKHR> {
    driver.create_surface()
}

/// Hooks that count their calls.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub completed: usize,
    pub resized: usize,
    pub built: usize,
    /// Frame buffer count seen by the last `on_resize`.
    pub frame_buffers_on_resize: usize,
    pub fail_on_complete: bool,
}

impl KernelHooks<MockDriver> for RecordingHooks {
    fn on_complete(&mut self, _kernel: &mut VulkanKernel<MockDriver>) -> vkern_gpu::Result<()> {
        self.completed += 1;
        if self.fail_on_complete {
            return Err(vkern_gpu::GpuError::InvalidState(
                "on_complete refused".to_string(),
            ));
        }
        Ok(())
    }

    fn on_resize(&mut self, kernel: &mut VulkanKernel<MockDriver>) -> vkern_gpu::Result<()> {
        self.resized += 1;
        self.frame_buffers_on_resize = kernel.frame_buffers().len();
        Ok(())
    }

    fn build_command_buffers(
        &mut self,
        _kernel: &mut VulkanKernel<MockDriver>,
    ) -> vkern_gpu::Result<()> {
        self.built += 1;
        Ok(())
    }
}

/// A kernel on a mock driver, with captured log output.
pub struct KernelFixture {
    pub kernel: VulkanKernel<MockDriver>,
    /// Shares state with the kernel's driver.
    pub driver: MockDriver,
    pub log: Arc<CaptureSink>,
}

impl KernelFixture {
    /// Uninitialized kernel, validation off.
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Uninitialized kernel, validation off, further configured by `configure`.
    pub fn with(configure: impl FnOnce(KernelBuilder) -> KernelBuilder) -> Self {
        let driver = MockDriver::new();
        let log = CaptureSink::shared();
        let builder = KernelBuilder::new()
            .validation(false)
            .log_sink(log.clone());
        let kernel = configure(builder).build(driver.clone());
        Self {
            kernel,
            driver,
            log,
        }
    }

    pub fn pre_init(&mut self) -> Result<()> {
        self.kernel
            .pre_init(PreInitInfo::new("vkern-test", "vkern").shader_compiler("glslc"))?;
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        self.kernel.init(mock_surface, InitInfo::default())?;
        Ok(())
    }

    pub fn post_init<H: KernelHooks<MockDriver>>(&mut self, hooks: &mut H) -> Result<()> {
        self.kernel.post_init(hooks)?;
        Ok(())
    }

    /// Run all three stages with no hooks.
    pub fn bring_up(mut self) -> Result<Self> {
        self.pre_init()?;
        self.init()?;
        self.post_init(&mut NoHooks)?;
        Ok(self)
    }
}

impl Default for KernelFixture {
    fn default() -> Self {
        Self::new()
    }
}
