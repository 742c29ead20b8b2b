//! Surfaces for native windows.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::context::VulkanDriver;
use crate::driver::SurfaceFactory;
use crate::error::{GpuError, Result};

/// Surface factory for any window exposing raw handles.
///
/// Pass to `VulkanKernel::init`:
///
/// ```ignore
/// kernel.init(WindowSurface::new(&window), InitInfo::default())?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct WindowSurface<'w, W> {
    window: &'w W,
}

impl<'w, W> WindowSurface<'w, W>
where
    W: HasDisplayHandle + HasWindowHandle,
{
    pub const fn new(window: &'w W) -> Self {
        Self { window }
    }
}

impl<W> SurfaceFactory<VulkanDriver> for WindowSurface<'_, W>
where
    W: HasDisplayHandle + HasWindowHandle,
{
    fn create_surface(self, driver: &VulkanDriver, instance: vk::Instance) -> Result<vk::SurfaceKHR> {
        if driver.instance().map(ash::Instance::handle) != Some(instance) {
            return Err(GpuError::SurfaceCreation(
                "instance does not belong to this driver".to_string(),
            ));
        }

        let display = self
            .window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window = self
            .window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        driver.create_window_surface(display.as_raw(), window.as_raw())
    }
}
