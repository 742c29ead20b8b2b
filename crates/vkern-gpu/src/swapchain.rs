//! Swapchain management.

use crate::device::FamilyQueues;
use crate::driver::{Driver, SwapchainDesc};
use crate::error::{GpuError, Result};
use ash::vk;
use vkern_core::KernelObject;

/// Depth/stencil formats in order of preference.
pub const DEPTH_FORMAT_PREFERENCE: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
];

/// Swapchain wrapper.
///
/// Re-created in place on resize; the surface, depth format and vsync
/// setting stay fixed for its lifetime.
#[derive(Debug)]
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub surface: vk::SurfaceKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub extent: vk::Extent2D,
    pub vsync: bool,
}

impl Swapchain {
    /// An empty swapchain bound to `surface`; call [`Swapchain::setup`] to create images.
    pub fn new(surface: vk::SurfaceKHR, depth_format: vk::Format, vsync: bool) -> Self {
        Self {
            handle: vk::SwapchainKHR::null(),
            surface,
            images: Vec::new(),
            views: Vec::new(),
            color_format: vk::Format::UNDEFINED,
            depth_format,
            extent: vk::Extent2D::default(),
            vsync,
        }
    }

    /// Create or re-create the swapchain at the requested size.
    ///
    /// The previous swapchain is handed to the driver as `old_swapchain`
    /// and destroyed, with its views, once the new one exists. On failure
    /// the previous swapchain is kept.
    pub fn setup<D: Driver>(
        &mut self,
        driver: &mut D,
        queues: &FamilyQueues,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let support = driver.surface_support(self.surface)?;

        let format = select_surface_format(&support.formats).ok_or_else(|| {
            GpuError::SwapchainCreation("surface reports no formats".to_string())
        })?;
        let present_mode = select_present_mode(&support.present_modes, self.vsync);
        let extent = calculate_extent(&support.capabilities, width, height);

        let desc = SwapchainDesc {
            surface: self.surface,
            min_image_count: image_count(&support.capabilities),
            format,
            extent,
            present_mode,
            pre_transform: pre_transform(&support.capabilities),
            queue_families: queues.unique_families(),
            old_swapchain: self.handle,
        };

        let handle = driver.create_swapchain(&desc)?;
        let images = match driver.swapchain_images(handle) {
            Ok(images) => images,
            Err(e) => {
                driver.destroy_swapchain(handle);
                return Err(e);
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match driver.create_image_view(image, format.format, vk::ImageAspectFlags::COLOR) {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        driver.destroy_image_view(view);
                    }
                    driver.destroy_swapchain(handle);
                    return Err(e);
                }
            }
        }

        self.destroy(driver);

        self.handle = handle;
        self.images = images;
        self.views = views;
        self.color_format = format.format;
        self.extent = extent;

        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroy image views and the swapchain. The surface is not touched.
    pub fn destroy<D: Driver>(&mut self, driver: &D) {
        for view in self.views.drain(..) {
            driver.destroy_image_view(view);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            driver.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

impl KernelObject for Swapchain {
    fn is_ready(&self) -> bool {
        self.handle != vk::SwapchainKHR::null()
    }

    fn is_complete(&self) -> bool {
        self.is_ready() && !self.views.is_empty() && self.views.len() == self.images.len()
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    // No preferred format: pick our own
    if let [only] = available {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }

    // Prefer SRGB
    for format in available {
        if format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return Some(*format);
        }
    }

    available.first().copied()
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    // Mailbox, then immediate, then FIFO (always supported)
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

fn pre_transform(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if capabilities
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

/// First preferred depth/stencil format the adapter supports.
pub fn select_depth_format(supported: &[vk::Format]) -> Option<vk::Format> {
    DEPTH_FORMAT_PREFERENCE
        .into_iter()
        .find(|format| supported.contains(format))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_format_is_preferred() {
        let available = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn undefined_format_means_free_choice() {
        let available = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_UNORM)
        );
    }

    #[test]
    fn present_mode_follows_vsync() {
        let available = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&available, true),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            select_present_mode(&available, false),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn extent_uses_surface_size_when_fixed() {
        let fixed = caps(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!(
            calculate_extent(&fixed, 1024, 768),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );

        let free = caps(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });
        assert_eq!(
            calculate_extent(&free, 8000, 0),
            vk::Extent2D {
                width: 4096,
                height: 1
            }
        );
    }

    #[test]
    fn image_count_is_capped() {
        let mut capabilities = caps(vk::Extent2D::default());
        assert_eq!(image_count(&capabilities), 3);
        capabilities.min_image_count = 3;
        assert_eq!(image_count(&capabilities), 3);
        capabilities.max_image_count = 0;
        assert_eq!(image_count(&capabilities), 4);
    }

    #[test]
    fn depth_format_follows_preference() {
        assert_eq!(
            select_depth_format(&[
                vk::Format::D16_UNORM_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT
            ]),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );
        assert_eq!(select_depth_format(&[vk::Format::D32_SFLOAT]), None);
    }
}
