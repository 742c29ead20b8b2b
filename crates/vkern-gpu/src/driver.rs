//! The GPU API boundary.
//!
//! Everything the kernel asks of the graphics API goes through [`Driver`].
//! A driver is stateful: once [`Driver::create_instance`] and
//! [`Driver::create_device`] succeed it keeps the loaded instance and
//! logical device and every later call operates on them.
//!
//! [`crate::VulkanDriver`] implements the trait with `ash`.

use ash::prelude::VkResult;
use ash::vk;

use crate::capabilities::AdapterInfo;
use crate::device::FamilyQueues;
use crate::error::Result;
use crate::memory::ImageAllocator;
use crate::render_pass::RenderPassLayout;
use crate::sync::SubmitTemplate;

/// Arguments for instance creation.
#[derive(Debug, Clone, Copy)]
pub struct InstanceDesc<'a> {
    pub app_name: &'a str,
    pub engine_name: &'a str,
    pub api_version: u32,
    pub extensions: &'a [String],
    pub layers: &'a [String],
}

/// Arguments for logical device creation.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRequest<'a> {
    pub adapter: &'a AdapterInfo,
    pub queues: FamilyQueues,
    pub extensions: &'a [String],
    pub sample_shading: bool,
}

/// What a surface supports on the current physical device.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Fully resolved swapchain parameters.
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Graphics and present families; concurrent sharing when they differ.
    pub queue_families: Vec<u32>,
    pub old_swapchain: vk::SwapchainKHR,
}

/// Stateful handle to the graphics API.
pub trait Driver {
    /// Image allocator created for the logical device.
    type Allocator: ImageAllocator;

    // Instance

    /// Instance extensions the platform needs for presentation.
    fn platform_instance_extensions(&self) -> Result<Vec<String>>;

    fn create_instance(&mut self, desc: &InstanceDesc<'_>) -> Result<vk::Instance>;

    /// Install the validation message callback on the current instance.
    fn create_debug_messenger(&mut self) -> Result<vk::DebugUtilsMessengerEXT>;

    fn destroy_debug_messenger(&mut self, messenger: vk::DebugUtilsMessengerEXT);

    fn destroy_instance(&mut self);

    // Surface

    /// Capabilities, formats and present modes of `surface` on the selected adapter.
    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport>;

    /// Current surface size, zero in either dimension while minimised.
    fn surface_extent(&self, surface: vk::SurfaceKHR) -> Result<vk::Extent2D> {
        Ok(self.surface_support(surface)?.capabilities.current_extent)
    }

    fn destroy_surface(&mut self, surface: vk::SurfaceKHR);

    // Adapters and device

    /// Describe every physical device, checked against `surface` and `extensions`.
    fn enumerate_adapters(
        &self,
        surface: vk::SurfaceKHR,
        extensions: &[String],
    ) -> Result<Vec<AdapterInfo>>;

    fn create_device(&mut self, request: &DeviceRequest<'_>) -> Result<vk::Device>;

    fn queue(&self, family: u32, index: u32) -> vk::Queue;

    fn device_wait_idle(&self) -> VkResult<()>;

    fn destroy_device(&mut self);

    fn create_allocator(&mut self) -> Result<Self::Allocator>;

    // Commands and synchronization

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Submit one command buffer with the semaphores pinned in `template`.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        template: &SubmitTemplate,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    // Swapchain

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR>;

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;

    // Images

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);

    // Render pass, frame buffers, pipeline cache

    fn create_render_pass(&self, layout: &RenderPassLayout) -> Result<vk::RenderPass>;

    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_pipeline_cache(&self) -> Result<vk::PipelineCache>;

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);

    // Descriptors

    /// Pools are created with `FREE_DESCRIPTOR_SET` so sets can be freed one by one.
    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()>;
}

/// Creates the platform surface for a freshly created instance.
///
/// Injected into `init` so the kernel never depends on a windowing library.
pub trait SurfaceFactory<D: ?Sized> {
    fn create_surface(self, driver: &D, instance: vk::Instance) -> Result<vk::SurfaceKHR>;
}

impl<D: ?Sized, F> SurfaceFactory<D> for F
where
    F: FnOnce(&D, vk::Instance) -> Result<vk::SurfaceKHR>,
{
    fn create_surface(self, driver: &D, instance: vk::Instance) -> Result<vk::SurfaceKHR> {
        self(driver, instance)
    }
}
