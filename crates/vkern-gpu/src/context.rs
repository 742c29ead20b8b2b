//! `ash` implementation of [`Driver`].

use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::capabilities::{AdapterInfo, AdapterLimits, FamilyIndices, GpuVendor};
use crate::command;
use crate::driver::{DeviceRequest, Driver, InstanceDesc, SurfaceSupport, SwapchainDesc};
use crate::error::{GpuError, Result};
use crate::instance::{self, to_cstrings};
use crate::memory::GpuAllocator;
use crate::render_pass::RenderPassLayout;
use crate::swapchain::DEPTH_FORMAT_PREFERENCE;
use crate::sync::{self, SubmitTemplate};

/// Vulkan driver backed by the system loader.
///
/// Holds the instance and logical device between `create_*` and `destroy_*`.
pub struct VulkanDriver {
    entry: ash::Entry,
    instance: Option<ash::Instance>,
    surface_loader: Option<ash::khr::surface::Instance>,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    physical_device: vk::PhysicalDevice,
    device: Option<Arc<ash::Device>>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
}

impl VulkanDriver {
    /// Load the Vulkan library.
    pub fn new() -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        Ok(Self {
            entry,
            instance: None,
            surface_loader: None,
            debug_utils: None,
            physical_device: vk::PhysicalDevice::null(),
            device: None,
            swapchain_loader: None,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> Option<&ash::Instance> {
        self.instance.as_ref()
    }

    /// Logical device, for recording commands in host hooks.
    pub fn device(&self) -> Option<&ash::Device> {
        self.device.as_deref()
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Create a surface for a native window on the current instance.
    pub fn create_window_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR> {
        let instance = self.instance_ref()?;
        let surface = unsafe { ash_window::create_surface(&self.entry, instance, display, window, None) }
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(surface)
    }

    /// Record `cmd` between begin and end.
    pub fn record<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = self.device_ref()?;
        unsafe {
            command::begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::empty())?;
            record(device, cmd);
            command::end_command_buffer(device, cmd)
        }
    }

    fn instance_ref(&self) -> Result<&ash::Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("instance is not created".to_string()))
    }

    fn surface_loader(&self) -> Result<&ash::khr::surface::Instance> {
        self.surface_loader
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("instance is not created".to_string()))
    }

    fn device_ref(&self) -> Result<&ash::Device> {
        self.device
            .as_deref()
            .ok_or_else(|| GpuError::InvalidState("device is not created".to_string()))
    }

    fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("device is not created".to_string()))
    }

    /// Describe one physical device.
    ///
    /// # Safety
    /// The physical device must belong to the current instance.
    unsafe fn describe_adapter(
        &self,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        extensions: &[String],
    ) -> Result<AdapterInfo> {
        let surface_loader = self.surface_loader()?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };

        let name = properties
            .device_name_as_c_str()
            .map_or_else(|_| "Unknown".to_string(), |n| n.to_string_lossy().into_owned());

        let device_local_memory_mb = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum::<u64>()
            / (1024 * 1024);
        let memory_types = memory.memory_types[..memory.memory_type_count as usize]
            .iter()
            .map(|t| t.property_flags)
            .collect();

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut queue_families = FamilyIndices::default();
        for (i, family) in families.iter().enumerate() {
            let i = u32::try_from(i)
                .map_err(|_| GpuError::InvalidState("too many queue families".to_string()))?;
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, i, surface)
            }
            .unwrap_or(false);

            if graphics && queue_families.graphics.is_none() {
                queue_families.graphics = Some(i);
            }
            // One family for both avoids concurrent sharing
            let shared = graphics && queue_families.graphics == Some(i);
            if present && (queue_families.present.is_none() || shared) {
                queue_families.present = Some(i);
            }
        }

        let depth_formats = DEPTH_FORMAT_PREFERENCE
            .into_iter()
            .filter(|&format| {
                let props = unsafe {
                    instance.get_physical_device_format_properties(physical_device, format)
                };
                props
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .collect();

        let available =
            unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        let available: Vec<String> = available
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        let missing_extensions = extensions
            .iter()
            .filter(|name| !available.contains(name))
            .cloned()
            .collect();

        Ok(AdapterInfo {
            handle: physical_device,
            name,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_type: properties.device_type,
            api_version: properties.api_version,
            device_local_memory_mb,
            limits: AdapterLimits {
                framebuffer_color_sample_counts: properties.limits.framebuffer_color_sample_counts,
                framebuffer_depth_sample_counts: properties.limits.framebuffer_depth_sample_counts,
                max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            },
            memory_types,
            queue_families,
            depth_formats,
            missing_extensions,
            supports_present: queue_families.present.is_some(),
            supports_sample_shading: features.sample_rate_shading == vk::TRUE,
        })
    }
}

impl Driver for VulkanDriver {
    type Allocator = GpuAllocator;

    fn platform_instance_extensions(&self) -> Result<Vec<String>> {
        let available = unsafe { self.entry.enumerate_instance_extension_properties(None)? };
        let is_available = |name: &std::ffi::CStr| {
            available
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == name))
        };

        if !is_available(ash::khr::surface::NAME) {
            return Err(GpuError::Loading(
                "VK_KHR_surface is not supported by the loader".to_string(),
            ));
        }

        Ok(instance::platform_instance_extensions()
            .into_iter()
            .filter(|name| is_available(name))
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn create_instance(&mut self, desc: &InstanceDesc<'_>) -> Result<vk::Instance> {
        let instance = unsafe { instance::create_instance(&self.entry, desc)? };
        let handle = instance.handle();
        self.surface_loader = Some(ash::khr::surface::Instance::new(&self.entry, &instance));
        self.instance = Some(instance);
        Ok(handle)
    }

    fn create_debug_messenger(&mut self) -> Result<vk::DebugUtilsMessengerEXT> {
        let instance = self.instance_ref()?;
        let loader = ash::ext::debug_utils::Instance::new(&self.entry, instance);
        let messenger = unsafe { instance::create_debug_messenger(&loader)? };
        self.debug_utils = Some(loader);
        Ok(messenger)
    }

    fn destroy_debug_messenger(&mut self, messenger: vk::DebugUtilsMessengerEXT) {
        if let Some(loader) = self.debug_utils.take() {
            unsafe { loader.destroy_debug_utils_messenger(messenger, None) };
        }
    }

    fn destroy_instance(&mut self) {
        self.debug_utils = None;
        self.surface_loader = None;
        if let Some(instance) = self.instance.take() {
            unsafe { instance.destroy_instance(None) };
        }
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        let loader = self.surface_loader()?;
        let physical = self.physical_device;
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader.get_physical_device_surface_capabilities(physical, surface)?,
                formats: loader.get_physical_device_surface_formats(physical, surface)?,
                present_modes: loader.get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }

    fn destroy_surface(&mut self, surface: vk::SurfaceKHR) {
        if let Some(loader) = &self.surface_loader {
            unsafe { loader.destroy_surface(surface, None) };
        }
    }

    fn enumerate_adapters(
        &self,
        surface: vk::SurfaceKHR,
        extensions: &[String],
    ) -> Result<Vec<AdapterInfo>> {
        let instance = self.instance_ref()?;
        let physical_devices = unsafe { instance.enumerate_physical_devices()? };

        physical_devices
            .into_iter()
            .map(|pd| unsafe { self.describe_adapter(instance, pd, surface, extensions) })
            .collect()
    }

    fn create_device(&mut self, request: &DeviceRequest<'_>) -> Result<vk::Device> {
        let instance = self.instance_ref()?;

        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = request
            .queues
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extensions = to_cstrings(request.extensions)?;
        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures::default().sample_rate_shading(
            request.sample_shading && request.adapter.supports_sample_shading,
        );

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(request.adapter.handle, &create_info, None)? };
        let handle = device.handle();

        self.swapchain_loader = Some(ash::khr::swapchain::Device::new(instance, &device));
        self.physical_device = request.adapter.handle;
        self.device = Some(Arc::new(device));
        Ok(handle)
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        self.device
            .as_ref()
            .map_or(vk::Queue::null(), |device| unsafe {
                device.get_device_queue(family, index)
            })
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn device_wait_idle(&self) -> VkResult<()> {
        match &self.device {
            Some(device) => unsafe { device.device_wait_idle() },
            None => Ok(()),
        }
    }

    fn destroy_device(&mut self) {
        self.swapchain_loader = None;
        if let Some(device) = self.device.take() {
            unsafe {
                if let Err(e) = device.device_wait_idle() {
                    tracing::warn!("VulkanDriver: device wait idle before destroy failed: {e}");
                }
                device.destroy_device(None);
            }
        }
        self.physical_device = vk::PhysicalDevice::null();
    }

    fn create_allocator(&mut self) -> Result<GpuAllocator> {
        let instance = self.instance_ref()?;
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("device is not created".to_string()))?;
        unsafe { GpuAllocator::new(instance, Arc::clone(device), self.physical_device) }
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        unsafe { command::create_command_pool(self.device_ref()?, queue_family) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_command_pool(pool, None) };
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        unsafe { command::allocate_primary(self.device_ref()?, pool, count) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if let Some(device) = &self.device {
            unsafe { device.free_command_buffers(pool, buffers) };
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        unsafe { sync::create_fence(self.device_ref()?, signaled) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        unsafe { device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        unsafe { device.reset_fences(&[fence]) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_fence(fence, None) };
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe { sync::create_semaphore(self.device_ref()?) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn queue_submit(
        &self,
        queue: vk::Queue,
        template: &SubmitTemplate,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let command_buffers = [command_buffer];
        let submit = template.info(&command_buffers);
        unsafe { device.queue_submit(queue, std::slice::from_ref(&submit), fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        unsafe { device.queue_wait_idle(queue) }
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let loader = self.swapchain_loader()?;

        // Graphics and present in different families need concurrent access
        let sharing_mode = if desc.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            create_info = create_info.queue_family_indices(&desc.queue_families);
        }

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let images = unsafe { self.swapchain_loader()?.get_swapchain_images(swapchain)? };
        Ok(images)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = &self.swapchain_loader {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let loader = self
            .swapchain_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        unsafe { loader.acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null()) }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let loader = self
            .swapchain_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;

        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { loader.queue_present(queue, &present_info) }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device_ref()?.create_image_view(&view_info, None)? };
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    fn create_render_pass(&self, layout: &RenderPassLayout) -> Result<vk::RenderPass> {
        let color = [layout.color];
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color)
            .depth_stencil_attachment(&layout.depth);
        let resolve: Vec<vk::AttachmentReference> = layout.resolve.into_iter().collect();
        if !resolve.is_empty() {
            subpass = subpass.resolve_attachments(&resolve);
        }

        let subpasses = [subpass];
        let dependencies = [layout.dependency];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&layout.attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { self.device_ref()?.create_render_pass(&create_info, None)? };
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_render_pass(render_pass, None) };
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device_ref()?.create_framebuffer(&create_info, None)? };
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }
    }

    fn create_pipeline_cache(&self) -> Result<vk::PipelineCache> {
        let create_info = vk::PipelineCacheCreateInfo::default();
        let cache = unsafe { self.device_ref()?.create_pipeline_cache(&create_info, None)? };
        Ok(cache)
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_pipeline_cache(cache, None) };
        }
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        let pool = unsafe { self.device_ref()?.create_descriptor_pool(&create_info, None) }
            .map_err(|e| GpuError::Descriptor(format!("failed to create descriptor pool: {e}")))?;
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let device = self
            .device
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        unsafe { self.device_ref()?.free_descriptor_sets(pool, &[set])? };
        Ok(())
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        // Kernels release everything first; this only covers hosts that skipped it
        self.destroy_device();
        self.destroy_instance();
    }
}

impl std::fmt::Debug for VulkanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDriver")
            .field("instance", &self.instance.as_ref().map(ash::Instance::handle))
            .field("device", &self.device.as_ref().map(|d| d.handle()))
            .field("physical_device", &self.physical_device)
            .finish_non_exhaustive()
    }
}
