//! The rendering kernel: staged bring-up, resize and teardown.
//!
//! A kernel moves through `pre_init`, `init` and `post_init` in that order,
//! then renders with [`VulkanKernel::next_frame`]. Each stage either
//! completes or leaves the kernel failed; in both cases [`VulkanKernel::destroy`]
//! (or dropping the kernel) releases whatever was created.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use vkern_core::{KernelObject, LogSink, TracingSink};

use crate::capabilities::{select_adapter, AdapterComparator, PreferDiscrete};
use crate::descriptor_manager::DescriptorManager;
use crate::descriptors::{DescriptorSet, DescriptorTypes, PoolPolicy};
use crate::device::{Device, FamilyQueues};
use crate::driver::{DeviceRequest, Driver, InstanceDesc, SurfaceFactory};
use crate::error::{GpuError, Result, Stage};
use crate::instance::DEFAULT_VALIDATION_LAYER;
use crate::memory::ImageAllocator;
use crate::multisample::MultisampleTarget;
use crate::render_pass::{RenderPass, RenderPassLayout};
use crate::resize::ResizeHandle;
use crate::swapchain::{select_depth_format, Swapchain};
use crate::sync::{SubmitTemplate, SynchronizationSet};

/// Instance extension required for the validation message callback.
pub const DEBUG_UTILS_EXTENSION: &str = "VK_EXT_debug_utils";

/// Device extension required for presentation.
pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";

/// Highest bring-up stage completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelState {
    Uninitialized,
    PreInitialized,
    Initialized,
    PostInitialized,
    Destroyed,
}

/// Construction-time settings.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub validation: bool,
    /// Requested MSAA samples; multisampling is on when above one.
    pub sample_count: u32,
    pub pool_policy: PoolPolicy,
    /// Swapchain size used by `init` when no size was published.
    pub initial_extent: vk::Extent2D,
    /// Upper bound on how long `resize_window` waits for a published size.
    pub resize_timeout: Option<Duration>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            sample_count: 1,
            pool_policy: PoolPolicy::default(),
            initial_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            resize_timeout: None,
        }
    }
}

impl KernelConfig {
    pub fn multisampling(&self) -> bool {
        self.sample_count > 1
    }
}

/// Arguments of [`VulkanKernel::pre_init`].
#[derive(Debug, Clone, Default)]
pub struct PreInitInfo {
    pub app_name: String,
    pub engine_name: String,
    /// Recorded for shader tooling; the kernel never runs it.
    pub shader_compiler: PathBuf,
    pub instance_extensions: Vec<String>,
    pub validation_layers: Vec<String>,
}

impl PreInitInfo {
    pub fn new(app_name: impl Into<String>, engine_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            engine_name: engine_name.into(),
            ..Default::default()
        }
    }

    pub fn shader_compiler(mut self, path: impl Into<PathBuf>) -> Self {
        self.shader_compiler = path.into();
        self
    }

    pub fn instance_extension(mut self, name: impl Into<String>) -> Self {
        self.instance_extensions.push(name.into());
        self
    }

    pub fn validation_layer(mut self, name: impl Into<String>) -> Self {
        self.validation_layers.push(name.into());
        self
    }
}

/// Arguments of [`VulkanKernel::init`].
#[derive(Debug, Clone)]
pub struct InitInfo {
    pub device_extensions: Vec<String>,
    pub sample_shading: bool,
    pub vsync: bool,
}

impl Default for InitInfo {
    fn default() -> Self {
        Self {
            device_extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
            sample_shading: false,
            vsync: true,
        }
    }
}

/// Extension points called by the kernel.
///
/// Every method defaults to doing nothing.
pub trait KernelHooks<D: Driver> {
    /// Called at the end of `post_init`. Failing here fails `post_init`.
    fn on_complete(&mut self, _kernel: &mut VulkanKernel<D>) -> Result<()> {
        Ok(())
    }

    /// Called by `resize_window` after frame buffers were rebuilt.
    fn on_resize(&mut self, _kernel: &mut VulkanKernel<D>) -> Result<()> {
        Ok(())
    }

    /// Record the draw command buffers.
    fn build_command_buffers(&mut self, _kernel: &mut VulkanKernel<D>) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<D: Driver> KernelHooks<D> for NoHooks {}

/// Builder for [`VulkanKernel`].
pub struct KernelBuilder {
    config: KernelConfig,
    log: Arc<dyn LogSink>,
    comparator: Box<dyn AdapterComparator>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            log: Arc::new(TracingSink),
            comparator: Box::new(PreferDiscrete),
        }
    }

    /// Enable or disable validation layers and the debug messenger.
    pub fn validation(mut self, enable: bool) -> Self {
        self.config.validation = enable;
        self
    }

    /// Request `sample_count` MSAA samples. One or zero disables multisampling.
    pub fn multisampling(mut self, sample_count: u32) -> Self {
        self.config.sample_count = sample_count;
        self
    }

    pub fn pool_policy(mut self, policy: PoolPolicy) -> Self {
        self.config.pool_policy = policy;
        self
    }

    pub fn initial_extent(mut self, width: u32, height: u32) -> Self {
        self.config.initial_extent = vk::Extent2D { width, height };
        self
    }

    pub fn resize_timeout(mut self, timeout: Duration) -> Self {
        self.config.resize_timeout = Some(timeout);
        self
    }

    pub fn log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    /// Replace the adapter preference (discrete first by default).
    pub fn adapter_comparator(mut self, comparator: impl AdapterComparator + 'static) -> Self {
        self.comparator = Box::new(comparator);
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Create an uninitialized kernel around `driver`.
    pub fn build<D: Driver>(self, driver: D) -> VulkanKernel<D> {
        VulkanKernel {
            driver,
            resize: ResizeHandle::new(Arc::clone(&self.log)),
            config: self.config,
            comparator: self.comparator,
            log: self.log,
            state: KernelState::Uninitialized,
            failed: None,
            app_name: String::new(),
            engine_name: String::new(),
            shader_compiler: PathBuf::new(),
            instance_extensions: Vec::new(),
            validation_layers: Vec::new(),
            instance: vk::Instance::null(),
            debug_messenger: vk::DebugUtilsMessengerEXT::null(),
            surface: vk::SurfaceKHR::null(),
            device: None,
            allocator: None,
            descriptor_manager: None,
            command_pool: vk::CommandPool::null(),
            swapchain: None,
            draw_command_buffers: Vec::new(),
            wait_fences: Vec::new(),
            multisample: None,
            render_pass: RenderPass::default(),
            sync: SynchronizationSet::default(),
            submit: None,
            pipeline_cache: vk::PipelineCache::null(),
            frame_buffers: Vec::new(),
            extent: vk::Extent2D::default(),
            current_buffer: 0,
            unconsumed_acquire: false,
            has_errors: false,
        }
    }
}

/// Rendering kernel over a [`Driver`].
pub struct VulkanKernel<D: Driver> {
    pub(crate) driver: D,
    config: KernelConfig,
    comparator: Box<dyn AdapterComparator>,
    pub(crate) log: Arc<dyn LogSink>,
    resize: ResizeHandle,
    state: KernelState,
    failed: Option<Stage>,

    app_name: String,
    engine_name: String,
    shader_compiler: PathBuf,
    instance_extensions: Vec<String>,
    validation_layers: Vec<String>,
    instance: vk::Instance,
    debug_messenger: vk::DebugUtilsMessengerEXT,

    surface: vk::SurfaceKHR,
    pub(crate) device: Option<Device>,
    allocator: Option<D::Allocator>,
    descriptor_manager: Option<DescriptorManager>,
    command_pool: vk::CommandPool,
    pub(crate) swapchain: Option<Swapchain>,

    pub(crate) draw_command_buffers: Vec<vk::CommandBuffer>,
    pub(crate) wait_fences: Vec<vk::Fence>,
    multisample: Option<MultisampleTarget>,
    render_pass: RenderPass,
    pub(crate) sync: SynchronizationSet,
    pub(crate) submit: Option<SubmitTemplate>,
    pipeline_cache: vk::PipelineCache,
    frame_buffers: Vec<vk::Framebuffer>,

    extent: vk::Extent2D,
    pub(crate) current_buffer: u32,
    /// `present_complete` was signaled by an acquire no submission waited on.
    pub(crate) unconsumed_acquire: bool,
    pub(crate) has_errors: bool,
}

impl<D: Driver> VulkanKernel<D> {
    /// Create the instance and, with validation, the debug messenger.
    pub fn pre_init(&mut self, info: PreInitInfo) -> Result<()> {
        self.expect_state(KernelState::Uninitialized, Stage::PreInit)?;
        self.log
            .graph("VulkanKernel::pre_init: pre-initializing kernel...");

        self.app_name = info.app_name;
        self.engine_name = info.engine_name;
        self.shader_compiler = info.shader_compiler;
        self.validation_layers = info.validation_layers;
        self.instance_extensions = info.instance_extensions;

        let platform = self
            .driver
            .platform_instance_extensions()
            .map_err(|e| self.fail(Stage::PreInit, "query platform extensions", e))?;
        for name in platform {
            push_unique(&mut self.instance_extensions, name);
        }
        if self.config.validation {
            push_unique(
                &mut self.instance_extensions,
                DEBUG_UTILS_EXTENSION.to_string(),
            );
            if self.validation_layers.is_empty() {
                self.validation_layers
                    .push(DEFAULT_VALIDATION_LAYER.to_string());
            }
        }

        self.log.graph("VulkanKernel::pre_init: create vulkan instance...");
        let layers: &[String] = if self.config.validation {
            &self.validation_layers
        } else {
            &[]
        };
        let desc = InstanceDesc {
            app_name: &self.app_name,
            engine_name: &self.engine_name,
            api_version: vk::API_VERSION_1_2,
            extensions: &self.instance_extensions,
            layers,
        };
        let created = self.driver.create_instance(&desc);
        self.instance = created.map_err(|e| self.fail(Stage::PreInit, "create instance", e))?;

        if self.config.validation {
            match self.driver.create_debug_messenger() {
                Ok(messenger) => self.debug_messenger = messenger,
                Err(e) => {
                    self.driver.destroy_instance();
                    self.instance = vk::Instance::null();
                    return Err(self.fail(Stage::PreInit, "setup debug messenger", e));
                }
            }
        }

        self.state = KernelState::PreInitialized;
        Ok(())
    }

    /// Create the surface, device, allocator, descriptor manager, command pool and swapchain.
    pub fn init<F>(&mut self, surface_factory: F, info: InitInfo) -> Result<()>
    where
        F: SurfaceFactory<D>,
    {
        self.expect_state(KernelState::PreInitialized, Stage::Init)?;
        self.log.graph("VulkanKernel::init: initializing kernel...");

        let mut device_extensions = info.device_extensions;
        push_unique(&mut device_extensions, SWAPCHAIN_EXTENSION.to_string());

        self.log.graph("VulkanKernel::init: create vulkan surface...");
        let surface = surface_factory
            .create_surface(&self.driver, self.instance)
            .map_err(|e| self.fail(Stage::Init, "create surface", e))?;
        if surface == vk::SurfaceKHR::null() {
            let e = GpuError::SurfaceCreation("factory returned a null surface".to_string());
            return Err(self.fail(Stage::Init, "create surface", e));
        }
        self.surface = surface;

        self.log
            .graph("VulkanKernel::init: create vulkan logical device...");
        let device = self
            .create_device(&device_extensions, info.sample_shading)
            .map_err(|e| self.fail(Stage::Init, "create logical device", e))?;
        let queues = device.queues;
        let depth_formats = device.depth_formats.clone();
        self.log.log(&format!(
            "VulkanKernel::init: count MSAA samples is {}",
            device.sample_count.as_raw()
        ));
        self.device = Some(device);

        self.log.log("VulkanKernel::init: create allocator...");
        let allocator = self
            .driver
            .create_allocator()
            .map_err(|e| self.fail(Stage::Init, "create allocator", e))?;
        self.allocator = Some(allocator);

        self.log.log("VulkanKernel::init: create descriptor manager...");
        self.descriptor_manager = Some(DescriptorManager::new(
            self.config.pool_policy.clone(),
            Arc::clone(&self.log),
        ));

        let depth_format = select_depth_format(&depth_formats).ok_or_else(|| {
            self.fail(
                Stage::Init,
                "initialize surface",
                GpuError::InvalidState("no supported depth/stencil format".to_string()),
            )
        })?;

        let pool = self
            .driver
            .create_command_pool(queues.graphics_family)
            .map_err(|e| self.fail(Stage::Init, "create command pool", e))?;
        self.command_pool = pool;

        let (width, height) = self.resize.take_pending().unwrap_or((
            self.config.initial_extent.width,
            self.config.initial_extent.height,
        ));
        self.log.graph(&format!(
            "VulkanKernel::init: create vulkan swapchain with sizes: width = {width}; height = {height}"
        ));
        self.extent = vk::Extent2D { width, height };

        let mut swapchain = Swapchain::new(self.surface, depth_format, info.vsync);
        let result = swapchain.setup(&mut self.driver, &queues, width, height);
        let complete = swapchain.is_complete();
        self.swapchain = Some(swapchain);
        result.map_err(|e| self.fail(Stage::Init, "create swapchain", e))?;
        if !complete {
            let e = GpuError::SwapchainCreation("swapchain isn't ready".to_string());
            return Err(self.fail(Stage::Init, "create swapchain", e));
        }

        self.log.log(&format!(
            "VulkanKernel::init: depth format is {depth_format:?}"
        ));

        self.state = KernelState::Initialized;
        self.log
            .log("VulkanKernel::init: kernel successfully initialized!");
        Ok(())
    }

    fn create_device(&mut self, extensions: &[String], sample_shading: bool) -> Result<Device> {
        let adapters = self.driver.enumerate_adapters(self.surface, extensions)?;
        let adapter =
            select_adapter(&adapters, extensions, self.comparator.as_ref(), self.log.as_ref())?;

        let mut queues = FamilyQueues::from_indices(adapter.queue_families)?;
        let logical = self.driver.create_device(&DeviceRequest {
            adapter,
            queues,
            extensions,
            sample_shading,
        })?;
        queues.graphics_queue = self.driver.queue(queues.graphics_family, 0);

        let device = Device::new(
            adapter,
            logical,
            queues,
            self.config.sample_count,
            sample_shading,
        );
        if !device.is_ready() {
            self.driver.destroy_device();
            return Err(GpuError::InvalidState("device isn't ready".to_string()));
        }
        Ok(device)
    }

    /// Allocate per-image resources, build the multisample target, render
    /// pass, synchronization set, pipeline cache and frame buffers, then
    /// call [`KernelHooks::on_complete`].
    pub fn post_init<H>(&mut self, hooks: &mut H) -> Result<()>
    where
        H: KernelHooks<D> + ?Sized,
    {
        self.expect_state(KernelState::Initialized, Stage::PostInit)?;
        self.log
            .log("VulkanKernel::post_init: post-initializing kernel...");

        self.log
            .graph("VulkanKernel::post_init: allocate draw command buffers...");
        self.allocate_frame_resources()
            .map_err(|e| self.fail(Stage::PostInit, "allocate frame resources", e))?;

        self.log
            .graph("VulkanKernel::post_init: create multisample target...");
        let (Some(device), Some(swapchain), Some(allocator)) = (
            self.device.as_ref(),
            self.swapchain.as_ref(),
            self.allocator.as_mut(),
        ) else {
            let e = GpuError::InvalidState("kernel resources are missing".to_string());
            return Err(self.fail(Stage::PostInit, "create multisample target", e));
        };
        let color_format = swapchain.color_format;
        let depth_format = swapchain.depth_format;
        let multisampling = device.multisample_enabled();
        let samples = device.sample_count;
        let created = MultisampleTarget::create(
            &self.driver,
            allocator,
            device,
            depth_format,
            swapchain.extent.width,
            swapchain.extent.height,
            &[color_format],
            multisampling,
            Arc::clone(&self.log),
        );
        self.multisample =
            Some(created.map_err(|e| self.fail(Stage::PostInit, "create multisample target", e))?);

        self.log.graph("VulkanKernel::post_init: create render pass...");
        let layout = RenderPassLayout::new(
            color_format,
            depth_format,
            if multisampling {
                samples
            } else {
                vk::SampleCountFlags::TYPE_1
            },
        );
        self.render_pass = RenderPass::create(&self.driver, &layout)
            .map_err(|e| self.fail(Stage::PostInit, "create render pass", e))?;

        self.log
            .graph("VulkanKernel::post_init: create synchronizations...");
        self.sync = SynchronizationSet::create(&self.driver)
            .map_err(|e| self.fail(Stage::PostInit, "create synchronizations", e))?;
        self.submit = Some(self.sync.submit_template());

        let cache = self
            .driver
            .create_pipeline_cache()
            .map_err(|e| self.fail(Stage::PostInit, "create pipeline cache", e))?;
        self.pipeline_cache = cache;

        self.recreate_frame_buffers()
            .map_err(|e| self.fail(Stage::PostInit, "re-create frame buffers", e))?;

        self.state = KernelState::PostInitialized;

        self.log
            .log("VulkanKernel::post_init: call custom on-complete function...");
        hooks
            .on_complete(self)
            .map_err(|e| self.fail(Stage::PostInit, "complete kernel", e))?;

        self.log
            .log("VulkanKernel::post_init: kernel successfully post-initialized!");
        Ok(())
    }

    /// One primary command buffer and one signaled fence per swapchain image.
    fn allocate_frame_resources(&mut self) -> Result<()> {
        let count = self.swapchain.as_ref().map_or(0, Swapchain::image_count);
        if count == 0 {
            return Err(GpuError::InvalidState(
                "swapchain has no images".to_string(),
            ));
        }

        self.release_frame_resources();

        let count = u32::try_from(count)
            .map_err(|_| GpuError::InvalidState("too many swapchain images".to_string()))?;
        self.draw_command_buffers = self
            .driver
            .allocate_command_buffers(self.command_pool, count)?;

        self.log.graph("VulkanKernel: create wait fences...");
        for _ in 0..count {
            let fence = self.driver.create_fence(true)?;
            self.wait_fences.push(fence);
        }
        Ok(())
    }

    fn release_frame_resources(&mut self) {
        for fence in self.wait_fences.drain(..) {
            self.driver.destroy_fence(fence);
        }
        if !self.draw_command_buffers.is_empty() {
            self.driver
                .free_command_buffers(self.command_pool, &self.draw_command_buffers);
            self.draw_command_buffers.clear();
        }
    }

    /// Rebuild the multisample target at the swapchain size and one frame
    /// buffer per swapchain image.
    pub fn recreate_frame_buffers(&mut self) -> Result<()> {
        self.log
            .graph("VulkanKernel::recreate_frame_buffers: re-create vulkan frame buffers...");

        if !self.render_pass.is_ready() {
            self.log
                .error("VulkanKernel::recreate_frame_buffers: render pass is null!");
            return Err(GpuError::InvalidState("render pass is null".to_string())
                .at(Stage::FrameBuffers, "check render pass"));
        }

        let (Some(swapchain), Some(multisample), Some(allocator)) = (
            self.swapchain.as_ref(),
            self.multisample.as_mut(),
            self.allocator.as_mut(),
        ) else {
            return Err(
                GpuError::InvalidState("kernel resources are missing".to_string())
                    .at(Stage::FrameBuffers, "check resources"),
            );
        };

        let extent = swapchain.extent;
        if let Err(e) = multisample.recreate(&self.driver, allocator, extent.width, extent.height) {
            self.log.error(&format!(
                "VulkanKernel::recreate_frame_buffers: failed to re-create multisample target! Reason: {e}"
            ));
            return Err(e.at(Stage::FrameBuffers, "re-create multisample target"));
        }

        for framebuffer in self.frame_buffers.drain(..) {
            self.driver.destroy_framebuffer(framebuffer);
        }

        let multisampling = multisample.multisampling();
        let resolve = multisample.resolve_view(0);
        let depth = multisample.depth_view();

        for &view in &swapchain.views {
            let attachments: Vec<vk::ImageView> = if multisampling {
                vec![resolve, view, depth]
            } else {
                vec![view, depth]
            };
            debug_assert_eq!(attachments.len(), self.render_pass.attachment_count);

            match self
                .driver
                .create_framebuffer(self.render_pass.handle, &attachments, extent)
            {
                Ok(framebuffer) => self.frame_buffers.push(framebuffer),
                Err(e) => {
                    self.log.error(&format!(
                        "VulkanKernel::recreate_frame_buffers: failed to create vulkan frame buffer! Reason: {e}"
                    ));
                    return Err(e.at(Stage::FrameBuffers, "create frame buffer"));
                }
            }
        }

        Ok(())
    }

    /// Apply the size published through [`VulkanKernel::set_size`] or a [`ResizeHandle`].
    ///
    /// Blocks until a size is available (bounded by the configured timeout).
    /// A collapsed surface only commits the size.
    pub fn resize_window<H>(&mut self, hooks: &mut H) -> Result<()>
    where
        H: KernelHooks<D> + ?Sized,
    {
        if self.state != KernelState::PostInitialized || self.failed.is_some() {
            self.log
                .error("VulkanKernel::resize_window: kernel is not complete!");
            return Err(GpuError::InvalidState("kernel is not complete".to_string())
                .at(Stage::Resize, "check state"));
        }

        self.log.log(
            "VulkanKernel::resize_window: waiting for a change in the size of the client window...",
        );
        let (width, height) = self
            .resize
            .wait_pending(self.config.resize_timeout)
            .ok_or_else(|| {
                self.fail(
                    Stage::Resize,
                    "wait for window size",
                    GpuError::InvalidState("no window size was published".to_string()),
                )
            })?;
        self.log.log(&format!(
            "VulkanKernel::resize_window: set new sizes: width = {width}; height = {height}"
        ));

        self.driver
            .device_wait_idle()
            .map_err(|e| self.fail(Stage::Resize, "wait device idle", e.into()))?;

        if self.unconsumed_acquire {
            self.renew_synchronization()
                .map_err(|e| self.fail(Stage::Resize, "renew synchronizations", e))?;
        }

        self.extent = vk::Extent2D { width, height };

        if !self.surface_is_available() {
            return Ok(());
        }

        let (Some(swapchain), Some(device)) = (self.swapchain.as_mut(), self.device.as_ref())
        else {
            let e = GpuError::InvalidState("swapchain is missing".to_string());
            return Err(self.fail(Stage::Resize, "re-setup swapchain", e));
        };
        let queues = device.queues;
        let result = swapchain.setup(&mut self.driver, &queues, width, height);
        result.map_err(|e| self.fail(Stage::Resize, "re-setup swapchain", e))?;
        self.current_buffer = 0;

        if self.swapchain.as_ref().map_or(0, Swapchain::image_count)
            != self.draw_command_buffers.len()
        {
            self.allocate_frame_resources()
                .map_err(|e| self.fail(Stage::Resize, "re-allocate frame resources", e))?;
        }

        self.recreate_frame_buffers()
            .map_err(|e| self.fail(Stage::Resize, "re-create frame buffers", e))?;

        self.log
            .log("VulkanKernel::resize_window: call custom on-resize function...");
        hooks
            .on_resize(self)
            .map_err(|e| self.fail(Stage::Resize, "resize inherited hooks", e))?;

        hooks
            .build_command_buffers(self)
            .map_err(|e| self.fail(Stage::Resize, "build command buffers", e))?;

        Ok(())
    }

    /// Replace both semaphores and the submit template.
    ///
    /// A binary semaphore signaled by an acquire that was never waited on
    /// cannot be passed to the next acquire. The device must be idle.
    pub(crate) fn renew_synchronization(&mut self) -> Result<()> {
        self.sync.destroy(&self.driver);
        self.submit = None;
        self.sync = SynchronizationSet::create(&self.driver)?;
        self.submit = Some(self.sync.submit_template());
        self.unconsumed_acquire = false;
        Ok(())
    }

    fn surface_is_available(&self) -> bool {
        match self.driver.surface_extent(self.surface) {
            Ok(extent) => extent.width > 0 && extent.height > 0,
            Err(e) => {
                self.log.warn(&format!(
                    "VulkanKernel: cannot query surface extent: {e}"
                ));
                false
            }
        }
    }

    /// Publish a new window size. Thread-safe through [`VulkanKernel::resize_handle`].
    pub fn set_size(&self, width: u32, height: u32) {
        self.resize.set_size(width, height);
    }

    /// Handle for the window thread.
    pub fn resize_handle(&self) -> ResizeHandle {
        self.resize.clone()
    }

    /// Allocate a descriptor set through the kernel's descriptor manager.
    pub fn allocate_descriptor_sets(
        &mut self,
        layout: vk::DescriptorSetLayout,
        types: DescriptorTypes,
    ) -> Result<DescriptorSet> {
        let manager = self.descriptor_manager.as_mut().ok_or_else(|| {
            GpuError::InvalidState("descriptor manager is not created".to_string())
        })?;
        manager.allocate_descriptor_sets(&self.driver, layout, types)
    }

    pub fn free_descriptor_set(&mut self, set: DescriptorSet) -> Result<()> {
        let manager = self.descriptor_manager.as_mut().ok_or_else(|| {
            GpuError::InvalidState("descriptor manager is not created".to_string())
        })?;
        manager.free_descriptor_set(&self.driver, set)
    }

    /// Release everything in reverse dependency order. Safe after any
    /// failure and safe to call twice.
    pub fn destroy(&mut self) {
        if self.state == KernelState::Destroyed {
            return;
        }
        self.log
            .log("VulkanKernel::destroy: free kernel memory...");

        if let Some(mut multisample) = self.multisample.take() {
            if let Some(allocator) = self.allocator.as_mut() {
                if let Err(e) = multisample.destroy(&self.driver, allocator) {
                    self.log.error(&format!(
                        "VulkanKernel::destroy: failed to destroy multisample target: {e}"
                    ));
                }
            }
        }

        if let Some(manager) = self.descriptor_manager.take() {
            manager.free(&self.driver);
        }

        for framebuffer in self.frame_buffers.drain(..) {
            self.driver.destroy_framebuffer(framebuffer);
        }

        if self.pipeline_cache != vk::PipelineCache::null() {
            self.driver.destroy_pipeline_cache(self.pipeline_cache);
            self.pipeline_cache = vk::PipelineCache::null();
        }

        self.sync.destroy(&self.driver);
        self.submit = None;
        self.render_pass.destroy(&self.driver);

        self.release_frame_resources();

        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.driver);
        }

        if self.surface != vk::SurfaceKHR::null() {
            self.driver.destroy_surface(self.surface);
            self.surface = vk::SurfaceKHR::null();
        }

        if self.command_pool != vk::CommandPool::null() {
            self.driver.destroy_command_pool(self.command_pool);
            self.command_pool = vk::CommandPool::null();
        }

        drop(self.allocator.take());

        if self.device.take().is_some() {
            self.driver.destroy_device();
        }

        if self.debug_messenger != vk::DebugUtilsMessengerEXT::null() {
            self.driver.destroy_debug_messenger(self.debug_messenger);
            self.debug_messenger = vk::DebugUtilsMessengerEXT::null();
        }

        if self.instance != vk::Instance::null() {
            self.driver.destroy_instance();
            self.instance = vk::Instance::null();
        }

        self.state = KernelState::Destroyed;
        self.log
            .log("VulkanKernel::destroy: all resources has been freed!");
    }

    fn expect_state(&self, expected: KernelState, stage: Stage) -> Result<()> {
        if let Some(failed) = self.failed {
            return Err(GpuError::InvalidState(format!(
                "{stage} called after {failed} failed"
            )));
        }
        if self.state != expected {
            self.log.error(&format!(
                "VulkanKernel: {stage} called in state {:?}, expected {expected:?}",
                self.state
            ));
            return Err(GpuError::InvalidState(format!(
                "{stage} requires state {expected:?}, kernel is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Log a failed step, mark the kernel failed and wrap the error.
    fn fail(&mut self, stage: Stage, step: &'static str, error: GpuError) -> GpuError {
        self.log.error(&format!(
            "VulkanKernel::{stage}: failed to {step}! Reason: {error}"
        ));
        self.failed = Some(stage);
        self.has_errors = true;
        error.at(stage, step)
    }

    /// Highest stage reached, or `Destroyed`.
    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Stage that failed, if any. A failed kernel only accepts `destroy`.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.failed
    }

    /// `pre_init` completed and the kernel was not destroyed since.
    pub fn is_pre_initialized(&self) -> bool {
        matches!(
            self.state,
            KernelState::PreInitialized | KernelState::Initialized | KernelState::PostInitialized
        )
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state,
            KernelState::Initialized | KernelState::PostInitialized
        )
    }

    pub fn is_post_initialized(&self) -> bool {
        self.state == KernelState::PostInitialized
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutable driver access for host-side resource creation.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Sink shared by the kernel, its descriptor manager and resize handle.
    pub fn log(&self) -> &Arc<dyn LogSink> {
        &self.log
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    /// Compiler path recorded by `pre_init`; the kernel never runs it.
    pub fn shader_compiler(&self) -> &std::path::Path {
        &self.shader_compiler
    }

    /// Instance extensions after platform and validation extensions were added.
    pub fn instance_extensions(&self) -> &[String] {
        &self.instance_extensions
    }

    /// Layers requested at `pre_init`, including the default validation layer.
    pub fn validation_layers(&self) -> &[String] {
        &self.validation_layers
    }

    pub fn instance(&self) -> vk::Instance {
        self.instance
    }

    /// Null unless validation is enabled.
    pub fn debug_messenger(&self) -> vk::DebugUtilsMessengerEXT {
        self.debug_messenger
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Logical device, present from `init` until `destroy`.
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn allocator(&self) -> Option<&D::Allocator> {
        self.allocator.as_ref()
    }

    pub fn allocator_mut(&mut self) -> Option<&mut D::Allocator> {
        self.allocator.as_mut()
    }

    /// Bytes allocated for kernel and host images.
    pub fn allocated_memory(&self) -> u64 {
        self.allocator
            .as_ref()
            .map_or(0, ImageAllocator::allocated_bytes)
    }

    pub fn descriptor_manager(&self) -> Option<&DescriptorManager> {
        self.descriptor_manager.as_ref()
    }

    pub fn descriptor_manager_mut(&mut self) -> Option<&mut DescriptorManager> {
        self.descriptor_manager.as_mut()
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// Off-screen attachments, rebuilt with every frame buffer set.
    pub fn multisample(&self) -> Option<&MultisampleTarget> {
        self.multisample.as_ref()
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    /// Frame semaphores. Renewed when an acquired image was never submitted,
    /// so the handles may change across a resize.
    pub fn synchronization(&self) -> &SynchronizationSet {
        &self.sync
    }

    /// Submission wiring pinned to the current [`SynchronizationSet`].
    pub fn submit_template(&self) -> Option<&SubmitTemplate> {
        self.submit.as_ref()
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// One frame buffer per swapchain image.
    pub fn frame_buffers(&self) -> &[vk::Framebuffer] {
        &self.frame_buffers
    }

    /// Primary command buffers, indexed like the swapchain images.
    pub fn draw_command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.draw_command_buffers
    }

    /// Per-image fences, created signaled.
    pub fn wait_fences(&self) -> &[vk::Fence] {
        &self.wait_fences
    }

    /// Committed window size.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Swapchain image index of the last successful acquire.
    pub fn current_buffer(&self) -> u32 {
        self.current_buffer
    }

    /// Either dimension of the last published size is zero.
    pub fn is_paused(&self) -> bool {
        self.resize.is_paused()
    }

    /// A stage or frame step failed with `Error` or `DeviceLost`.
    pub fn has_errors(&self) -> bool {
        self.has_errors
    }
}

impl<D: Driver> Drop for VulkanKernel<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<D: Driver> std::fmt::Debug for VulkanKernel<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanKernel")
            .field("state", &self.state)
            .field("failed", &self.failed)
            .field("extent", &self.extent)
            .field("current_buffer", &self.current_buffer)
            .field("has_errors", &self.has_errors)
            .finish_non_exhaustive()
    }
}

fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_config() {
        let builder = KernelBuilder::new()
            .validation(false)
            .multisampling(8)
            .initial_extent(800, 600)
            .resize_timeout(Duration::from_millis(50))
            .pool_policy(PoolPolicy::default().with_max_sets(16));

        let config = builder.config();
        assert!(!config.validation);
        assert!(config.multisampling());
        assert_eq!(config.sample_count, 8);
        assert_eq!(config.initial_extent.width, 800);
        assert_eq!(config.pool_policy.max_sets, 16);
        assert_eq!(config.resize_timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn single_sample_disables_multisampling() {
        let config = KernelConfig {
            sample_count: 1,
            ..Default::default()
        };
        assert!(!config.multisampling());
    }

    #[test]
    fn pre_init_info_builder() {
        let info = PreInitInfo::new("T", "E")
            .shader_compiler("glslc")
            .instance_extension("VK_KHR_surface")
            .validation_layer("VK_LAYER_KHRONOS_validation");
        assert_eq!(info.app_name, "T");
        assert_eq!(info.engine_name, "E");
        assert_eq!(info.instance_extensions, vec!["VK_KHR_surface".to_string()]);
        assert_eq!(info.validation_layers.len(), 1);
    }

    #[test]
    fn init_info_requests_swapchain() {
        let info = InitInfo::default();
        assert!(info.device_extensions.iter().any(|e| e == SWAPCHAIN_EXTENSION));
    }

    #[test]
    fn push_unique_skips_duplicates() {
        let mut list = vec!["a".to_string()];
        push_unique(&mut list, "a".to_string());
        push_unique(&mut list, "b".to_string());
        assert_eq!(list, vec!["a".to_string(), "b".to_string()]);
    }
}
