//! In-memory [`Driver`] that hands out synthetic handles.
//!
//! Every created object is tracked until destroyed, so tests can assert on
//! leaks. Individual operations can be made to fail, and the frame-path
//! results (acquire, present, waits) can be scripted.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use vkern_gpu::{
    AdapterInfo, AdapterLimits, DeviceRequest, Driver, FamilyIndices, GpuError, GpuImage,
    GpuVendor, ImageAllocator, InstanceDesc, RenderPassLayout, Result, SubmitTemplate,
    SurfaceSupport, SwapchainDesc,
};

use crate::TestError;

/// Kinds of objects the mock tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Instance,
    DebugMessenger,
    Surface,
    Device,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
    Swapchain,
    ImageView,
    Image,
    RenderPass,
    Framebuffer,
    PipelineCache,
    DescriptorPool,
    DescriptorSet,
}

#[derive(Debug, Default)]
struct PoolState {
    capacity: u32,
    sets: HashSet<u64>,
}

#[derive(Debug)]
struct State {
    next_handle: u64,
    live: BTreeMap<ObjectKind, HashSet<u64>>,
    created: BTreeMap<ObjectKind, usize>,

    fail_once: HashSet<&'static str>,
    fail_always: HashSet<&'static str>,

    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
    fence_script: VecDeque<VkResult<()>>,
    wait_idle_script: VecDeque<VkResult<()>>,
    next_image: u32,

    adapters: Vec<AdapterInfo>,
    supported_extensions: Vec<String>,
    surface: SurfaceSupport,

    swapchain_images: HashMap<u64, u32>,
    pools: HashMap<u64, PoolState>,
    framebuffer_attachments: Vec<usize>,
    instance_layers: Vec<String>,
    instance_extensions: Vec<String>,
    submits: usize,
    presents: usize,
    allocated_bytes: u64,
    /// Binary semaphores with a pending signal nobody has waited on yet.
    signaled: HashSet<u64>,
}

impl State {
    fn new() -> Self {
        Self {
            next_handle: 0x1000,
            live: BTreeMap::new(),
            created: BTreeMap::new(),
            fail_once: HashSet::new(),
            fail_always: HashSet::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            fence_script: VecDeque::new(),
            wait_idle_script: VecDeque::new(),
            next_image: 0,
            adapters: vec![default_adapter()],
            supported_extensions: vec!["VK_KHR_swapchain".to_string()],
            surface: default_surface(1280, 720),
            swapchain_images: HashMap::new(),
            pools: HashMap::new(),
            framebuffer_attachments: Vec::new(),
            instance_layers: Vec::new(),
            instance_extensions: Vec::new(),
            submits: 0,
            presents: 0,
            allocated_bytes: 0,
            signaled: HashSet::new(),
        }
    }

    fn track(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.entry(kind).or_default().insert(raw);
        *self.created.entry(kind).or_default() += 1;
        raw
    }

    fn untrack(&mut self, kind: ObjectKind, raw: u64) {
        if let Some(set) = self.live.get_mut(&kind) {
            set.remove(&raw);
        }
    }

    fn untrack_all(&mut self, kind: ObjectKind) {
        self.live.remove(&kind);
    }

    fn should_fail(&mut self, op: &'static str) -> bool {
        self.fail_always.contains(op) || self.fail_once.remove(op)
    }
}

/// Adapter with graphics and present on family 0, 1 to 8 samples and two
/// depth/stencil formats.
pub fn default_adapter() -> AdapterInfo {
    let samples = vk::SampleCountFlags::TYPE_1
        | vk::SampleCountFlags::TYPE_2
        | vk::SampleCountFlags::TYPE_4
        | vk::SampleCountFlags::TYPE_8;

    AdapterInfo {
        handle: vk::PhysicalDevice::from_raw(0x10),
        name: "Mock GPU".to_string(),
        vendor: GpuVendor::from_vendor_id(0x10DE),
        device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
        api_version: vk::API_VERSION_1_3,
        device_local_memory_mb: 8192,
        limits: AdapterLimits {
            framebuffer_color_sample_counts: samples,
            framebuffer_depth_sample_counts: samples,
            max_image_dimension_2d: 16384,
        },
        memory_types: vec![
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ],
        queue_families: FamilyIndices {
            graphics: Some(0),
            present: Some(0),
        },
        depth_formats: vec![vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT],
        missing_extensions: Vec::new(),
        supports_present: true,
        supports_sample_shading: true,
    }
}

fn default_surface(width: u32, height: u32) -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D { width, height },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        },
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

fn injected(op: &'static str) -> GpuError {
    tracing::debug!("MockDriver: injected failure in {op}");
    GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
}

/// Mock driver. Clones share state, so a clone kept by the test sees
/// everything the kernel does.
#[derive(Debug, Clone)]
pub struct MockDriver {
    state: Arc<Mutex<State>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Make the next call to `op` (a [`Driver`] method name) fail.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().fail_once.insert(op);
    }

    /// Make every call to `op` fail until [`MockDriver::clear_failures`].
    pub fn fail_always(&self, op: &'static str) {
        self.state.lock().fail_always.insert(op);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_once.clear();
        state.fail_always.clear();
    }

    /// Queue results for upcoming `acquire_next_image` calls.
    pub fn script_acquire(&self, results: impl IntoIterator<Item = VkResult<(u32, bool)>>) {
        self.state.lock().acquire_script.extend(results);
    }

    pub fn script_present(&self, results: impl IntoIterator<Item = VkResult<bool>>) {
        self.state.lock().present_script.extend(results);
    }

    /// Queue results for upcoming `wait_for_fence` calls.
    pub fn script_fence_wait(&self, results: impl IntoIterator<Item = VkResult<()>>) {
        self.state.lock().fence_script.extend(results);
    }

    pub fn script_queue_wait_idle(&self, results: impl IntoIterator<Item = VkResult<()>>) {
        self.state.lock().wait_idle_script.extend(results);
    }

    pub fn set_adapters(&self, adapters: Vec<AdapterInfo>) {
        self.state.lock().adapters = adapters;
    }

    /// Device extensions every adapter supports.
    pub fn set_supported_extensions(&self, extensions: Vec<String>) {
        self.state.lock().supported_extensions = extensions;
    }

    /// Current surface size; zero in either dimension means minimised.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.lock().surface.capabilities.current_extent = vk::Extent2D { width, height };
    }

    /// Bounds for the swapchain image count.
    pub fn set_image_count_range(&self, min: u32, max: u32) {
        let mut state = self.state.lock();
        state.surface.capabilities.min_image_count = min;
        state.surface.capabilities.max_image_count = max;
    }

    /// Create a surface on the current instance.
    pub fn create_surface(&self) -> Result<vk::SurfaceKHR> {
        let mut state = self.state.lock();
        if state.should_fail("create_surface") {
            return Err(GpuError::SurfaceCreation("injected failure".to_string()));
        }
        if state.live.get(&ObjectKind::Instance).map_or(true, HashSet::is_empty) {
            return Err(GpuError::SurfaceCreation("no instance".to_string()));
        }
        Ok(vk::SurfaceKHR::from_raw(state.track(ObjectKind::Surface)))
    }

    /// Live objects of one kind.
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.get(&kind).map_or(0, HashSet::len)
    }

    /// Objects of one kind created so far, destroyed or not.
    pub fn created(&self, kind: ObjectKind) -> usize {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    /// Every kind with live objects.
    pub fn leaks(&self) -> Vec<(ObjectKind, usize)> {
        self.state
            .lock()
            .live
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(kind, set)| (*kind, set.len()))
            .collect()
    }

    pub fn check_no_leaks(&self) -> std::result::Result<(), TestError> {
        match self.leaks().into_iter().next() {
            None => Ok(()),
            Some((kind, count)) => Err(TestError::Leak { kind, count }),
        }
    }

    /// Attachment count of each frame buffer created so far.
    pub fn framebuffer_attachments(&self) -> Vec<usize> {
        self.state.lock().framebuffer_attachments.clone()
    }

    /// Layers passed to the last `create_instance`.
    pub fn instance_layers(&self) -> Vec<String> {
        self.state.lock().instance_layers.clone()
    }

    /// Extensions passed to the last `create_instance`.
    pub fn instance_extensions(&self) -> Vec<String> {
        self.state.lock().instance_extensions.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().submits
    }

    pub fn present_count(&self) -> usize {
        self.state.lock().presents
    }

    /// Whether `semaphore` holds a signal that no submit or present consumed.
    pub fn is_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state.lock().signaled.contains(&semaphore.as_raw())
    }

    /// Bytes held by images from every allocator this driver created.
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated_bytes
    }

    fn create(&self, op: &'static str, kind: ObjectKind) -> Result<u64> {
        let mut state = self.state.lock();
        if state.should_fail(op) {
            return Err(injected(op));
        }
        Ok(state.track(kind))
    }

    fn destroy(&self, kind: ObjectKind, raw: u64) {
        self.state.lock().untrack(kind, raw);
    }

    fn vk_check(&self, op: &'static str) -> VkResult<()> {
        if self.state.lock().should_fail(op) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(())
    }
}

impl Driver for MockDriver {
    type Allocator = MockAllocator;

    fn platform_instance_extensions(&self) -> Result<Vec<String>> {
        if self.state.lock().should_fail("platform_instance_extensions") {
            return Err(injected("platform_instance_extensions"));
        }
        Ok(vec!["VK_KHR_surface".to_string()])
    }

    fn create_instance(&mut self, desc: &InstanceDesc<'_>) -> Result<vk::Instance> {
        let raw = self.create("create_instance", ObjectKind::Instance)?;
        let mut state = self.state.lock();
        state.instance_layers = desc.layers.to_vec();
        state.instance_extensions = desc.extensions.to_vec();
        Ok(vk::Instance::from_raw(raw))
    }

    fn create_debug_messenger(&mut self) -> Result<vk::DebugUtilsMessengerEXT> {
        let raw = self.create("create_debug_messenger", ObjectKind::DebugMessenger)?;
        Ok(vk::DebugUtilsMessengerEXT::from_raw(raw))
    }

    fn destroy_debug_messenger(&mut self, messenger: vk::DebugUtilsMessengerEXT) {
        self.destroy(ObjectKind::DebugMessenger, messenger.as_raw());
    }

    fn destroy_instance(&mut self) {
        self.state.lock().untrack_all(ObjectKind::Instance);
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        let mut state = self.state.lock();
        if state.should_fail("surface_support") {
            return Err(injected("surface_support"));
        }
        Ok(state.surface.clone())
    }

    fn destroy_surface(&mut self, surface: vk::SurfaceKHR) {
        self.destroy(ObjectKind::Surface, surface.as_raw());
    }

    fn enumerate_adapters(
        &self,
        _surface: vk::SurfaceKHR,
        extensions: &[String],
    ) -> Result<Vec<AdapterInfo>> {
        let mut state = self.state.lock();
        if state.should_fail("enumerate_adapters") {
            return Err(injected("enumerate_adapters"));
        }
        let supported = state.supported_extensions.clone();
        Ok(state
            .adapters
            .iter()
            .cloned()
            .map(|mut adapter| {
                adapter.missing_extensions = extensions
                    .iter()
                    .filter(|e| !supported.contains(e))
                    .cloned()
                    .collect();
                adapter
            })
            .collect())
    }

    fn create_device(&mut self, _request: &DeviceRequest<'_>) -> Result<vk::Device> {
        let raw = self.create("create_device", ObjectKind::Device)?;
        Ok(vk::Device::from_raw(raw))
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x100 + u64::from(family) * 16 + u64::from(index))
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.vk_check("device_wait_idle")
    }

    fn destroy_device(&mut self) {
        self.state.lock().untrack_all(ObjectKind::Device);
    }

    fn create_allocator(&mut self) -> Result<MockAllocator> {
        if self.state.lock().should_fail("create_allocator") {
            return Err(injected("create_allocator"));
        }
        Ok(MockAllocator {
            state: Arc::clone(&self.state),
            allocated: 0,
        })
    }

    fn create_command_pool(&self, _queue_family: u32) -> Result<vk::CommandPool> {
        let raw = self.create("create_command_pool", ObjectKind::CommandPool)?;
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroy(ObjectKind::CommandPool, pool.as_raw());
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if state.should_fail("allocate_command_buffers") {
            return Err(injected("allocate_command_buffers"));
        }
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.track(ObjectKind::CommandBuffer)))
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for buffer in buffers {
            state.untrack(ObjectKind::CommandBuffer, buffer.as_raw());
        }
    }

    fn create_fence(&self, _signaled: bool) -> Result<vk::Fence> {
        let raw = self.create("create_fence", ObjectKind::Fence)?;
        Ok(vk::Fence::from_raw(raw))
    }

    fn wait_for_fence(&self, _fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        self.state.lock().fence_script.pop_front().unwrap_or(Ok(()))
    }

    fn reset_fence(&self, _fence: vk::Fence) -> VkResult<()> {
        self.vk_check("reset_fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.destroy(ObjectKind::Fence, fence.as_raw());
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let raw = self.create("create_semaphore", ObjectKind::Semaphore)?;
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().signaled.remove(&semaphore.as_raw());
        self.destroy(ObjectKind::Semaphore, semaphore.as_raw());
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        template: &SubmitTemplate,
        command_buffer: vk::CommandBuffer,
        _fence: vk::Fence,
    ) -> VkResult<()> {
        self.vk_check("queue_submit")?;
        let mut state = self.state.lock();
        let known = |kind: ObjectKind, raw: u64| state.live.get(&kind).is_some_and(|set| set.contains(&raw));
        if !known(ObjectKind::CommandBuffer, command_buffer.as_raw())
            || !known(ObjectKind::Semaphore, template.wait_semaphores[0].as_raw())
            || !known(ObjectKind::Semaphore, template.signal_semaphores[0].as_raw())
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.signaled.remove(&template.wait_semaphores[0].as_raw());
        state.signaled.insert(template.signal_semaphores[0].as_raw());
        state.submits += 1;
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.state.lock().wait_idle_script.pop_front().unwrap_or(Ok(()))
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        if state.should_fail("create_swapchain") {
            return Err(GpuError::SwapchainCreation("injected failure".to_string()));
        }
        let raw = state.track(ObjectKind::Swapchain);
        state.swapchain_images.insert(raw, desc.min_image_count);
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let mut state = self.state.lock();
        if state.should_fail("swapchain_images") {
            return Err(injected("swapchain_images"));
        }
        let count = state
            .swapchain_images
            .get(&swapchain.as_raw())
            .copied()
            .unwrap_or(0);
        Ok((0..count)
            .map(|i| vk::Image::from_raw(swapchain.as_raw() * 64 + u64::from(i)))
            .collect())
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchain_images.remove(&swapchain.as_raw());
        state.untrack(ObjectKind::Swapchain, swapchain.as_raw());
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        let raw = semaphore.as_raw();
        // A binary semaphore must have no pending signal when handed to acquire
        if raw != 0 && state.signaled.contains(&raw) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let result = match state.acquire_script.pop_front() {
            Some(result) => result,
            None => {
                let count = state
                    .swapchain_images
                    .get(&swapchain.as_raw())
                    .copied()
                    .unwrap_or(0);
                if count == 0 {
                    return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
                }
                let index = state.next_image % count;
                state.next_image = index + 1;
                Ok((index, false))
            }
        };
        if result.is_ok() && raw != 0 {
            state.signaled.insert(raw);
        }
        result
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        _image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.signaled.remove(&wait_semaphore.as_raw());
        let result = state.present_script.pop_front().unwrap_or(Ok(false));
        if result.is_ok() {
            state.presents += 1;
        }
        result
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let raw = self.create("create_image_view", ObjectKind::ImageView)?;
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy(ObjectKind::ImageView, view.as_raw());
    }

    fn create_render_pass(&self, _layout: &RenderPassLayout) -> Result<vk::RenderPass> {
        let raw = self.create("create_render_pass", ObjectKind::RenderPass)?;
        Ok(vk::RenderPass::from_raw(raw))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.destroy(ObjectKind::RenderPass, render_pass.as_raw());
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let raw = self.create("create_framebuffer", ObjectKind::Framebuffer)?;
        self.state
            .lock()
            .framebuffer_attachments
            .push(attachments.len());
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.destroy(ObjectKind::Framebuffer, framebuffer.as_raw());
    }

    fn create_pipeline_cache(&self) -> Result<vk::PipelineCache> {
        let raw = self.create("create_pipeline_cache", ObjectKind::PipelineCache)?;
        Ok(vk::PipelineCache::from_raw(raw))
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.destroy(ObjectKind::PipelineCache, cache.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let raw = self.create("create_descriptor_pool", ObjectKind::DescriptorPool)?;
        self.state.lock().pools.insert(
            raw,
            PoolState {
                capacity: max_sets,
                sets: HashSet::new(),
            },
        );
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if let Some(pool_state) = state.pools.remove(&pool.as_raw()) {
            for set in pool_state.sets {
                state.untrack(ObjectKind::DescriptorSet, set);
            }
        }
        state.untrack(ObjectKind::DescriptorPool, pool.as_raw());
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        if state.should_fail("allocate_descriptor_set") {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let full = state
            .pools
            .get(&pool.as_raw())
            .map(|p| p.sets.len() >= p.capacity as usize)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if full {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let raw = state.track(ObjectKind::DescriptorSet);
        if let Some(p) = state.pools.get_mut(&pool.as_raw()) {
            p.sets.insert(raw);
        }
        Ok(vk::DescriptorSet::from_raw(raw))
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state
            .pools
            .get_mut(&pool.as_raw())
            .is_some_and(|p| p.sets.remove(&set.as_raw()));
        if !removed {
            return Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        state.untrack(ObjectKind::DescriptorSet, set.as_raw());
        Ok(())
    }
}

/// Allocator created by [`MockDriver::create_allocator`].
///
/// Images have no backing allocation; their size is four bytes per sample.
#[derive(Debug)]
pub struct MockAllocator {
    state: Arc<Mutex<State>>,
    allocated: u64,
}

impl ImageAllocator for MockAllocator {
    fn allocate_image(
        &mut self,
        create_info: &vk::ImageCreateInfo<'_>,
        name: &str,
    ) -> Result<GpuImage> {
        let mut state = self.state.lock();
        if state.should_fail("allocate_image") {
            return Err(GpuError::AllocationFailed(format!("injected failure for {name}")));
        }
        let raw = state.track(ObjectKind::Image);
        let extent = create_info.extent;
        let size = u64::from(extent.width)
            * u64::from(extent.height)
            * u64::from(create_info.samples.as_raw())
            * 4;
        self.allocated += size;
        state.allocated_bytes += size;

        Ok(GpuImage {
            image: vk::Image::from_raw(raw),
            allocation: None,
            format: create_info.format,
            extent,
            size,
        })
    }

    /// Fails through `fail_next("free_image")`; the image is still released.
    fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        let mut state = self.state.lock();
        if image.is_valid() {
            state.untrack(ObjectKind::Image, image.image.as_raw());
            state.allocated_bytes = state.allocated_bytes.saturating_sub(image.size);
            self.allocated = self.allocated.saturating_sub(image.size);
        }
        image.image = vk::Image::null();
        if state.should_fail("free_image") {
            return Err(GpuError::AllocationFailed("injected failure for free_image".to_string()));
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated
    }
}
