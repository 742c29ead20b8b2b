//! Vulkan rendering kernel.
//!
//! This crate provides:
//! - Staged kernel bring-up (`pre_init`, `init`, `post_init`) and teardown
//! - The per-frame acquire/submit/present loop and window resize handling
//! - Adapter selection and logical device creation
//! - Descriptor pools grouped by descriptor type set
//! - Multisampled colour and depth attachments
//! - An `ash` implementation of the [`Driver`] boundary

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptor_manager;
pub mod descriptors;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod instance;
pub mod kernel;
pub mod memory;
pub mod multisample;
pub mod render_pass;
pub mod resize;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{
    select_adapter, AdapterComparator, AdapterInfo, AdapterLimits, FamilyIndices, GpuVendor,
    PreferDiscrete,
};
pub use context::VulkanDriver;
pub use descriptor_manager::DescriptorManager;
pub use descriptors::{DescriptorPool, DescriptorSet, DescriptorTypes, PoolPolicy};
pub use device::{Device, FamilyQueues};
pub use driver::{DeviceRequest, Driver, InstanceDesc, SurfaceFactory, SurfaceSupport, SwapchainDesc};
pub use error::{GpuError, Result, Stage};
pub use frame::FrameResult;
pub use kernel::{
    InitInfo, KernelBuilder, KernelConfig, KernelHooks, KernelState, NoHooks, PreInitInfo,
    VulkanKernel,
};
pub use memory::{GpuAllocator, GpuImage, ImageAllocator};
pub use multisample::{Attachment, MultisampleTarget};
pub use render_pass::{RenderPass, RenderPassLayout};
pub use resize::ResizeHandle;
pub use surface::WindowSurface;
pub use swapchain::Swapchain;
pub use sync::{SubmitTemplate, SynchronizationSet};
