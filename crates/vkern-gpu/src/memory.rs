//! GPU memory management.
//!
//! The kernel never touches device memory directly: it asks an
//! [`ImageAllocator`] for images and hands them back when done.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Opaque image allocation service.
pub trait ImageAllocator {
    /// Create an image and back it with device-local memory.
    fn allocate_image(&mut self, create_info: &vk::ImageCreateInfo<'_>, name: &str)
        -> Result<GpuImage>;

    /// Release an image and its memory. Freeing an already-freed image is a no-op.
    fn free_image(&mut self, image: &mut GpuImage) -> Result<()>;

    /// Bytes currently allocated through this allocator.
    fn allocated_bytes(&self) -> u64;
}

/// A GPU image with its allocation.
#[derive(Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    /// Size of the backing memory in bytes.
    pub size: u64,
}

impl GpuImage {
    /// The image handle has not been released.
    pub fn is_valid(&self) -> bool {
        self.image != vk::Image::null()
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    allocated: u64,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            allocated: 0,
        })
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        // The gpu_allocator::Allocator::Drop will call vkFreeMemory
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
        self.allocated = 0;
    }
}

impl ImageAllocator for GpuAllocator {
    fn allocate_image(
        &mut self,
        create_info: &vk::ImageCreateInfo<'_>,
        name: &str,
    ) -> Result<GpuImage> {
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;

        let image = unsafe {
            self.device
                .create_image(create_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            return Err(match allocator.free(allocation) {
                Ok(()) => GpuError::from(e),
                Err(free) => GpuError::AllocationFailed(format!(
                    "failed to bind image memory ({e}), then failed to free it ({free})"
                )),
            });
        }

        let size = allocation.size();
        self.allocated += size;

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
            size,
        })
    }

    fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
            self.allocated = self.allocated.saturating_sub(image.size);
        }

        if image.is_valid() {
            unsafe {
                self.device.destroy_image(image.image, None);
            }
        }
        image.image = vk::Image::null();

        Ok(())
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        // Shutdown if not already done
        self.shutdown();
    }
}
