//! Logical device description.

use ash::vk;
use vkern_core::KernelObject;

use crate::capabilities::{AdapterInfo, AdapterLimits, FamilyIndices, GpuVendor};
use crate::error::{GpuError, Result};

/// Resolved queue families and the graphics queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyQueues {
    pub graphics_family: u32,
    pub present_family: u32,
    pub graphics_queue: vk::Queue,
}

impl FamilyQueues {
    /// Resolve indices found on an adapter.
    ///
    /// The queue handle is filled in once the logical device exists.
    pub fn from_indices(indices: FamilyIndices) -> Result<Self> {
        match (indices.graphics, indices.present) {
            (Some(graphics_family), Some(present_family)) => Ok(Self {
                graphics_family,
                present_family,
                graphics_queue: vk::Queue::null(),
            }),
            _ => Err(GpuError::IncompleteQueueFamilies),
        }
    }

    /// Unique family indices, graphics first.
    pub fn unique_families(&self) -> Vec<u32> {
        if self.graphics_family == self.present_family {
            vec![self.graphics_family]
        } else {
            vec![self.graphics_family, self.present_family]
        }
    }
}

impl KernelObject for FamilyQueues {
    fn is_ready(&self) -> bool {
        self.graphics_queue != vk::Queue::null()
    }
}

/// Physical + logical device pair and the properties cached from the adapter.
#[derive(Debug, Clone)]
pub struct Device {
    pub physical: vk::PhysicalDevice,
    pub logical: vk::Device,
    pub name: String,
    pub vendor: GpuVendor,
    pub device_type: vk::PhysicalDeviceType,
    pub limits: AdapterLimits,
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    pub depth_formats: Vec<vk::Format>,
    pub queues: FamilyQueues,
    /// Effective MSAA sample count (requested, clamped to adapter support).
    pub sample_count: vk::SampleCountFlags,
    pub sample_shading: bool,
}

impl Device {
    /// Assemble a device from the selected adapter.
    pub fn new(
        adapter: &AdapterInfo,
        logical: vk::Device,
        queues: FamilyQueues,
        requested_samples: u32,
        sample_shading: bool,
    ) -> Self {
        Self {
            physical: adapter.handle,
            logical,
            name: adapter.name.clone(),
            vendor: adapter.vendor,
            device_type: adapter.device_type,
            limits: adapter.limits,
            memory_types: adapter.memory_types.clone(),
            depth_formats: adapter.depth_formats.clone(),
            queues,
            sample_count: clamp_sample_count(requested_samples, &adapter.limits),
            sample_shading: sample_shading && adapter.supports_sample_shading,
        }
    }

    /// More than one sample per pixel.
    pub fn multisample_enabled(&self) -> bool {
        self.sample_count != vk::SampleCountFlags::TYPE_1
    }

    /// Graphics queue handle.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.queues.graphics_queue
    }

    /// First memory type allowed by `type_bits` that has all `properties`.
    pub fn memory_type_index(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .take(32)
            .find(|(i, flags)| type_bits & (1u32 << *i) != 0 && flags.contains(properties))
            .and_then(|(i, _)| u32::try_from(i).ok())
    }
}

impl KernelObject for Device {
    fn is_ready(&self) -> bool {
        self.logical != vk::Device::null()
            && self.physical != vk::PhysicalDevice::null()
            && self.queues.is_ready()
    }
}

/// Convert a sample count to flags, clamped to what both attachment kinds support.
pub fn clamp_sample_count(requested: u32, limits: &AdapterLimits) -> vk::SampleCountFlags {
    let max = limits.max_usable_sample_count();
    let requested = match requested {
        0 | 1 => return vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        3 | 4 => vk::SampleCountFlags::TYPE_4,
        5..=8 => vk::SampleCountFlags::TYPE_8,
        9..=16 => vk::SampleCountFlags::TYPE_16,
        17..=32 => vk::SampleCountFlags::TYPE_32,
        _ => vk::SampleCountFlags::TYPE_64,
    };
    if requested.as_raw() > max.as_raw() {
        max
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with_memory(memory_types: Vec<vk::MemoryPropertyFlags>) -> Device {
        Device {
            physical: vk::PhysicalDevice::null(),
            logical: vk::Device::null(),
            name: "test".to_string(),
            vendor: GpuVendor::Other(0),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            limits: AdapterLimits::default(),
            memory_types,
            depth_formats: Vec::new(),
            queues: FamilyQueues {
                graphics_family: 0,
                present_family: 0,
                graphics_queue: vk::Queue::null(),
            },
            sample_count: vk::SampleCountFlags::TYPE_1,
            sample_shading: false,
        }
    }

    #[test]
    fn memory_type_respects_type_bits() {
        let device = device_with_memory(vec![
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        assert_eq!(
            device.memory_type_index(0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            device.memory_type_index(0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(2)
        );
        assert_eq!(
            device.memory_type_index(0b001, vk::MemoryPropertyFlags::HOST_COHERENT),
            None
        );
    }

    #[test]
    fn sample_count_is_clamped_to_adapter() {
        let limits = AdapterLimits {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4,
            max_image_dimension_2d: 8192,
        };
        assert_eq!(clamp_sample_count(8, &limits), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_sample_count(2, &limits), vk::SampleCountFlags::TYPE_2);
        assert_eq!(clamp_sample_count(1, &limits), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn incomplete_indices_are_rejected() {
        let indices = FamilyIndices {
            graphics: Some(0),
            present: None,
        };
        assert!(matches!(
            FamilyQueues::from_indices(indices),
            Err(GpuError::IncompleteQueueFamilies)
        ));
    }

    #[test]
    fn unique_families_dedupes() {
        let queues = FamilyQueues::from_indices(FamilyIndices {
            graphics: Some(1),
            present: Some(1),
        })
        .unwrap();
        assert_eq!(queues.unique_families(), vec![1]);
    }
}
