//! Adapter capability description and device selection.

use ash::vk;
use vkern_core::LogSink;

use crate::error::{GpuError, Result};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Queue family indices found on an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl FamilyIndices {
    /// Both graphics and present families were found.
    pub const fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Limits relevant to the kernel's attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterLimits {
    pub framebuffer_color_sample_counts: vk::SampleCountFlags,
    pub framebuffer_depth_sample_counts: vk::SampleCountFlags,
    pub max_image_dimension_2d: u32,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        Self {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1,
            max_image_dimension_2d: 4096,
        }
    }
}

impl AdapterLimits {
    /// Highest sample count usable for both colour and depth attachments.
    pub fn max_usable_sample_count(&self) -> vk::SampleCountFlags {
        let counts = self.framebuffer_color_sample_counts & self.framebuffer_depth_sample_counts;
        [
            vk::SampleCountFlags::TYPE_64,
            vk::SampleCountFlags::TYPE_32,
            vk::SampleCountFlags::TYPE_16,
            vk::SampleCountFlags::TYPE_8,
            vk::SampleCountFlags::TYPE_4,
            vk::SampleCountFlags::TYPE_2,
        ]
        .into_iter()
        .find(|&c| counts.contains(c))
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
    }

    /// `samples` is supported for both colour and depth attachments.
    pub fn supports_samples(&self, samples: vk::SampleCountFlags) -> bool {
        self.framebuffer_color_sample_counts.contains(samples)
            && self.framebuffer_depth_sample_counts.contains(samples)
    }
}

/// Everything the kernel needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub vendor: GpuVendor,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub limits: AdapterLimits,
    /// Property flags of each memory type, indexed by memory type index.
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    pub queue_families: FamilyIndices,
    /// Depth/stencil formats usable as optimal-tiling attachments.
    pub depth_formats: Vec<vk::Format>,
    /// Requested device extensions this adapter lacks.
    pub missing_extensions: Vec<String>,
    /// The surface can be presented to from this adapter.
    pub supports_present: bool,
    pub supports_sample_shading: bool,
}

impl AdapterInfo {
    /// Supports the requested extensions and presentation on the surface.
    pub fn is_suitable(&self) -> bool {
        self.missing_extensions.is_empty() && self.supports_present
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Pairwise "is better than" policy used while scanning adapters.
pub trait AdapterComparator: Send {
    /// `candidate` should replace `current` as the best adapter so far.
    fn is_better(&self, candidate: &AdapterInfo, current: &AdapterInfo) -> bool;
}

impl<F> AdapterComparator for F
where
    F: Fn(&AdapterInfo, &AdapterInfo) -> bool + Send,
{
    fn is_better(&self, candidate: &AdapterInfo, current: &AdapterInfo) -> bool {
        self(candidate, current)
    }
}

/// Discrete GPUs first, then more VRAM, then larger image limits, then MSAA.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferDiscrete;

impl PreferDiscrete {
    const fn type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
        match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        }
    }

    fn key(adapter: &AdapterInfo) -> (u32, u64, u32, u32) {
        (
            Self::type_rank(adapter.device_type),
            adapter.device_local_memory_mb / 1024,
            adapter.limits.max_image_dimension_2d,
            adapter.limits.max_usable_sample_count().as_raw(),
        )
    }
}

impl AdapterComparator for PreferDiscrete {
    fn is_better(&self, candidate: &AdapterInfo, current: &AdapterInfo) -> bool {
        Self::key(candidate) > Self::key(current)
    }
}

/// Pick the best suitable adapter.
///
/// Every adapter is logged; unsuitable ones are reported on the warn channel.
/// With no suitable adapter the error carries the requested extension list.
pub fn select_adapter<'a>(
    adapters: &'a [AdapterInfo],
    extensions: &[String],
    comparator: &dyn AdapterComparator,
    log: &dyn LogSink,
) -> Result<&'a AdapterInfo> {
    if adapters.is_empty() {
        log.error("select_adapter: no device with Vulkan support found");
        return Err(GpuError::NoSuitableDevice {
            extensions: extensions.to_vec(),
        });
    }

    for adapter in adapters {
        log.log(&format!("select_adapter: found device - {}", adapter.summary()));
    }

    let mut best: Option<&AdapterInfo> = None;
    for adapter in adapters {
        if !adapter.is_suitable() {
            log.warn(&format!(
                "select_adapter: device \"{}\" isn't suitable (missing: {:?}, present: {})",
                adapter.name, adapter.missing_extensions, adapter.supports_present
            ));
            continue;
        }

        best = match best {
            Some(current) if !comparator.is_better(adapter, current) => Some(current),
            _ => Some(adapter),
        };
    }

    match best {
        Some(adapter) => {
            log.log(&format!("select_adapter: select \"{}\" device", adapter.name));
            Ok(adapter)
        }
        None => {
            let list: String = extensions.iter().map(|e| format!("\n\t{e}")).collect();
            log.error(&format!(
                "select_adapter: not found suitable device! Extensions:{list}"
            ));
            Err(GpuError::NoSuitableDevice {
                extensions: extensions.to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use vkern_core::{CaptureSink, LogChannel};

    fn adapter(raw: u64, device_type: vk::PhysicalDeviceType, vram_mb: u64) -> AdapterInfo {
        AdapterInfo {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: format!("gpu-{raw}"),
            vendor: GpuVendor::Other(0),
            device_type,
            api_version: vk::API_VERSION_1_2,
            device_local_memory_mb: vram_mb,
            limits: AdapterLimits::default(),
            memory_types: Vec::new(),
            queue_families: FamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            depth_formats: vec![vk::Format::D32_SFLOAT_S8_UINT],
            missing_extensions: Vec::new(),
            supports_present: true,
            supports_sample_shading: true,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn discrete_beats_integrated() {
        let adapters = [
            adapter(1, vk::PhysicalDeviceType::INTEGRATED_GPU, 16_384),
            adapter(2, vk::PhysicalDeviceType::DISCRETE_GPU, 4096),
            adapter(3, vk::PhysicalDeviceType::CPU, 0),
        ];
        let sink = CaptureSink::default();
        let best = select_adapter(&adapters, &[], &PreferDiscrete, &sink).unwrap();
        assert_eq!(best.handle.as_raw(), 2);
    }

    #[test]
    fn unsuitable_adapters_are_skipped_and_warned() {
        let mut lacking = adapter(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        lacking.missing_extensions = vec!["VK_KHR_swapchain".to_string()];
        let adapters = [lacking, adapter(2, vk::PhysicalDeviceType::INTEGRATED_GPU, 1024)];

        let sink = CaptureSink::default();
        let best = select_adapter(&adapters, &[], &PreferDiscrete, &sink).unwrap();
        assert_eq!(best.handle.as_raw(), 2);
        assert_eq!(sink.messages(LogChannel::Warn).len(), 1);
    }

    #[test]
    fn no_suitable_adapter_reports_extensions() {
        let mut headless = adapter(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        headless.supports_present = false;

        let sink = CaptureSink::default();
        let requested = vec!["VK_KHR_swapchain".to_string()];
        let err = select_adapter(&[headless], &requested, &PreferDiscrete, &sink).unwrap_err();

        match err {
            GpuError::NoSuitableDevice { extensions } => assert_eq!(extensions, requested),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sink.count_containing("VK_KHR_swapchain"), 1);
    }

    #[test]
    fn closure_comparator_breaks_ties() {
        let adapters = [
            adapter(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            adapter(2, vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
        ];
        let prefer_last = |_: &AdapterInfo, _: &AdapterInfo| true;
        let sink = CaptureSink::default();
        let best = select_adapter(&adapters, &[], &prefer_last, &sink).unwrap();
        assert_eq!(best.handle.as_raw(), 2);
    }

    #[test]
    fn usable_sample_count_is_common_maximum() {
        let limits = AdapterLimits {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_4,
            max_image_dimension_2d: 16_384,
        };
        assert_eq!(limits.max_usable_sample_count(), vk::SampleCountFlags::TYPE_4);
        assert!(limits.supports_samples(vk::SampleCountFlags::TYPE_4));
        assert!(!limits.supports_samples(vk::SampleCountFlags::TYPE_8));
    }
}
