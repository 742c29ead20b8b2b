//! Off-screen colour and depth attachments sized to the surface.

use std::sync::Arc;

use ash::vk;
use vkern_core::{KernelObject, LogSink};

use crate::capabilities::AdapterLimits;
use crate::device::Device;
use crate::driver::Driver;
use crate::error::{GpuError, Result};
use crate::memory::{GpuImage, ImageAllocator};

/// An allocated image and its view.
#[derive(Debug, Default)]
pub struct Attachment {
    pub image: Option<GpuImage>,
    pub view: vk::ImageView,
}

impl Attachment {
    pub fn is_valid(&self) -> bool {
        self.view != vk::ImageView::null() && self.image.as_ref().is_some_and(GpuImage::is_valid)
    }

    fn release<D: Driver, A: ImageAllocator>(&mut self, driver: &D, allocator: &mut A) -> Result<()> {
        if self.view != vk::ImageView::null() {
            driver.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        if let Some(mut image) = self.image.take() {
            allocator.free_image(&mut image)?;
        }
        Ok(())
    }
}

/// One depth attachment plus one colour attachment per requested format.
///
/// Rebuilt from scratch on every resize. The number of colour attachments
/// is fixed at creation.
pub struct MultisampleTarget {
    resolves: Vec<Attachment>,
    depth: Attachment,
    formats: Vec<vk::Format>,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
    limits: AdapterLimits,
    multisampling: bool,
    extent: vk::Extent2D,
    log: Arc<dyn LogSink>,
}

impl MultisampleTarget {
    /// Create the target and its images at `width` x `height`.
    ///
    /// On failure the partially built target is destroyed before returning.
    #[allow(clippy::too_many_arguments)]
    pub fn create<D: Driver, A: ImageAllocator>(
        driver: &D,
        allocator: &mut A,
        device: &Device,
        depth_format: vk::Format,
        width: u32,
        height: u32,
        formats: &[vk::Format],
        multisampling: bool,
        log: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let mut target = Self {
            resolves: formats.iter().map(|_| Attachment::default()).collect(),
            depth: Attachment::default(),
            formats: formats.to_vec(),
            depth_format,
            samples: device.sample_count,
            limits: device.limits,
            multisampling,
            extent: vk::Extent2D::default(),
            log,
        };

        if let Err(e) = target.recreate(driver, allocator, width, height) {
            target.log.error(&format!(
                "MultisampleTarget::create: failed to re-create multisample! Reason: {e}"
            ));
            if let Err(cleanup) = target.destroy(driver, allocator) {
                target.log.error(&format!(
                    "MultisampleTarget::create: failed to release partial multisample! Reason: {cleanup}"
                ));
            }
            return Err(e);
        }

        Ok(target)
    }

    /// Destroy the current images and build new ones at `width` x `height`.
    ///
    /// A failure part way through leaves whatever was created for the next
    /// [`MultisampleTarget::destroy`].
    pub fn recreate<D: Driver, A: ImageAllocator>(
        &mut self,
        driver: &D,
        allocator: &mut A,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.destroy(driver, allocator)?;

        if !self.limits.supports_samples(self.samples) {
            self.log.error(&format!(
                "MultisampleTarget::recreate: {:?} samples are unsupported",
                self.samples
            ));
            return Err(GpuError::UnsupportedSampleCount(self.samples));
        }

        let samples = if self.multisampling {
            self.samples
        } else {
            vk::SampleCountFlags::TYPE_1
        };

        for (i, (slot, &format)) in self.resolves.iter_mut().zip(&self.formats).enumerate() {
            let info = image_info(
                format,
                width,
                height,
                samples,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            );
            let image = allocator.allocate_image(&info, &format!("multisample-resolve-{i}"))?;
            let handle = image.image;
            slot.image = Some(image);
            slot.view = driver.create_image_view(handle, format, vk::ImageAspectFlags::COLOR)?;
        }

        let info = image_info(
            self.depth_format,
            width,
            height,
            samples,
            vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );
        let image = allocator.allocate_image(&info, "multisample-depth")?;
        let handle = image.image;
        self.depth.image = Some(image);
        self.depth.view = driver.create_image_view(
            handle,
            self.depth_format,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        )?;

        self.extent = vk::Extent2D { width, height };
        Ok(())
    }

    /// Release every view and image. Safe to call repeatedly.
    ///
    /// Every attachment is released even if one fails; the first failure
    /// is returned and the others are logged.
    pub fn destroy<D: Driver, A: ImageAllocator>(
        &mut self,
        driver: &D,
        allocator: &mut A,
    ) -> Result<()> {
        let mut first = None;
        for attachment in self.resolves.iter_mut().chain(std::iter::once(&mut self.depth)) {
            if let Err(e) = attachment.release(driver, allocator) {
                if first.is_some() {
                    self.log.error(&format!(
                        "MultisampleTarget::destroy: failed to free image! Reason: {e}"
                    ));
                } else {
                    first = Some(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn resolves(&self) -> &[Attachment] {
        &self.resolves
    }

    pub fn depth(&self) -> &Attachment {
        &self.depth
    }

    /// View of the `index`th colour attachment, null if it does not exist.
    pub fn resolve_view(&self, index: usize) -> vk::ImageView {
        self.resolves
            .get(index)
            .map_or(vk::ImageView::null(), |a| a.view)
    }

    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.view
    }

    /// Size of the last successful build.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn multisampling(&self) -> bool {
        self.multisampling
    }
}

impl std::fmt::Debug for MultisampleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultisampleTarget")
            .field("resolves", &self.resolves)
            .field("depth", &self.depth)
            .field("samples", &self.samples)
            .field("multisampling", &self.multisampling)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl KernelObject for MultisampleTarget {
    fn is_ready(&self) -> bool {
        self.depth.is_valid() && self.resolves.iter().all(Attachment::is_valid)
    }
}

fn image_info(
    format: vk::Format,
    width: u32,
    height: u32,
    samples: vk::SampleCountFlags,
    usage: vk::ImageUsageFlags,
) -> vk::ImageCreateInfo<'static> {
    vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_info_is_single_layer_2d() {
        let info = image_info(
            vk::Format::D24_UNORM_S8_UINT,
            640,
            480,
            vk::SampleCountFlags::TYPE_4,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );
        assert_eq!(info.image_type, vk::ImageType::TYPE_2D);
        assert_eq!(info.extent.width, 640);
        assert_eq!(info.extent.height, 480);
        assert_eq!(info.extent.depth, 1);
        assert_eq!(info.samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(info.mip_levels, 1);
    }

    #[test]
    fn empty_attachment_is_not_valid() {
        assert!(!Attachment::default().is_valid());
    }
}
