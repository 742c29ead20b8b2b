//! Main render pass description.

use crate::driver::Driver;
use crate::error::Result;
use ash::vk;
use vkern_core::KernelObject;

/// Attachments and references of the single-subpass main render pass.
///
/// With multisampling the pass has three attachments: multisampled colour,
/// the swapchain image it resolves into, and multisampled depth. Without it
/// there are two: the swapchain image and depth.
#[derive(Debug, Clone)]
pub struct RenderPassLayout {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub color: vk::AttachmentReference,
    pub depth: vk::AttachmentReference,
    pub resolve: Option<vk::AttachmentReference>,
    pub dependency: vk::SubpassDependency,
}

impl RenderPassLayout {
    pub fn new(
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Self {
        let multisampled = samples != vk::SampleCountFlags::TYPE_1;

        let present = vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(if multisampled {
                vk::AttachmentLoadOp::DONT_CARE
            } else {
                vk::AttachmentLoadOp::CLEAR
            })
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let depth = vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        if multisampled {
            let color = vk::AttachmentDescription::default()
                .format(color_format)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

            Self {
                attachments: vec![color, present, depth],
                color: attachment_ref(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                resolve: Some(attachment_ref(1, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)),
                depth: attachment_ref(2, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
                dependency,
            }
        } else {
            Self {
                attachments: vec![present, depth],
                color: attachment_ref(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                resolve: None,
                depth: attachment_ref(1, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
                dependency,
            }
        }
    }
}

fn attachment_ref(attachment: u32, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference::default()
        .attachment(attachment)
        .layout(layout)
}

/// Render pass handle and the number of attachments frame buffers must supply.
#[derive(Debug, Default)]
pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub attachment_count: usize,
}

impl RenderPass {
    pub fn create<D: Driver>(driver: &D, layout: &RenderPassLayout) -> Result<Self> {
        Ok(Self {
            handle: driver.create_render_pass(layout)?,
            attachment_count: layout.attachments.len(),
        })
    }

    pub fn destroy<D: Driver>(&mut self, driver: &D) {
        if self.handle != vk::RenderPass::null() {
            driver.destroy_render_pass(self.handle);
            self.handle = vk::RenderPass::null();
        }
    }
}

impl KernelObject for RenderPass {
    fn is_ready(&self) -> bool {
        self.handle != vk::RenderPass::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multisampled_layout_resolves_into_swapchain_image() {
        let layout = RenderPassLayout::new(
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::SampleCountFlags::TYPE_4,
        );

        assert_eq!(layout.attachments.len(), 3);
        assert_eq!(layout.attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(layout.attachments[1].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(
            layout.attachments[1].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(layout.attachments[2].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(layout.resolve.map(|r| r.attachment), Some(1));
        assert_eq!(layout.depth.attachment, 2);
    }

    #[test]
    fn single_sample_layout_has_two_attachments() {
        let layout = RenderPassLayout::new(
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D24_UNORM_S8_UINT,
            vk::SampleCountFlags::TYPE_1,
        );

        assert_eq!(layout.attachments.len(), 2);
        assert_eq!(layout.attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert!(layout.resolve.is_none());
        assert_eq!(layout.depth.attachment, 1);
    }
}
