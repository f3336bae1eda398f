// Forward render pass
//
// One color attachment (cleared on load, stored, presented at the end of the
// pass), a single subpass, and one framebuffer per swap-chain image.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{DeviceContext, Swapchain};

pub struct RenderPass {
    pub render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    device: Arc<DeviceContext>,
}

impl RenderPass {
    pub fn new(device: Arc<DeviceContext>, swapchain: &Swapchain) -> Result<Self> {
        let render_pass = Self::create_forward_pass(&device, swapchain.format.format)?;
        let framebuffers = Self::create_framebuffers(
            &device,
            render_pass,
            &swapchain.image_views,
            swapchain.extent,
        )?;

        log::info!(
            "Created render pass with {} framebuffers",
            framebuffers.len()
        );

        Ok(Self {
            render_pass,
            framebuffers,
            device,
        })
    }

    fn create_forward_pass(
        device: &DeviceContext,
        color_format: vk::Format,
    ) -> Result<vk::RenderPass> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachments = [color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachments)
            .build();

        // Order the color write after the previous frame's color output
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build();

        let attachments = [color_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")
    }

    fn create_framebuffers(
        device: &DeviceContext,
        render_pass: vk::RenderPass,
        image_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Vec<vk::Framebuffer>> {
        image_views
            .iter()
            .map(|&view| {
                let attachments = [view];
                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);

                unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
                    .context("Failed to create framebuffer")
            })
            .collect()
    }

    /// Begin the pass against the framebuffer paired with `image_index`.
    pub fn begin(
        &self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) -> Result<()> {
        let framebuffer = *self
            .framebuffers
            .get(image_index as usize)
            .context("Image index out of framebuffer range")?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device.device.cmd_begin_render_pass(
                command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        Ok(())
    }

    pub fn end(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.device.cmd_end_render_pass(command_buffer) };
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}
