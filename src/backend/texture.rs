// Sampled textures
//
// A texture is an image allocation plus a view and a sampler. Pixel data is
// staged through a host-visible buffer; the copy is bracketed by two layout
// transitions, each expressed as a pipeline barrier with the access/stage
// masks matching that transition. Transition pairs outside the table are a
// programming error and are reported before any command is recorded.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::error::UnsupportedTransition;

use super::buffer::{find_memory_type, Buffer};
use super::command::CommandManager;
use super::DeviceContext;

pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    memory: vk::DeviceMemory,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    device: Arc<DeviceContext>,
}

impl Texture {
    /// Upload tightly packed RGBA8 pixels into a device-local sampled image.
    pub fn from_rgba8(
        device: &Arc<DeviceContext>,
        commands: &mut CommandManager,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        anyhow::ensure!(
            pixels.len() == expected,
            "Pixel data is {} bytes, expected {} for {}x{} RGBA8",
            pixels.len(),
            expected,
            width,
            height
        );

        let format = vk::Format::R8G8B8A8_SRGB;
        let extent = vk::Extent2D { width, height };

        // Resolve both transitions up front; an unsupported pair must fail
        // before any GPU work is issued
        let to_transfer = Transition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        let to_shader = Transition::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let staging = Buffer::new(
            device.clone(),
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.upload_bytes(pixels, 0)?;

        let (image, memory) = create_image(
            device,
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        device.execute(commands, |cmd| {
            to_transfer.record(device, cmd, image);

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();

            unsafe {
                device.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            to_shader.record(device, cmd, image);
        })?;

        let view = create_view(device, image, format)?;
        let sampler = create_sampler(device)?;

        log::debug!("Uploaded {}x{} texture", width, height);

        Ok(Self {
            image,
            view,
            sampler,
            memory,
            extent,
            format,
            device: device.clone(),
        })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Access and stage masks for a supported layout transition pair.
pub fn transition_masks(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Result<
    (
        vk::AccessFlags,
        vk::AccessFlags,
        vk::PipelineStageFlags,
        vk::PipelineStageFlags,
    ),
    UnsupportedTransition,
> {
    match (from, to) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok((
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        )),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok((
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ))
        }
        _ => Err(UnsupportedTransition { from, to }),
    }
}

/// A validated layout transition, ready to record as a pipeline barrier.
#[derive(Debug, Clone, Copy)]
struct Transition {
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
}

impl Transition {
    fn new(from: vk::ImageLayout, to: vk::ImageLayout) -> Result<Self, UnsupportedTransition> {
        let (src_access, dst_access, src_stage, dst_stage) = transition_masks(from, to)?;
        Ok(Self {
            from,
            to,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        })
    }

    fn record(&self, device: &DeviceContext, cmd: vk::CommandBuffer, image: vk::Image) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.from)
            .new_layout(self.to)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                self.src_stage,
                self.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

fn create_image(
    device: &DeviceContext,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<(vk::Image, vk::DeviceMemory)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .context("Failed to create image")?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };
    let memory_type_index = find_memory_type(
        device,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
        .context("Failed to allocate image memory")?;

    unsafe { device.device.bind_image_memory(image, memory, 0) }
        .context("Failed to bind image memory")?;

    Ok((image, memory))
}

fn create_view(
    device: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

fn create_sampler(device: &DeviceContext) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

    unsafe { device.device.create_sampler(&sampler_info, None) }
        .context("Failed to create sampler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions_are_supported() {
        let (src_access, dst_access, src_stage, dst_stage) = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src_access, vk::AccessFlags::empty());
        assert_eq!(dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (src_access, dst_access, src_stage, dst_stage) = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn unsupported_transition_pair_is_reported() {
        let err = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::UNDEFINED,
        )
        .unwrap_err();
        assert_eq!(err.from, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(err.to, vk::ImageLayout::UNDEFINED);
    }
}
