// Swap chain - window presentation
//
// Owns the presentable image set, its format and extent for the session.
// Resizing requires full teardown/rebuild; in-place recreation is out of
// scope by design.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::DeviceContext;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(
        device: Arc<DeviceContext>,
        width: u32,
        height: u32,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let surface = device.surface;
        let surface_loader = &device.surface_loader;

        let capabilities = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, surface)
        }?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }?;
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, surface)
        }?;

        let format =
            choose_surface_format(&formats).context("No surface formats reported")?;
        let present_mode = choose_present_mode(preferred_present_mode, &present_modes);
        let extent = choose_extent(&capabilities, width, height);
        let image_count = choose_image_count(&capabilities);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            image_count
        );

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let queue_families = [device.graphics_queue_family, device.present_queue_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        // Images shared across queues only when the families differ
        if device.graphics_queue_family == device.present_queue_family {
            create_info = create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE);
        } else {
            create_info = create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families);
        }

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { loader.get_swapchain_images(swapchain) }?;
        log::info!("Created swapchain with {} images", images.len());

        // Exactly one view per image
        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    device
                        .device
                        .create_image_view(&create_info, None)
                        .context("Failed to create image view")
                }
            })
            .collect();

        Ok(Self {
            swapchain,
            loader,
            images,
            image_views: image_views?,
            format,
            extent,
            present_mode,
            device,
        })
    }

    /// Acquire the next image for rendering, signaling `semaphore` (and
    /// optionally `fence`) when it is ready. Blocks at most `timeout`
    /// nanoseconds. Non-success results (out-of-date surface, timeout) are
    /// reported upward; there is no recreation path here.
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
        timeout: u64,
    ) -> Result<(u32, bool)> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout, semaphore, fence)
        };

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                anyhow::bail!("Swapchain out of date")
            }
            Err(vk::Result::TIMEOUT) => {
                anyhow::bail!("Timed out acquiring swapchain image (GPU appears hung)")
            }
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present the image on `queue` after `wait_semaphores` signal.
    /// Returns whether the swapchain is suboptimal for the surface.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                anyhow::bail!("Swapchain out of date at present")
            }
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Prefer an 8-bit sRGB format; otherwise take the first reported one.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            (f.format == vk::Format::B8G8R8A8_SRGB || f.format == vk::Format::R8G8B8A8_SRGB)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Honor the preferred mode when supported, then MAILBOX, then FIFO.
/// Every Vulkan surface supports FIFO, so the fallback never leaves the
/// supported set.
pub fn choose_present_mode(
    preferred: vk::PresentModeKHR,
    modes: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        return preferred;
    }
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    vk::PresentModeKHR::FIFO
}

/// Use the surface's fixed extent when it has one; otherwise clamp the
/// requested size into the supported range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        count = capabilities.max_image_count;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn format_prefers_srgb_when_listed() {
        let supported = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&supported).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn format_falls_back_to_first_reported() {
        let supported = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R5G6B5_UNORM_PACK16, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&supported).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn format_choice_is_always_in_supported_list() {
        let candidates = [
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::R8G8B8A8_SRGB,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::R16G16B16A16_SFLOAT,
        ];
        // Every non-empty subset of candidates yields a member of the subset
        for mask in 1u32..(1 << candidates.len()) {
            let supported: Vec<_> = candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, &f)| format(f, vk::ColorSpaceKHR::SRGB_NONLINEAR))
                .collect();
            let chosen = choose_surface_format(&supported).unwrap();
            assert!(supported.iter().any(|f| f.format == chosen.format));
        }
    }

    #[test]
    fn empty_format_list_yields_none() {
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_honors_supported_preference() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::IMMEDIATE, &modes),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn present_mode_prefers_mailbox_over_unsupported_preference() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::IMMEDIATE, &modes),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::MAILBOX, &modes),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_fixed_surface_extent_when_present() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_clamps_into_supported_range() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 320,
                height: 240,
            },
            max_image_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 4096, 100);
        assert_eq!((extent.width, extent.height), (1280, 240));
    }

    #[test]
    fn image_count_is_min_plus_one_capped_at_max() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);

        let tight = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&tight), 2);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&unbounded), 4);
    }
}
