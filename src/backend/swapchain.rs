// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// their views and framebuffers, and full recreation on resize or when
// the present call reports the surface went stale.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::pipeline;
use super::VulkanDevice;

/// Outcome of requesting the next presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// An image is available. `suboptimal` asks for recreation after
    /// this frame, the image is still presentable.
    Ready { image_index: u32, suboptimal: bool },
    /// The surface changed under us; recreate and retry next frame.
    OutOfDate,
}

/// The image chain and everything derived from it. Destroyed and
/// rebuilt as one unit.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        render_pass: Option<vk::RenderPass>,
        preferred_present_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_caps = unsafe {
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

        let surface_format = choose_surface_format(&formats).context("No surface format")?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);
        let extent = choose_extent(&surface_caps, width, height);
        let image_count = choose_image_count(&surface_caps);

        log::info!("Present mode: {:?}", present_mode);

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }?;
        log::info!("Created swapchain with {} images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
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
        let image_views = image_views?;

        let framebuffers = match render_pass {
            Some(render_pass) => {
                pipeline::create_framebuffers(&device, &image_views, render_pass, extent)?
            }
            None => Vec::new(),
        };

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            framebuffers,
            format: surface_format.format,
            extent,
            device,
        })
    }

    /// Acquire the next image for rendering, signaling `semaphore` when
    /// it becomes usable.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<Acquire> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(Acquire::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present a rendered image. Returns true when the surface went
    /// stale and the chain should be recreated.
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

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Owns the swapchain across recreations. `None` while the window is
/// minimized (zero extent); frames are skipped until it comes back.
pub struct SwapchainManager {
    device: Arc<VulkanDevice>,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    render_pass: Option<vk::RenderPass>,
    preferred_present_mode: vk::PresentModeKHR,
    chain: Option<Swapchain>,
}

impl SwapchainManager {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: ash::extensions::khr::Surface,
        render_pass: Option<vk::RenderPass>,
        preferred_present_mode: vk::PresentModeKHR,
        extent: (u32, u32),
    ) -> Result<Self> {
        let mut manager = Self {
            device,
            surface,
            surface_loader,
            render_pass,
            preferred_present_mode,
            chain: None,
        };
        manager.build_chain(extent)?;
        Ok(manager)
    }

    /// Tears the whole chain down and rebuilds it at `extent`. Waits
    /// for the device to go idle first; the old chain is fully dropped
    /// before the new one exists, so the surface never has two.
    pub fn recreate(&mut self, extent: (u32, u32)) -> Result<()> {
        self.device.wait_idle()?;
        self.chain = None;
        self.build_chain(extent)
    }

    fn build_chain(&mut self, (width, height): (u32, u32)) -> Result<()> {
        if width == 0 || height == 0 {
            log::debug!("Zero-sized extent, swapchain parked");
            return Ok(());
        }
        self.chain = Some(Swapchain::new(
            self.device.clone(),
            self.surface,
            &self.surface_loader,
            self.render_pass,
            self.preferred_present_mode,
            width,
            height,
        )?);
        Ok(())
    }

    /// Whether a chain currently exists (false while minimized).
    pub fn is_ready(&self) -> bool {
        self.chain.is_some()
    }

    pub fn acquire_next(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<Acquire> {
        self.chain()?.acquire_next_image(timeout, semaphore)
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        self.chain()?.present(queue, image_index, wait_semaphores)
    }

    pub fn extent(&self) -> Result<vk::Extent2D> {
        Ok(self.chain()?.extent)
    }

    pub fn format(&self) -> Result<vk::Format> {
        Ok(self.chain()?.format)
    }

    pub fn images(&self) -> Result<&[vk::Image]> {
        Ok(&self.chain()?.images)
    }

    pub fn framebuffer(&self, image_index: u32) -> Result<vk::Framebuffer> {
        self.chain()?
            .framebuffers
            .get(image_index as usize)
            .copied()
            .context("No framebuffer for image index")
    }

    fn chain(&self) -> Result<&Swapchain> {
        self.chain.as_ref().context("Swapchain not available")
    }
}

/// Prefer an SRGB format, fall back to whatever the surface offers.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use the preferred mode when the device offers it; FIFO is always
/// supported and is the fallback.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp the requested extent to the device-reported bounds. Requests
/// outside the caps are clamped, never rejected.
pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more image than the reported minimum, capped at the reported
/// maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: (u32, u32), max: (u32, u32), current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn extent_request_is_clamped_not_rejected() {
        let caps = caps((64, 64), (2048, 2048), (u32::MAX, u32::MAX));
        let extent = choose_extent(&caps, 10_000, 16);
        assert_eq!(extent.width, 2048);
        assert_eq!(extent.height, 64);
    }

    #[test]
    fn extent_uses_current_when_fixed() {
        let caps = caps((1, 1), (4096, 4096), (1280, 720));
        let extent = choose_extent(&caps, 555, 555);
        assert_eq!(extent.width, 1280);
        assert_eq!(extent.height, 720);
    }

    #[test]
    fn image_count_negotiated_between_min_and_max() {
        let mut capabilities = caps((1, 1), (4096, 4096), (1, 1));
        capabilities.min_image_count = 2;
        capabilities.max_image_count = 3;
        assert_eq!(choose_image_count(&capabilities), 3);

        capabilities.max_image_count = 0; // unbounded
        assert_eq!(choose_image_count(&capabilities), 3);

        capabilities.min_image_count = 3;
        capabilities.max_image_count = 3;
        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
    }
}
