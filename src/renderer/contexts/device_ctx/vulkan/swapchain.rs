use ash::vk;
use color_eyre::Result;
use winit::window::Window;
use crate::renderer::contexts::device_ctx::types::{Extent2D, TextureFormat};
use crate::renderer::contexts::device_ctx::vulkan::conv;
use crate::renderer::contexts::device_ctx::vulkan::device::DeviceCore;
use crate::renderer::error::{driver_error, DriverResultExt};

/// Outcome of an acquire or present that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStatus {
    Optimal,
    /// The swapchain still works but should be rebuilt at the next acquire.
    Suboptimal,
    OutOfDate,
}

pub struct Swapchain {
    pub raw: vk::SwapchainKHR,
    pub loader: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub extent: Extent2D,
    pub format: TextureFormat,
    vk_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    pub fn new(
        instance: &ash::Instance,
        core: &DeviceCore,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
        window: &Window,
        vsync: bool,
    ) -> Result<Self> {
        const OP: &str = "create swapchain";
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(core.physical, surface) }
            .driver_err(OP)?;
        let vk_format = formats
            .iter()
            .copied()
            .filter(|f| conv::surface_texture_format(f.format).is_some())
            .min_by_key(|f| match (f.format, f.color_space) {
                (vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR) => 0,
                (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR) => 1,
                _ => 2,
            })
            .ok_or_else(|| driver_error(OP, "surface offers no usable 8-bit color format"))?;
        let format = conv::surface_texture_format(vk_format.format)
            .ok_or_else(|| driver_error(OP, "surface offers no usable 8-bit color format"))?;

        let present_modes = unsafe { surface_loader.get_physical_device_surface_present_modes(core.physical, surface) }
            .driver_err(OP)?;
        // FIFO is always available
        let present_mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
                .into_iter()
                .find(|mode| present_modes.contains(mode))
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let loader = ash::khr::swapchain::Device::new(instance, &core.logical);
        let mut swapchain = Self {
            raw: vk::SwapchainKHR::null(),
            loader,
            images: Vec::new(),
            extent: Extent2D::default(),
            format,
            vk_format,
            present_mode,
        };
        swapchain.rebuild(core, surface, surface_loader, window)?;
        log::info!(
            "Swapchain created: {:?} {:?}, {} images, {:?}",
            swapchain.format,
            swapchain.extent,
            swapchain.images.len(),
            swapchain.present_mode
        );
        Ok(swapchain)
    }

    /// Creates a new swapchain from the old one. The device must be idle.
    pub fn rebuild(
        &mut self,
        core: &DeviceCore,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
        window: &Window,
    ) -> Result<()> {
        const OP: &str = "create swapchain";
        let capabilities =
            unsafe { surface_loader.get_physical_device_surface_capabilities(core.physical, surface) }.driver_err(OP)?;

        let image_extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            let size = window.inner_size();
            vk::Extent2D {
                width: size
                    .width
                    .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
                height: size
                    .height
                    .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
            }
        };

        // One more than the minimum so acquiring never waits on the driver
        let min_image_count = match capabilities.max_image_count {
            0 => capabilities.min_image_count + 1,
            max => (capabilities.min_image_count + 1).min(max),
        };
        let pre_transform = if capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            capabilities.current_transform
        };

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(min_image_count)
            .image_format(self.vk_format.format)
            .image_color_space(self.vk_format.color_space)
            .image_extent(image_extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.raw);
        let raw = unsafe { self.loader.create_swapchain(&info, None) }.driver_err(OP)?;
        if self.raw != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.raw, None) };
        }
        self.raw = raw;
        self.images = unsafe { self.loader.get_swapchain_images(raw) }.driver_err(OP)?;
        self.extent = Extent2D::new(image_extent.width, image_extent.height);
        Ok(())
    }

    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<(u32, SwapStatus)> {
        match unsafe {
            self.loader
                .acquire_next_image(self.raw, u64::MAX, semaphore, vk::Fence::null())
        } {
            Ok((index, false)) => Ok((index, SwapStatus::Optimal)),
            Ok((index, true)) => Ok((index, SwapStatus::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, SwapStatus::OutOfDate)),
            Err(err) => Err(driver_error("acquire_next_image", err.to_string())),
        }
    }

    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: &[vk::Semaphore]) -> Result<SwapStatus> {
        let swapchains = [self.raw];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.loader.queue_present(queue, &info) } {
            Ok(false) => Ok(SwapStatus::Optimal),
            Ok(true) => Ok(SwapStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SwapStatus::OutOfDate),
            Err(err) => Err(driver_error("present", err.to_string())),
        }
    }

    pub fn destroy(&mut self) {
        if self.raw != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.raw, None) };
            self.raw = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}
