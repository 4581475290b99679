use ash::vk;
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use crate::renderer::contexts::device_ctx::types::{BufferKind, Extent2D, ImageUsage, TextureFormat};
use crate::renderer::contexts::device_ctx::vulkan::conv;
use crate::renderer::error::{driver_error, DriverResultExt};

pub struct VkBuffer {
    pub raw: vk::Buffer,
    pub size: u64,
    pub kind: BufferKind,
    allocation: Option<Allocation>,
}

impl VkBuffer {
    pub fn new(
        device: &ash::Device,
        allocator: &mut Allocator,
        label: &str,
        size: u64,
        kind: BufferKind,
        queue_families: &[u32],
    ) -> Result<Self> {
        const OP: &str = "create_buffer";
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(conv::buffer_usage(kind));
        let info = with_sharing(info, queue_families);
        let raw = unsafe { device.create_buffer(&info, None) }.driver_err(OP)?;
        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: label,
            requirements,
            location: conv::memory_location(kind),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(raw, None) };
                return Err(driver_error(OP, format!("`{}`: {}", label, err)));
            }
        };
        unsafe { device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) }.driver_err(OP)?;

        Ok(Self {
            raw,
            size,
            kind,
            allocation: Some(allocation),
        })
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        const OP: &str = "write_buffer";
        if offset + data.len() as u64 > self.size {
            return Err(driver_error(OP, "write exceeds the buffer size"));
        }
        let allocation = self
            .allocation
            .as_mut()
            .ok_or_else(|| driver_error(OP, "buffer has no memory"))?;
        let mut slab = allocation
            .try_as_mapped_slab()
            .ok_or_else(|| driver_error(OP, "buffer is not host visible"))?;
        presser::copy_from_slice_to_offset(data, &mut slab, offset as usize).driver_err(OP)?;
        Ok(())
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        const OP: &str = "read_buffer";
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .ok_or_else(|| driver_error(OP, "buffer is not host visible"))?;
        let start = offset as usize;
        Ok(mapped
            .get(start..start + len)
            .ok_or_else(|| driver_error(OP, "read exceeds the buffer size"))?
            .to_vec())
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) -> Result<()> {
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation).driver_err("destroy_buffer")?;
        }
        unsafe { device.destroy_buffer(self.raw, None) };
        Ok(())
    }
}

/// An image with one view over all of its mips.
///
/// `layouts` is the per-mip layout the image will be in once everything
/// recorded so far has executed.
pub struct VkImage {
    pub raw: vk::Image,
    pub view: vk::ImageView,
    pub format: TextureFormat,
    pub extent: Extent2D,
    pub layouts: Vec<vk::ImageLayout>,
    allocation: Option<Allocation>,
}

impl VkImage {
    pub fn new(
        device: &ash::Device,
        allocator: &mut Allocator,
        label: &str,
        extent: Extent2D,
        format: TextureFormat,
        mip_levels: u32,
        usage: ImageUsage,
        queue_families: &[u32],
    ) -> Result<Self> {
        const OP: &str = "create_image";
        let info = vk::ImageCreateInfo::default()
            .format(conv::texture_format(format))
            .usage(conv::image_usage(usage))
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .image_type(vk::ImageType::TYPE_2D)
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let info = with_sharing(info, queue_families);
        let raw = unsafe { device.create_image(&info, None) }.driver_err(OP)?;
        let requirements = unsafe { device.get_image_memory_requirements(raw) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: label,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::DedicatedImage(raw),
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_image(raw, None) };
                return Err(driver_error(OP, format!("`{}`: {}", label, err)));
            }
        };
        unsafe { device.bind_image_memory(raw, allocation.memory(), allocation.offset()) }.driver_err(OP)?;
        let view = create_view(device, raw, format, mip_levels)?;

        Ok(Self {
            raw,
            view,
            format,
            extent,
            layouts: vec![vk::ImageLayout::UNDEFINED; mip_levels as usize],
            allocation: Some(allocation),
        })
    }

    /// Wraps an image the swapchain owns. Only the view is ours to destroy.
    pub fn borrowed(device: &ash::Device, raw: vk::Image, format: TextureFormat, extent: Extent2D) -> Result<Self> {
        let view = create_view(device, raw, format, 1)?;
        Ok(Self {
            raw,
            view,
            format,
            extent,
            layouts: vec![vk::ImageLayout::UNDEFINED],
            allocation: None,
        })
    }

    /// False for swapchain images.
    pub fn is_owned(&self) -> bool {
        self.allocation.is_some()
    }

    pub fn level_extent(&self, level: u32) -> Extent2D {
        Extent2D::new((self.extent.width >> level).max(1), (self.extent.height >> level).max(1))
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        conv::aspect(self.format)
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) -> Result<()> {
        unsafe { device.destroy_image_view(self.view, None) };
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation).driver_err("destroy_image")?;
            unsafe { device.destroy_image(self.raw, None) };
        }
        Ok(())
    }
}

fn create_view(device: &ash::Device, image: vk::Image, format: TextureFormat, mip_levels: u32) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .view_type(vk::ImageViewType::TYPE_2D)
        .image(image)
        .format(conv::texture_format(format))
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: conv::aspect(format),
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&info, None) }.driver_err("create_image_view")
}

trait Sharing<'a>: Sized {
    fn exclusive(self) -> Self;
    fn concurrent(self, families: &'a [u32]) -> Self;
}

impl<'a> Sharing<'a> for vk::BufferCreateInfo<'a> {
    fn exclusive(self) -> Self {
        self.sharing_mode(vk::SharingMode::EXCLUSIVE)
    }

    fn concurrent(self, families: &'a [u32]) -> Self {
        self.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(families)
    }
}

impl<'a> Sharing<'a> for vk::ImageCreateInfo<'a> {
    fn exclusive(self) -> Self {
        self.sharing_mode(vk::SharingMode::EXCLUSIVE)
    }

    fn concurrent(self, families: &'a [u32]) -> Self {
        self.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(families)
    }
}

/// Uploads run on the transfer family and draws on the graphics family; when
/// they differ, resources are shared concurrently instead of handed over.
fn with_sharing<'a, T: Sharing<'a>>(info: T, queue_families: &'a [u32]) -> T {
    if queue_families.len() > 1 {
        info.concurrent(queue_families)
    } else {
        info.exclusive()
    }
}
