use std::ffi::{c_char, CStr};
use ash::vk;
use color_eyre::Result;
use gpu_descriptor::{CreatePoolError, DescriptorDevice, DescriptorPoolCreateFlags, DescriptorTotalCount, DeviceAllocationError};
use crate::renderer::contexts::device_ctx::types::{DeviceLimits, FormatSupport, TextureFormat};
use crate::renderer::contexts::device_ctx::vulkan::conv;
use crate::renderer::error::{driver_error, DriverResultExt};
use crate::renderer::resources::vertex::VertexFormat;

#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub family: u32,
    pub handle: vk::Queue,
}

/// The physical and logical device plus the queues the backend submits to.
pub struct DeviceCore {
    pub physical: vk::PhysicalDevice,
    pub logical: ash::Device,
    pub graphics: Queue,
    pub transfer: Queue,
    pub name: String,
    pub limits: DeviceLimits,
    pub format_support: FormatSupport,
    pub fill_mode_non_solid: bool,
}

impl DeviceCore {
    pub fn new(
        instance: &ash::Instance,
        surface: Option<(vk::SurfaceKHR, &ash::khr::surface::Instance)>,
    ) -> Result<Self> {
        const OP: &str = "create device";
        let (physical, graphics_family, transfer_family) = Self::select_physical_device(instance, surface)?;

        let queue_priorities = [1.0];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)];
        if transfer_family != graphics_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(transfer_family)
                    .queue_priorities(&queue_priorities),
            );
        }

        let supported = unsafe { instance.get_physical_device_features(physical) };
        let fill_mode_non_solid = supported.fill_mode_non_solid == vk::TRUE;
        let features = vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(fill_mode_non_solid);
        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let enabled_extension_names: Vec<*const c_char> = Self::required_device_extensions(surface.is_some())
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names)
            .enabled_features(&features)
            .push_next(&mut vulkan13_features);
        let logical = unsafe { instance.create_device(physical, &device_create_info, None) }.driver_err(OP)?;

        let graphics = Queue {
            family: graphics_family,
            handle: unsafe { logical.get_device_queue(graphics_family, 0) },
        };
        let transfer = Queue {
            family: transfer_family,
            handle: unsafe { logical.get_device_queue(transfer_family, 0) },
        };

        let props = unsafe { instance.get_physical_device_properties(physical) };
        let name = props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown Vulkan device".to_owned());
        let limits = DeviceLimits {
            max_image_dimension: props.limits.max_image_dimension2_d,
            max_vertex_buffers: props.limits.max_vertex_input_bindings,
            min_uniform_buffer_offset_alignment: props.limits.min_uniform_buffer_offset_alignment,
        };
        let format_support = Self::query_format_support(instance, physical);
        log::info!(
            "Selected `{}` (graphics family {}, transfer family {})",
            name,
            graphics_family,
            transfer_family
        );

        Ok(Self {
            physical,
            logical,
            graphics,
            transfer,
            name,
            limits,
            format_support,
            fill_mode_non_solid,
        })
    }

    /// Queue families resources are shared between.
    pub fn queue_families(&self) -> Vec<u32> {
        if self.graphics.family == self.transfer.family {
            vec![self.graphics.family]
        } else {
            vec![self.graphics.family, self.transfer.family]
        }
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface: Option<(vk::SurfaceKHR, &ash::khr::surface::Instance)>,
    ) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let required = Self::required_device_extensions(surface.is_some());
        let devices = unsafe { instance.enumerate_physical_devices() }.driver_err("create device")?;

        devices
            .into_iter()
            .filter(|device| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                props.api_version >= vk::API_VERSION_1_3
            })
            // Filter out devices that do not contain the required device extensions
            .filter(|device| {
                let supported = unsafe { instance.enumerate_device_extension_properties(*device) }.unwrap_or_default();
                required.iter().all(|req| {
                    let found = supported
                        .iter()
                        .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *req));
                    if !found {
                        log::debug!("Device extension not supported: {:?}", req);
                    }
                    found
                })
            })
            .filter_map(|device| {
                let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
                let graphics = families.iter().enumerate().position(|(i, q)| {
                    let supports_graphics = q.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                    let supports_present = match surface {
                        Some((surface, loader)) => unsafe {
                            loader
                                .get_physical_device_surface_support(device, i as u32, surface)
                                .unwrap_or(false)
                        },
                        None => true,
                    };
                    supports_graphics && supports_present
                })?;
                // Prefer a dedicated transfer family, fall back to the graphics one
                let transfer = families
                    .iter()
                    .position(|q| {
                        q.queue_flags.contains(vk::QueueFlags::TRANSFER)
                            && !q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    })
                    .unwrap_or(graphics);
                Some((device, graphics as u32, transfer as u32))
            })
            .min_by_key(|(device, _, _)| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                    vk::PhysicalDeviceType::CPU => 3,
                    _ => 4,
                }
            })
            .ok_or_else(|| driver_error("create device", "no Vulkan 1.3 device with the required queues and extensions"))
    }

    fn required_device_extensions(with_surface: bool) -> Vec<&'static CStr> {
        let mut exts = Vec::new();
        if with_surface {
            exts.push(ash::khr::swapchain::NAME);
        }
        #[cfg(target_os = "macos")]
        exts.push(ash::khr::portability_subset::NAME);
        exts
    }

    fn query_format_support(instance: &ash::Instance, physical: vk::PhysicalDevice) -> FormatSupport {
        let mut support = FormatSupport::default();
        let all = [
            TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8Srgb,
            TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8Srgb,
            TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float,
        ];
        for format in all {
            let props = unsafe { instance.get_physical_device_format_properties(physical, conv::texture_format(format)) };
            let optimal = props.optimal_tiling_features;
            if format.is_depth() {
                if optimal.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT) {
                    support.depth_attachment.push(format);
                }
                continue;
            }
            if optimal.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND) {
                support.color_attachment.push(format);
            }
            if optimal.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE) {
                support.sampled.push(format);
            }
        }
        for format in VertexFormat::ALL {
            let props = unsafe { instance.get_physical_device_format_properties(physical, conv::vertex_format(format)) };
            if props.buffer_features.contains(vk::FormatFeatureFlags::VERTEX_BUFFER) {
                support.vertex.push(format);
            }
        }
        support
    }
}

/// Lets `gpu-descriptor` manage pools on an `ash` device.
pub struct DescriptorAshDevice<'a>(pub &'a ash::Device);

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet> for DescriptorAshDevice<'_> {
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let counts = [
            (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
            (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
            (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
            (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
            (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
            (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
        ];
        let pool_sizes: smallvec::SmallVec<[vk::DescriptorPoolSize; 11]> = counts
            .iter()
            .filter(|(_, count)| *count != 0)
            .map(|(ty, count)| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: *count,
            })
            .collect();

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();
        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }
        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes)
                    .flags(ash_flags),
                None,
            )
        };
        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(CreatePoolError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(err) => {
                log::error!("vkCreateDescriptorPool returned {}", err);
                Err(CreatePoolError::OutOfHostMemory)
            }
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.0.destroy_descriptor_pool(pool, None) }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: smallvec::SmallVec<[_; 16]> = layouts.copied().collect();
        let result = unsafe {
            self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            )
        };
        match result {
            Ok(allocated) => {
                sets.extend(allocated);
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(DeviceAllocationError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
            Err(err) => {
                log::error!("vkAllocateDescriptorSets returned {}", err);
                Err(DeviceAllocationError::OutOfHostMemory)
            }
        }
    }

    unsafe fn dealloc_descriptor_sets<'a>(&self, pool: &mut vk::DescriptorPool, sets: impl Iterator<Item = vk::DescriptorSet>) {
        let sets: smallvec::SmallVec<[_; 16]> = sets.collect();
        if let Err(err) = unsafe { self.0.free_descriptor_sets(*pool, &sets) } {
            log::error!("vkFreeDescriptorSets returned {}", err);
        }
    }
}
