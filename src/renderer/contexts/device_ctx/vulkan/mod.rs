mod commands;
mod conv;
mod device;
mod instance;
mod memory;
mod pipeline;
mod swapchain;

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_descriptor::{DescriptorAllocator, DescriptorSetLayoutCreateFlags, DescriptorTotalCount};
use winit::window::Window;
use crate::renderer::config::{BackendKind, RenderConfig};
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::{validate_pipeline_formats, GpuDevice};
use crate::renderer::error::{configuration_error, driver_error, DriverResultExt};
use crate::renderer::util;
use commands::RecordState;
use device::{DescriptorAshDevice, DeviceCore};
use instance::VulkanInstance;
use memory::{VkBuffer, VkImage};
use pipeline::{LayoutCache, VkPipeline};
use swapchain::{SwapStatus, Swapchain};

struct VkTarget {
    extent: Extent2D,
    color_format: TextureFormat,
    depth_format: Option<TextureFormat>,
    color: ImageId,
    depth: Option<ImageId>,
}

struct VkBindingSet {
    set: gpu_descriptor::DescriptorSet<vk::DescriptorSet>,
    layout: BindingLayoutDesc,
}

struct VkCommandList {
    pool: vk::CommandPool,
    raw: vk::CommandBuffer,
    queue: QueueKind,
    state: RecordState,
}

struct VkSurface {
    window: Arc<Window>,
    raw: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
    swapchain: Swapchain,
    images: Vec<ImageId>,
    depth: ImageId,
    acquired: Option<u32>,
}

/// Hardware backend. Renders with dynamic rendering and synchronization2 on
/// a Vulkan 1.3 device, presenting to the window's surface when one is given.
pub struct VulkanDevice {
    name: String,
    limits: DeviceLimits,
    format_support: FormatSupport,
    stats: DeviceStats,
    next_id: u64,
    buffers: HashMap<BufferId, VkBuffer>,
    images: HashMap<ImageId, VkImage>,
    samplers: HashMap<SamplerId, vk::Sampler>,
    targets: HashMap<TargetId, VkTarget>,
    pipelines: HashMap<PipelineId, VkPipeline>,
    binding_sets: HashMap<BindingSetId, VkBindingSet>,
    command_lists: HashMap<CommandListId, VkCommandList>,
    signals: HashMap<SignalId, vk::Semaphore>,
    surface: Option<VkSurface>,
    resize_requested: bool,
    layouts: LayoutCache,
    descriptors: DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet>,
    allocator: ManuallyDrop<Allocator>,
    core: DeviceCore,
    instance: VulkanInstance,
}

impl VulkanDevice {
    pub fn new(config: &RenderConfig, window: Option<Arc<Window>>) -> Result<Self> {
        let mut instance = VulkanInstance::new(config.validation, window.as_deref())?;
        let surface = match window.as_deref() {
            Some(window) => Some(instance.create_surface(window)?),
            None => None,
        };
        let core = match DeviceCore::new(&instance.instance, surface.as_ref().map(|(raw, loader)| (*raw, loader))) {
            Ok(core) => core,
            Err(err) => {
                unsafe {
                    if let Some((raw, loader)) = surface {
                        loader.destroy_surface(raw, None);
                    }
                    instance.destroy();
                }
                return Err(err);
            }
        };
        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: core.logical.clone(),
            physical_device: core.physical,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe {
                    core.logical.destroy_device(None);
                    if let Some((raw, loader)) = surface {
                        loader.destroy_surface(raw, None);
                    }
                    instance.destroy();
                }
                return Err(err).driver_err("create allocator");
            }
        };

        let mut device = Self {
            name: core.name.clone(),
            limits: core.limits.clone(),
            format_support: core.format_support.clone(),
            stats: DeviceStats::default(),
            next_id: 1,
            buffers: HashMap::new(),
            images: HashMap::new(),
            samplers: HashMap::new(),
            targets: HashMap::new(),
            pipelines: HashMap::new(),
            binding_sets: HashMap::new(),
            command_lists: HashMap::new(),
            signals: HashMap::new(),
            surface: None,
            resize_requested: false,
            layouts: LayoutCache::default(),
            descriptors: DescriptorAllocator::new(0),
            allocator: ManuallyDrop::new(allocator),
            core,
            instance,
        };

        // From here on, Drop cleans up whatever was created
        if let (Some(window), Some((raw, loader))) = (window, surface) {
            let mut swapchain =
                match Swapchain::new(&device.instance.instance, &device.core, raw, &loader, &window, config.vsync) {
                    Ok(swapchain) => swapchain,
                    Err(err) => {
                        unsafe { loader.destroy_surface(raw, None) };
                        return Err(err);
                    }
                };
            let (images, depth) = match device.register_surface_images(&swapchain) {
                Ok(registered) => registered,
                Err(err) => {
                    swapchain.destroy();
                    unsafe { loader.destroy_surface(raw, None) };
                    return Err(err);
                }
            };
            device.surface = Some(VkSurface {
                window,
                raw,
                loader,
                swapchain,
                images,
                depth,
                acquired: None,
            });
        }
        Ok(device)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn queue_families(&self) -> Vec<u32> {
        self.core.queue_families()
    }

    fn buffer(&self, op: &'static str, id: BufferId) -> Result<&VkBuffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| driver_error(op, format!("unknown buffer {id:?}")))
    }

    fn image(&self, op: &'static str, id: ImageId) -> Result<&VkImage> {
        self.images
            .get(&id)
            .ok_or_else(|| driver_error(op, format!("unknown image {id:?}")))
    }

    fn signal(&self, op: &'static str, id: SignalId) -> Result<vk::Semaphore> {
        self.signals
            .get(&id)
            .copied()
            .ok_or_else(|| driver_error(op, format!("unknown signal {id:?}")))
    }

    fn alloc_image(
        &mut self,
        label: &str,
        extent: Extent2D,
        format: TextureFormat,
        mip_levels: u32,
        usage: ImageUsage,
    ) -> Result<ImageId> {
        let families = self.queue_families();
        let image = VkImage::new(
            &self.core.logical,
            &mut self.allocator,
            label,
            extent,
            format,
            mip_levels,
            usage,
            &families,
        )?;
        let id = ImageId(self.next_id());
        self.images.insert(id, image);
        Ok(id)
    }

    fn free_image(&mut self, id: ImageId) -> Result<()> {
        let mut image = self
            .images
            .remove(&id)
            .ok_or_else(|| driver_error("destroy_image", format!("unknown image {id:?}")))?;
        image.destroy(&self.core.logical, &mut self.allocator)
    }

    fn register_surface_images(&mut self, swapchain: &Swapchain) -> Result<(Vec<ImageId>, ImageId)> {
        let mut images = Vec::with_capacity(swapchain.images.len());
        for raw in &swapchain.images {
            let image = VkImage::borrowed(&self.core.logical, *raw, swapchain.format, swapchain.extent)?;
            let id = ImageId(self.next_id());
            self.images.insert(id, image);
            images.push(id);
        }
        let depth = self.alloc_image(
            "surface depth",
            swapchain.extent,
            TextureFormat::Depth32Float,
            1,
            ImageUsage::DEPTH_ATTACHMENT,
        )?;
        Ok((images, depth))
    }

    fn rebuild_surface(&mut self) -> Result<()> {
        let Some(mut surface) = self.surface.take() else {
            return Ok(());
        };
        unsafe { self.core.logical.device_wait_idle() }.driver_err("rebuild surface")?;
        for image in surface.images.drain(..).chain(std::iter::once(surface.depth)) {
            self.free_image(image)?;
        }
        surface
            .swapchain
            .rebuild(&self.core, surface.raw, &surface.loader, &surface.window)?;
        let (images, depth) = self.register_surface_images(&surface.swapchain)?;
        surface.images = images;
        surface.depth = depth;
        surface.acquired = None;
        log::debug!("Swapchain rebuilt at {:?}", surface.swapchain.extent);
        self.surface = Some(surface);
        Ok(())
    }

    fn queue(&self, kind: QueueKind) -> &device::Queue {
        match kind {
            QueueKind::Graphics => &self.core.graphics,
            QueueKind::Transfer => &self.core.transfer,
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn backend(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn format_support(&self) -> &FormatSupport {
        &self.format_support
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            live_buffers: self.buffers.len() as u64,
            live_images: self.images.values().filter(|image| image.is_owned()).count() as u64,
            ..self.stats
        }
    }

    fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    fn request_surface_resize(&mut self) {
        self.resize_requested = self.surface.is_some();
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId> {
        if desc.size == 0 {
            return Err(configuration_error("create_buffer", format!("`{}` has zero size", desc.label)));
        }
        let families = self.queue_families();
        let buffer = VkBuffer::new(
            &self.core.logical,
            &mut self.allocator,
            desc.label,
            desc.size,
            desc.kind,
            &families,
        )?;
        let id = BufferId(self.next_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        const OP: &str = "write_buffer";
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| driver_error(OP, format!("unknown buffer {buffer:?}")))?;
        if !target.kind.is_host_visible() {
            return Err(driver_error(OP, format!("{buffer:?} is not host visible")));
        }
        target.write(offset, data)
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: u64, len: usize) -> Result<Vec<u8>> {
        const OP: &str = "read_buffer";
        let source = self.buffer(OP, buffer)?;
        if !source.kind.is_host_visible() {
            return Err(driver_error(OP, format!("{buffer:?} is not host visible")));
        }
        source.read(offset, len)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<()> {
        let mut target = self
            .buffers
            .remove(&buffer)
            .ok_or_else(|| driver_error("destroy_buffer", format!("unknown buffer {buffer:?}")))?;
        target.destroy(&self.core.logical, &mut self.allocator)
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId> {
        const OP: &str = "create_image";
        let max = self.limits.max_image_dimension;
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.extent.width > max || desc.extent.height > max {
            return Err(configuration_error(
                OP,
                format!("`{}` has unsupported extent {:?}", desc.label, desc.extent),
            ));
        }
        if desc.usage.contains(ImageUsage::SAMPLED) && !self.format_support.supports_sampled(desc.format) {
            return Err(configuration_error(
                OP,
                format!("{:?} cannot be sampled on this device", desc.format),
            ));
        }
        let max_mips = util::mip_level_count(desc.extent.width, desc.extent.height);
        if desc.mip_levels == 0 || desc.mip_levels > max_mips {
            return Err(configuration_error(
                OP,
                format!("`{}` asks for {} mips, at most {max_mips} fit", desc.label, desc.mip_levels),
            ));
        }
        self.alloc_image(desc.label, desc.extent, desc.format, desc.mip_levels, desc.usage)
    }

    fn destroy_image(&mut self, image: ImageId) -> Result<()> {
        self.free_image(image)
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId> {
        let address = conv::address_mode(desc.address_mode);
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(conv::filter(desc.filter))
            .min_filter(conv::filter(desc.filter))
            .mipmap_mode(conv::mipmap_mode(desc.mip_filter))
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.core.logical.create_sampler(&info, None) }.driver_err("create_sampler")?;
        let id = SamplerId(self.next_id());
        self.samplers.insert(id, sampler);
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) -> Result<()> {
        let raw = self
            .samplers
            .remove(&sampler)
            .ok_or_else(|| driver_error("destroy_sampler", format!("unknown sampler {sampler:?}")))?;
        unsafe { self.core.logical.destroy_sampler(raw, None) };
        Ok(())
    }

    fn create_offscreen_target(&mut self, desc: &OffscreenTargetDesc) -> Result<TargetId> {
        const OP: &str = "create_offscreen_target";
        if !self.format_support.supports_color_attachment(desc.color_format) {
            return Err(configuration_error(
                OP,
                format!("{:?} is not renderable on this device", desc.color_format),
            ));
        }
        if let Some(depth) = desc.depth_format {
            if !self.format_support.supports_depth_attachment(depth) {
                return Err(configuration_error(OP, format!("{depth:?} is not a supported depth format")));
            }
        }
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(configuration_error(OP, format!("`{}` has an empty extent", desc.label)));
        }
        let color = self.alloc_image(
            desc.label,
            desc.extent,
            desc.color_format,
            1,
            ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::SAMPLED,
        )?;
        let depth = match desc.depth_format {
            Some(format) => match self.alloc_image(desc.label, desc.extent, format, 1, ImageUsage::DEPTH_ATTACHMENT) {
                Ok(depth) => Some(depth),
                Err(err) => {
                    self.free_image(color)?;
                    return Err(err);
                }
            },
            None => None,
        };
        let id = TargetId(self.next_id());
        self.targets.insert(
            id,
            VkTarget {
                extent: desc.extent,
                color_format: desc.color_format,
                depth_format: desc.depth_format,
                color,
                depth,
            },
        );
        Ok(id)
    }

    fn destroy_offscreen_target(&mut self, target: TargetId) -> Result<()> {
        let t = self
            .targets
            .remove(&target)
            .ok_or_else(|| driver_error("destroy_offscreen_target", format!("unknown target {target:?}")))?;
        self.free_image(t.color)?;
        if let Some(depth) = t.depth {
            self.free_image(depth)?;
        }
        Ok(())
    }

    fn target_info(&self, target: RenderTarget) -> Result<TargetInfo> {
        const OP: &str = "target_info";
        match target {
            RenderTarget::Surface => {
                let surface = self
                    .surface
                    .as_ref()
                    .ok_or_else(|| configuration_error(OP, "device has no surface"))?;
                Ok(TargetInfo {
                    extent: surface.swapchain.extent,
                    color_format: surface.swapchain.format,
                    depth_format: Some(TextureFormat::Depth32Float),
                    color_image: surface.acquired.map(|i| surface.images[i as usize]),
                })
            }
            RenderTarget::Offscreen(id) => {
                let t = self
                    .targets
                    .get(&id)
                    .ok_or_else(|| configuration_error(OP, format!("unknown target {id:?}")))?;
                Ok(TargetInfo {
                    extent: t.extent,
                    color_format: t.color_format,
                    depth_format: t.depth_format,
                    color_image: Some(t.color),
                })
            }
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId> {
        validate_pipeline_formats(&self.format_support, desc)?;
        let pipeline =
            pipeline::create_graphics_pipeline(&self.core.logical, &mut self.layouts, desc, self.core.fill_mode_non_solid)?;
        let id = PipelineId(self.next_id());
        self.pipelines.insert(id, pipeline);
        self.stats.pipelines_created += 1;
        log::debug!("Vulkan pipeline {:?} created for `{}`", id, desc.label);
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        let target = self
            .pipelines
            .remove(&pipeline)
            .ok_or_else(|| driver_error("destroy_pipeline", format!("unknown pipeline {pipeline:?}")))?;
        unsafe { self.core.logical.destroy_pipeline(target.raw, None) };
        self.stats.pipelines_destroyed += 1;
        Ok(())
    }

    fn create_binding_set(&mut self, layout: &BindingLayoutDesc) -> Result<BindingSetId> {
        const OP: &str = "create_binding_set";
        let pair = self.layouts.get_or_create(&self.core.logical, layout)?;
        let counts = DescriptorTotalCount {
            sampler: layout.count(|kind| matches!(kind, BindingKind::Sampler)),
            combined_image_sampler: 0,
            sampled_image: layout.count(|kind| matches!(kind, BindingKind::SampledImage)),
            storage_image: 0,
            uniform_texel_buffer: 0,
            storage_texel_buffer: 0,
            uniform_buffer: layout.count(|kind| matches!(kind, BindingKind::UniformBuffer { .. })),
            storage_buffer: 0,
            uniform_buffer_dynamic: 0,
            storage_buffer_dynamic: 0,
            input_attachment: 0,
            acceleration_structure: 0,
            inline_uniform_block_bytes: 0,
            inline_uniform_block_bindings: 0,
        };
        let mut sets = unsafe {
            self.descriptors.allocate(
                &DescriptorAshDevice(&self.core.logical),
                &pair.set_layout,
                DescriptorSetLayoutCreateFlags::empty(),
                &counts,
                1,
            )
        }
        .driver_err(OP)?;
        let set = sets
            .pop()
            .ok_or_else(|| driver_error(OP, "descriptor allocator returned no set"))?;
        let id = BindingSetId(self.next_id());
        self.binding_sets.insert(
            id,
            VkBindingSet {
                set,
                layout: layout.clone(),
            },
        );
        self.stats.binding_sets_created += 1;
        Ok(id)
    }

    fn write_binding_set(&mut self, set: BindingSetId, writes: &[BindingWrite]) -> Result<()> {
        const OP: &str = "write_binding_set";
        let target = self
            .binding_sets
            .get(&set)
            .ok_or_else(|| driver_error(OP, format!("unknown binding set {set:?}")))?;
        let raw_set = *target.set.raw();

        enum Info {
            Buffer(vk::DescriptorBufferInfo),
            Image(vk::DescriptorImageInfo),
        }
        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let entry = target
                .layout
                .entry(write.binding)
                .ok_or_else(|| driver_error(OP, format!("binding {} is not in the layout", write.binding)))?;
            let info = match (entry.kind, write.resource) {
                (BindingKind::UniformBuffer { .. }, BindingResource::Buffer { buffer, offset, size }) => {
                    Info::Buffer(vk::DescriptorBufferInfo {
                        buffer: self.buffer(OP, buffer)?.raw,
                        offset,
                        range: size,
                    })
                }
                (BindingKind::SampledImage, BindingResource::Image(image)) => Info::Image(
                    vk::DescriptorImageInfo::default()
                        .image_view(self.image(OP, image)?.view)
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                ),
                (BindingKind::Sampler, BindingResource::Sampler(sampler)) => {
                    let raw = self
                        .samplers
                        .get(&sampler)
                        .ok_or_else(|| driver_error(OP, format!("binding {} refers to a destroyed resource", write.binding)))?;
                    Info::Image(vk::DescriptorImageInfo::default().sampler(*raw))
                }
                _ => {
                    return Err(driver_error(
                        OP,
                        format!("binding {} written with the wrong resource kind", write.binding),
                    ));
                }
            };
            infos.push((write.binding, conv::descriptor_type(entry.kind), info));
        }

        let descriptor_writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, ty, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(raw_set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match info {
                    Info::Buffer(buffer) => write.buffer_info(std::slice::from_ref(buffer)),
                    Info::Image(image) => write.image_info(std::slice::from_ref(image)),
                }
            })
            .collect();
        unsafe { self.core.logical.update_descriptor_sets(&descriptor_writes, &[]) };
        Ok(())
    }

    fn destroy_binding_set(&mut self, set: BindingSetId) -> Result<()> {
        let target = self
            .binding_sets
            .remove(&set)
            .ok_or_else(|| driver_error("destroy_binding_set", format!("unknown binding set {set:?}")))?;
        unsafe {
            self.descriptors
                .free(&DescriptorAshDevice(&self.core.logical), std::iter::once(target.set));
        }
        self.stats.binding_sets_destroyed += 1;
        Ok(())
    }

    fn create_command_list(&mut self, queue: QueueKind) -> Result<CommandListId> {
        const OP: &str = "create_command_list";
        let family = self.queue(queue).family;
        let pool = unsafe {
            self.core.logical.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )
        }
        .driver_err(OP)?;
        let allocated = unsafe {
            self.core.logical.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        };
        let raw = match allocated.ok().and_then(|buffers| buffers.into_iter().next()) {
            Some(raw) => raw,
            None => {
                unsafe { self.core.logical.destroy_command_pool(pool, None) };
                return Err(driver_error(OP, "failed to allocate a command buffer"));
            }
        };
        let id = CommandListId(self.next_id());
        self.command_lists.insert(
            id,
            VkCommandList {
                pool,
                raw,
                queue,
                state: RecordState::default(),
            },
        );
        Ok(id)
    }

    fn begin_commands(&mut self, list: CommandListId) -> Result<()> {
        const OP: &str = "begin_commands";
        let target = self
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| driver_error(OP, format!("unknown command list {list:?}")))?;
        unsafe {
            self.core
                .logical
                .reset_command_buffer(target.raw, vk::CommandBufferResetFlags::empty())
                .driver_err(OP)?;
            self.core
                .logical
                .begin_command_buffer(
                    target.raw,
                    &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .driver_err(OP)?;
        }
        target.state = RecordState::begin();
        Ok(())
    }

    fn record(&mut self, list: CommandListId, command: &Command) -> Result<()> {
        const OP: &str = "record";
        let target = self
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| driver_error(OP, format!("unknown command list {list:?}")))?;
        if !target.state.recording {
            return Err(driver_error(OP, format!("{list:?} is not recording")));
        }
        let raw = target.raw;
        let mut state = std::mem::take(&mut target.state);
        let result = self.encode(raw, &mut state, command);
        if let Some(target) = self.command_lists.get_mut(&list) {
            target.state = state;
        }
        result
    }

    fn end_commands(&mut self, list: CommandListId) -> Result<()> {
        const OP: &str = "end_commands";
        let target = self
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| driver_error(OP, format!("unknown command list {list:?}")))?;
        if !target.state.recording {
            return Err(driver_error(OP, format!("{list:?} is not recording")));
        }
        if target.state.in_pass() {
            return Err(driver_error(OP, "command list ends inside a render pass"));
        }
        unsafe { self.core.logical.end_command_buffer(target.raw) }.driver_err(OP)?;
        target.state.recording = false;
        Ok(())
    }

    fn destroy_command_list(&mut self, list: CommandListId) -> Result<()> {
        let target = self
            .command_lists
            .remove(&list)
            .ok_or_else(|| driver_error("destroy_command_list", format!("unknown command list {list:?}")))?;
        unsafe { self.core.logical.destroy_command_pool(target.pool, None) };
        Ok(())
    }

    fn create_signal(&mut self) -> Result<SignalId> {
        let semaphore = unsafe {
            self.core
                .logical
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .driver_err("create_signal")?;
        let id = SignalId(self.next_id());
        self.signals.insert(id, semaphore);
        Ok(id)
    }

    fn destroy_signal(&mut self, signal: SignalId) -> Result<()> {
        let raw = self
            .signals
            .remove(&signal)
            .ok_or_else(|| driver_error("destroy_signal", format!("unknown signal {signal:?}")))?;
        unsafe { self.core.logical.destroy_semaphore(raw, None) };
        Ok(())
    }

    fn submit(&mut self, submission: &Submission) -> Result<()> {
        const OP: &str = "submit";
        let (queue, command_buffers) = match submission.command_list {
            Some(list) => {
                let target = self
                    .command_lists
                    .get(&list)
                    .ok_or_else(|| driver_error(OP, format!("unknown command list {list:?}")))?;
                if target.state.recording {
                    return Err(driver_error(OP, format!("{list:?} is still recording")));
                }
                (
                    self.queue(target.queue).handle,
                    vec![vk::CommandBufferSubmitInfo::default().command_buffer(target.raw)],
                )
            }
            None => (self.core.graphics.handle, Vec::new()),
        };
        let waits = match submission.wait {
            Some(wait) => vec![vk::SemaphoreSubmitInfo::default()
                .semaphore(self.signal(OP, wait)?)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)],
            None => Vec::new(),
        };
        let signals = match submission.signal {
            Some(signal) => vec![vk::SemaphoreSubmitInfo::default()
                .semaphore(self.signal(OP, signal)?)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)],
            None => Vec::new(),
        };
        let info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);
        unsafe { self.core.logical.queue_submit2(queue, &[info], vk::Fence::null()) }.driver_err(OP)?;
        self.stats.submissions += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.core.logical.device_wait_idle() }.driver_err("wait_idle")
    }

    fn acquire_next_image(&mut self, signal: SignalId) -> Result<u32> {
        const OP: &str = "acquire_next_image";
        const MAX_ATTEMPTS: u32 = 3;
        if self.surface.is_none() {
            return Err(configuration_error(OP, "device has no surface"));
        }
        if self.resize_requested {
            self.resize_requested = false;
            self.rebuild_surface()?;
        }
        let semaphore = self.signal(OP, signal)?;
        for _ in 0..MAX_ATTEMPTS {
            let surface = self
                .surface
                .as_mut()
                .ok_or_else(|| configuration_error(OP, "device has no surface"))?;
            if let Some(index) = surface.acquired {
                return Err(driver_error(OP, format!("image {index} is still acquired and was never presented")));
            }
            match surface.swapchain.acquire(semaphore)? {
                (_, SwapStatus::OutOfDate) => self.rebuild_surface()?,
                (index, status) => {
                    surface.acquired = Some(index);
                    self.resize_requested |= status == SwapStatus::Suboptimal;
                    return Ok(index);
                }
            }
        }
        Err(driver_error(OP, "swapchain stayed out of date after rebuilding"))
    }

    fn present(&mut self, image_index: u32, wait: Option<SignalId>) -> Result<()> {
        const OP: &str = "present";
        let wait = match wait {
            Some(wait) => vec![self.signal(OP, wait)?],
            None => Vec::new(),
        };
        let queue = self.core.graphics.handle;
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| configuration_error(OP, "device has no surface"))?;
        if surface.acquired != Some(image_index) {
            return Err(driver_error(OP, format!("image {image_index} was not acquired")));
        }
        let status = surface.swapchain.present(queue, image_index, &wait)?;
        surface.acquired = None;
        if status != SwapStatus::Optimal {
            self.resize_requested = true;
        }
        self.stats.presents += 1;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.core.logical.device_wait_idle() {
                log::error!("Device did not go idle before teardown: {}", err);
            }
            let device = &self.core.logical;
            for (_, list) in self.command_lists.drain() {
                device.destroy_command_pool(list.pool, None);
            }
            for (_, semaphore) in self.signals.drain() {
                device.destroy_semaphore(semaphore, None);
            }
            for (_, pipeline) in self.pipelines.drain() {
                device.destroy_pipeline(pipeline.raw, None);
            }
            let sets: Vec<_> = self.binding_sets.drain().map(|(_, set)| set.set).collect();
            self.descriptors.free(&DescriptorAshDevice(device), sets);
            self.descriptors.cleanup(&DescriptorAshDevice(device));
            self.layouts.destroy(device);
            for (_, sampler) in self.samplers.drain() {
                device.destroy_sampler(sampler, None);
            }
            self.targets.clear();
            let allocator = &mut *self.allocator;
            for (_, mut buffer) in self.buffers.drain() {
                if let Err(err) = buffer.destroy(device, allocator) {
                    log::error!("{}", err);
                }
            }
            for (_, mut image) in self.images.drain() {
                if let Err(err) = image.destroy(device, allocator) {
                    log::error!("{}", err);
                }
            }
            if let Some(mut surface) = self.surface.take() {
                surface.swapchain.destroy();
                surface.loader.destroy_surface(surface.raw, None);
            }
            ManuallyDrop::drop(&mut self.allocator);
            device.destroy_device(None);
            self.instance.destroy();
        }
    }
}
