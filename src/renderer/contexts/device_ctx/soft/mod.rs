pub mod program;
mod raster;
mod texel;

use std::collections::{BTreeMap, HashMap};
use color_eyre::Result;
use glam::{Vec2, Vec4};
use smallvec::SmallVec;
use crate::renderer::config::{BackendKind, RenderConfig};
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::{validate_pipeline_formats, GpuDevice};
use crate::renderer::error::{configuration_error, driver_error};
use crate::renderer::util;
use program::{TextureLookup, TextureView, UniformView};
use raster::{Attachments, DrawState};

/// Describes a soft device. `SoftDevice::from_config` covers the common case.
#[derive(Debug, Clone)]
pub struct SoftDeviceDesc {
    pub name: String,
    pub limits: DeviceLimits,
    pub format_support: FormatSupport,
    /// Simulated presentation surface: extent and number of images in the ring.
    pub surface: Option<(Extent2D, u32)>,
    pub surface_format: TextureFormat,
}

impl Default for SoftDeviceDesc {
    fn default() -> Self {
        Self {
            name: "soft".to_string(),
            limits: DeviceLimits::default(),
            format_support: FormatSupport::all(),
            surface: None,
            surface_format: TextureFormat::Bgra8Unorm,
        }
    }
}

struct SoftBuffer {
    kind: BufferKind,
    data: Vec<u8>,
}

struct SoftImage {
    extent: Extent2D,
    format: TextureFormat,
    levels: Vec<Vec<u8>>,
    layouts: Vec<ImageLayout>,
}

impl SoftImage {
    fn level_extent(&self, level: u32) -> Extent2D {
        Extent2D::new(
            util::mip_extent(self.extent.width, level),
            util::mip_extent(self.extent.height, level),
        )
    }
}

struct SoftTarget {
    extent: Extent2D,
    color_format: TextureFormat,
    depth_format: Option<TextureFormat>,
    color: ImageId,
    depth: Option<ImageId>,
}

struct SoftBindingSet {
    layout: BindingLayoutDesc,
    resources: BTreeMap<u32, BindingResource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Initial,
    Recording,
    Executable,
    /// Submitted once; must be begun again before the next submit.
    Consumed,
}

struct SoftCommandList {
    state: ListState,
    commands: Vec<Command>,
}

struct SoftSurface {
    extent: Extent2D,
    format: TextureFormat,
    images: Vec<ImageId>,
    depth: ImageId,
    next: u32,
    acquired: Option<u32>,
}

/// Draw state accumulated while a command list executes.
#[derive(Default)]
struct ExecState {
    pass: Option<PassState>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    pipeline: Option<PipelineId>,
    binding_set: Option<BindingSetId>,
    vertex_buffers: SmallVec<[Option<BufferId>; 4]>,
    index_buffer: Option<(BufferId, IndexFormat)>,
}

#[derive(Clone, Copy)]
struct PassState {
    target: RenderTarget,
    extent: Extent2D,
    color_format: TextureFormat,
    depth_format: Option<TextureFormat>,
    color: ImageId,
    depth: Option<ImageId>,
}

/// CPU reference device. Executes command lists at submit and keeps every
/// resource in host memory, so rendering results can be read back in tests
/// on machines without a GPU.
pub struct SoftDevice {
    name: String,
    limits: DeviceLimits,
    format_support: FormatSupport,
    stats: DeviceStats,
    next_id: u64,
    buffers: HashMap<BufferId, SoftBuffer>,
    images: HashMap<ImageId, SoftImage>,
    samplers: HashMap<SamplerId, SamplerDesc>,
    targets: HashMap<TargetId, SoftTarget>,
    pipelines: HashMap<PipelineId, PipelineDesc>,
    binding_sets: HashMap<BindingSetId, SoftBindingSet>,
    command_lists: HashMap<CommandListId, SoftCommandList>,
    /// Binary signals: raised or not.
    signals: HashMap<SignalId, bool>,
    surface: Option<SoftSurface>,
    surface_desc: Option<(Extent2D, u32, TextureFormat)>,
    resize_requested: bool,
}

impl SoftDevice {
    pub fn new(desc: SoftDeviceDesc) -> Self {
        let mut device = Self {
            name: desc.name,
            limits: desc.limits,
            format_support: desc.format_support,
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
            surface_desc: desc
                .surface
                .map(|(extent, count)| (extent, count.max(1), desc.surface_format)),
            resize_requested: false,
        };
        device.build_surface();
        device
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(SoftDeviceDesc {
            surface: config
                .surface_extent
                .map(|(w, h)| (Extent2D::new(w, h), config.surface_image_count)),
            ..Default::default()
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_image(&mut self, extent: Extent2D, format: TextureFormat, mip_levels: u32) -> ImageId {
        let bpp = format.bytes_per_pixel() as usize;
        let levels = (0..mip_levels)
            .map(|level| {
                let w = util::mip_extent(extent.width, level) as usize;
                let h = util::mip_extent(extent.height, level) as usize;
                vec![0u8; w * h * bpp]
            })
            .collect();
        let id = ImageId(self.next_id());
        self.images.insert(
            id,
            SoftImage {
                extent,
                format,
                levels,
                layouts: vec![ImageLayout::Undefined; mip_levels as usize],
            },
        );
        id
    }

    fn build_surface(&mut self) {
        let Some((extent, count, format)) = self.surface_desc else {
            return;
        };
        if let Some(old) = self.surface.take() {
            for image in old.images.into_iter().chain(std::iter::once(old.depth)) {
                self.images.remove(&image);
            }
        }
        let images = (0..count).map(|_| self.alloc_image(extent, format, 1)).collect();
        let depth = self.alloc_image(extent, TextureFormat::Depth32Float, 1);
        self.surface = Some(SoftSurface {
            extent,
            format,
            images,
            depth,
            next: 0,
            acquired: None,
        });
        log::debug!("Soft surface built: {}x{} with {} images", extent.width, extent.height, count);
    }

    /// Changes the simulated window size; the surface is rebuilt at the next acquire.
    pub fn resize_surface(&mut self, extent: Extent2D) {
        if let Some(desc) = self.surface_desc.as_mut() {
            desc.0 = extent;
            self.resize_requested = true;
        }
    }

    fn buffer(&self, op: &'static str, id: BufferId) -> Result<&SoftBuffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| driver_error(op, format!("unknown buffer {id:?}")))
    }

    fn image(&self, op: &'static str, id: ImageId) -> Result<&SoftImage> {
        self.images
            .get(&id)
            .ok_or_else(|| driver_error(op, format!("unknown image {id:?}")))
    }

    fn image_mut(&mut self, op: &'static str, id: ImageId) -> Result<&mut SoftImage> {
        self.images
            .get_mut(&id)
            .ok_or_else(|| driver_error(op, format!("unknown image {id:?}")))
    }

    fn require_layout(&self, op: &'static str, id: ImageId, level: u32, layout: ImageLayout) -> Result<()> {
        let image = self.image(op, id)?;
        match image.layouts.get(level as usize) {
            Some(current) if *current == layout => Ok(()),
            Some(current) => Err(driver_error(
                op,
                format!("{id:?} mip {level} is in {current:?}, expected {layout:?}"),
            )),
            None => Err(driver_error(op, format!("{id:?} has no mip level {level}"))),
        }
    }

    fn consume_signal(&mut self, op: &'static str, signal: SignalId) -> Result<()> {
        match self.signals.get_mut(&signal) {
            Some(raised) if *raised => {
                *raised = false;
                Ok(())
            }
            // A wait on a signal nothing will raise would hang a real queue forever
            Some(_) => Err(driver_error(op, format!("waits on {signal:?}, which is not pending"))),
            None => Err(driver_error(op, format!("unknown signal {signal:?}"))),
        }
    }

    fn raise_signal(&mut self, op: &'static str, signal: SignalId) -> Result<()> {
        match self.signals.get_mut(&signal) {
            Some(raised) if !*raised => {
                *raised = true;
                Ok(())
            }
            Some(_) => Err(driver_error(op, format!("{signal:?} is raised again before being waited on"))),
            None => Err(driver_error(op, format!("unknown signal {signal:?}"))),
        }
    }

    fn resolve_pass(&self, target: RenderTarget) -> Result<PassState> {
        const OP: &str = "begin_render_pass";
        match target {
            RenderTarget::Surface => {
                let surface = self
                    .surface
                    .as_ref()
                    .ok_or_else(|| driver_error(OP, "device has no surface"))?;
                let index = surface
                    .acquired
                    .ok_or_else(|| driver_error(OP, "no surface image is acquired"))?;
                Ok(PassState {
                    target,
                    extent: surface.extent,
                    color_format: surface.format,
                    depth_format: Some(TextureFormat::Depth32Float),
                    color: surface.images[index as usize],
                    depth: Some(surface.depth),
                })
            }
            RenderTarget::Offscreen(id) => {
                let t = self
                    .targets
                    .get(&id)
                    .ok_or_else(|| driver_error(OP, format!("unknown target {id:?}")))?;
                Ok(PassState {
                    target,
                    extent: t.extent,
                    color_format: t.color_format,
                    depth_format: t.depth_format,
                    color: t.color,
                    depth: t.depth,
                })
            }
        }
    }

    fn execute(&mut self, commands: &[Command]) -> Result<()> {
        let mut exec = ExecState::default();
        for command in commands {
            self.execute_one(&mut exec, command)?;
        }
        if exec.pass.is_some() {
            return Err(driver_error("submit", "command list ends inside a render pass"));
        }
        Ok(())
    }

    fn execute_one(&mut self, exec: &mut ExecState, command: &Command) -> Result<()> {
        const OP: &str = "submit";
        match command {
            Command::BeginRenderPass { target, clear_color, clear_depth } => {
                if exec.pass.is_some() {
                    return Err(driver_error(OP, "render pass begun inside another"));
                }
                let pass = self.resolve_pass(*target)?;
                let color = self.image_mut(OP, pass.color)?;
                color.layouts[0] = ImageLayout::ColorAttachment;
                if let Some(c) = clear_color {
                    texel::fill(pass.color_format, Vec4::from_array(*c), &mut color.levels[0]);
                }
                if let Some(depth_id) = pass.depth {
                    let depth = self.image_mut(OP, depth_id)?;
                    depth.layouts[0] = ImageLayout::DepthAttachment;
                    if let Some(d) = clear_depth {
                        texel::fill(TextureFormat::Depth32Float, Vec4::splat(*d), &mut depth.levels[0]);
                    }
                }
                let full = Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: pass.extent.width as f32,
                    height: pass.extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                exec.viewport = Some(full);
                exec.scissor = Some(ScissorRect {
                    x: 0,
                    y: 0,
                    width: pass.extent.width,
                    height: pass.extent.height,
                });
                exec.pass = Some(pass);
            }
            Command::EndRenderPass => {
                let pass = exec
                    .pass
                    .take()
                    .ok_or_else(|| driver_error(OP, "render pass ended without being begun"))?;
                if pass.target.is_surface() {
                    self.image_mut(OP, pass.color)?.layouts[0] = ImageLayout::PresentSrc;
                }
            }
            Command::SetViewport(viewport) => exec.viewport = Some(*viewport),
            Command::SetScissor(scissor) => exec.scissor = Some(*scissor),
            Command::BindPipeline(pipeline) => {
                if !self.pipelines.contains_key(pipeline) {
                    return Err(driver_error(OP, format!("unknown pipeline {pipeline:?}")));
                }
                exec.pipeline = Some(*pipeline);
            }
            Command::BindBindingSet(set) => {
                if !self.binding_sets.contains_key(set) {
                    return Err(driver_error(OP, format!("unknown binding set {set:?}")));
                }
                exec.binding_set = Some(*set);
            }
            Command::BindVertexBuffers { first_binding, buffers } => {
                for (i, buffer) in buffers.iter().enumerate() {
                    self.buffer(OP, *buffer)?;
                    let slot = *first_binding as usize + i;
                    if exec.vertex_buffers.len() <= slot {
                        exec.vertex_buffers.resize(slot + 1, None);
                    }
                    exec.vertex_buffers[slot] = Some(*buffer);
                }
            }
            Command::BindIndexBuffer { buffer, format } => {
                self.buffer(OP, *buffer)?;
                exec.index_buffer = Some((*buffer, *format));
            }
            Command::Draw { vertex_count, first_vertex } => {
                let vertices: Vec<u32> = (*first_vertex..first_vertex + vertex_count).collect();
                self.draw(exec, &vertices)?;
            }
            Command::DrawIndexed { index_count, first_index, vertex_offset } => {
                let (buffer, format) = exec
                    .index_buffer
                    .ok_or_else(|| driver_error(OP, "indexed draw without an index buffer"))?;
                let data = &self.buffer(OP, buffer)?.data;
                let size = format.size() as usize;
                let start = *first_index as usize * size;
                let bytes = data
                    .get(start..start + *index_count as usize * size)
                    .ok_or_else(|| driver_error(OP, "index range exceeds the index buffer"))?;
                let vertices = bytes
                    .chunks_exact(size)
                    .map(|chunk| {
                        let index = match format {
                            IndexFormat::Uint16 => u16::from_le_bytes([chunk[0], chunk[1]]) as i64,
                            IndexFormat::Uint32 => {
                                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64
                            }
                        };
                        (index + *vertex_offset as i64).max(0) as u32
                    })
                    .collect::<Vec<_>>();
                self.draw(exec, &vertices)?;
            }
            Command::CopyBuffer { src, dst, size } => {
                let size = *size as usize;
                let bytes = self
                    .buffer(OP, *src)?
                    .data
                    .get(..size)
                    .ok_or_else(|| driver_error(OP, "copy reads past the source buffer"))?
                    .to_vec();
                let dst = self
                    .buffers
                    .get_mut(dst)
                    .ok_or_else(|| driver_error(OP, format!("unknown buffer {dst:?}")))?;
                dst.data
                    .get_mut(..size)
                    .ok_or_else(|| driver_error(OP, "copy writes past the destination buffer"))?
                    .copy_from_slice(&bytes);
            }
            Command::CopyBufferToImage { buffer, image, mip_level } => {
                self.require_layout(OP, *image, *mip_level, ImageLayout::TransferDst)?;
                let len = self.image(OP, *image)?.levels[*mip_level as usize].len();
                let bytes = self
                    .buffer(OP, *buffer)?
                    .data
                    .get(..len)
                    .ok_or_else(|| driver_error(OP, "staging buffer is smaller than the mip level"))?
                    .to_vec();
                self.image_mut(OP, *image)?.levels[*mip_level as usize] = bytes;
            }
            Command::CopyImageToBuffer { image, buffer } => {
                self.require_layout(OP, *image, 0, ImageLayout::TransferSrc)?;
                let bytes = self.image(OP, *image)?.levels[0].clone();
                let dst = self
                    .buffers
                    .get_mut(buffer)
                    .ok_or_else(|| driver_error(OP, format!("unknown buffer {buffer:?}")))?;
                dst.data
                    .get_mut(..bytes.len())
                    .ok_or_else(|| driver_error(OP, "readback buffer is smaller than the image"))?
                    .copy_from_slice(&bytes);
            }
            Command::TransitionImage { image, base_mip, mip_count, layout } => {
                let target = self.image_mut(OP, *image)?;
                let end = (*base_mip + *mip_count) as usize;
                if end > target.layouts.len() {
                    return Err(driver_error(OP, format!("{image:?} has only {} mips", target.layouts.len())));
                }
                for current in &mut target.layouts[*base_mip as usize..end] {
                    *current = *layout;
                }
            }
            Command::BlitMip { image, src_level } => {
                let dst_level = src_level + 1;
                self.require_layout(OP, *image, *src_level, ImageLayout::TransferSrc)?;
                self.require_layout(OP, *image, dst_level, ImageLayout::TransferDst)?;
                let target = self.image_mut(OP, *image)?;
                let (src, dst) = (target.level_extent(*src_level), target.level_extent(dst_level));
                let format = target.format;
                let bpp = format.bytes_per_pixel() as usize;
                let mut out = vec![0u8; dst.pixel_count() * bpp];
                for y in 0..dst.height {
                    for x in 0..dst.width {
                        let uv = Vec2::new(
                            (x as f32 + 0.5) / dst.width as f32,
                            (y as f32 + 0.5) / dst.height as f32,
                        );
                        let color = raster::sample_level(format, src, &target.levels[*src_level as usize], uv, true);
                        let start = (y * dst.width + x) as usize * bpp;
                        texel::encode(format, color, &mut out[start..start + bpp]);
                    }
                }
                target.levels[dst_level as usize] = out;
            }
        }
        Ok(())
    }

    fn draw(&mut self, exec: &ExecState, vertices: &[u32]) -> Result<()> {
        const OP: &str = "draw";
        let pass = exec
            .pass
            .ok_or_else(|| driver_error(OP, "draw outside a render pass"))?;
        let pipeline_id = exec
            .pipeline
            .ok_or_else(|| driver_error(OP, "draw without a bound pipeline"))?;
        let pipeline = self
            .pipelines
            .get(&pipeline_id)
            .ok_or_else(|| driver_error(OP, format!("unknown pipeline {pipeline_id:?}")))?;
        if pipeline.color_format != pass.color_format || pipeline.depth_format != pass.depth_format {
            return Err(driver_error(
                OP,
                format!("pipeline `{}` does not match the attachments of {:?}", pipeline.label, pass.target),
            ));
        }

        let mut color = std::mem::take(&mut self.image_mut(OP, pass.color)?.levels[0]);
        let mut depth = match pass.depth {
            Some(id) => Some(std::mem::take(&mut self.image_mut(OP, id)?.levels[0])),
            None => None,
        };
        let result = self.rasterize(exec, pipeline_id, &pass, &mut color, depth.as_deref_mut(), vertices);

        self.image_mut(OP, pass.color)?.levels[0] = color;
        if let (Some(id), Some(depth)) = (pass.depth, depth) {
            self.image_mut(OP, id)?.levels[0] = depth;
        }
        result
    }

    fn rasterize(
        &self,
        exec: &ExecState,
        pipeline_id: PipelineId,
        pass: &PassState,
        color: &mut [u8],
        depth: Option<&mut [u8]>,
        vertices: &[u32],
    ) -> Result<()> {
        const OP: &str = "draw";
        let pipeline = self
            .pipelines
            .get(&pipeline_id)
            .ok_or_else(|| driver_error(OP, format!("unknown pipeline {pipeline_id:?}")))?;
        let shader = pipeline
            .program
            .soft_shader()
            .ok_or_else(|| driver_error(OP, "pipeline program has no soft implementation"))?;

        let empty = BTreeMap::new();
        let resources = match exec.binding_set {
            Some(id) => {
                let set = self
                    .binding_sets
                    .get(&id)
                    .ok_or_else(|| driver_error(OP, format!("unknown binding set {id:?}")))?;
                if set.layout != pipeline.binding_layout {
                    return Err(driver_error(OP, "bound binding set does not match the pipeline layout"));
                }
                &set.resources
            }
            None if pipeline.binding_layout.entries.is_empty() => &empty,
            None => return Err(driver_error(OP, "pipeline expects a binding set")),
        };

        let mut blocks = Vec::with_capacity(pipeline.binding_layout.entries.len());
        for entry in &pipeline.binding_layout.entries {
            let resource = resources
                .get(&entry.binding)
                .ok_or_else(|| driver_error(OP, format!("binding {} was never written", entry.binding)))?;
            match resource {
                BindingResource::Buffer { buffer, offset, size } => {
                    let data = &self.buffer(OP, *buffer)?.data;
                    let bytes = data
                        .get(*offset as usize..(*offset + *size) as usize)
                        .ok_or_else(|| driver_error(OP, "uniform range exceeds its buffer"))?;
                    blocks.push((entry.binding, bytes));
                }
                BindingResource::Image(image) => {
                    self.require_layout(OP, *image, 0, ImageLayout::ShaderRead)?;
                }
                BindingResource::Sampler(_) => {}
            }
        }

        let vertex_buffers = exec
            .vertex_buffers
            .iter()
            .map(|slot| match slot {
                Some(id) => self.buffer(OP, *id).map(|b| Some(b.data.as_slice())),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;

        let layout = pipeline.program.layout();
        let uniforms = UniformView::new(layout, blocks);
        let lookup = BoundTextures {
            device: self,
            resources,
        };
        let textures = TextureView::new(layout, &lookup);
        let full = Viewport {
            x: 0.0,
            y: 0.0,
            width: pass.extent.width as f32,
            height: pass.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let state = DrawState {
            pipeline,
            shader: shader.as_ref(),
            uniforms: &uniforms,
            textures: &textures,
            vertex_buffers: &vertex_buffers,
            viewport: exec.viewport.unwrap_or(full),
            scissor: exec.scissor.unwrap_or(ScissorRect {
                x: 0,
                y: 0,
                width: pass.extent.width,
                height: pass.extent.height,
            }),
        };
        let mut attachments = Attachments {
            extent: pass.extent,
            color_format: pass.color_format,
            color,
            depth,
        };
        raster::draw(&state, &mut attachments, vertices).map_err(|e| driver_error(OP, e))
    }
}

/// Samples the images written into a binding set.
struct BoundTextures<'a> {
    device: &'a SoftDevice,
    resources: &'a BTreeMap<u32, BindingResource>,
}

impl TextureLookup for BoundTextures<'_> {
    fn sample(&self, texture_binding: u32, sampler_binding: Option<u32>, uv: Vec2) -> Vec4 {
        let Some(BindingResource::Image(id)) = self.resources.get(&texture_binding) else {
            return Vec4::ZERO;
        };
        let Some(image) = self.device.images.get(id) else {
            return Vec4::ZERO;
        };
        let sampler = sampler_binding
            .and_then(|binding| match self.resources.get(&binding) {
                Some(BindingResource::Sampler(s)) => self.device.samplers.get(s).copied(),
                _ => None,
            })
            .unwrap_or_default();

        let wrap = |c: f32| match sampler.address_mode {
            AddressMode::Repeat => c - c.floor(),
            AddressMode::MirrorRepeat => {
                let t = c.rem_euclid(2.0);
                if t > 1.0 { 2.0 - t } else { t }
            }
            AddressMode::ClampToEdge => c.clamp(0.0, 1.0),
        };
        raster::sample_level(
            image.format,
            image.extent,
            &image.levels[0],
            Vec2::new(wrap(uv.x), wrap(uv.y)),
            sampler.filter == FilterMode::Linear,
        )
    }
}

impl GpuDevice for SoftDevice {
    fn backend(&self) -> BackendKind {
        BackendKind::Soft
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
            live_images: self.images.len() as u64,
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
        let id = BufferId(self.next_id());
        self.buffers.insert(
            id,
            SoftBuffer {
                kind: desc.kind,
                data: vec![0u8; desc.size as usize],
            },
        );
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
        let start = offset as usize;
        target
            .data
            .get_mut(start..start + data.len())
            .ok_or_else(|| driver_error(OP, "write exceeds the buffer size"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: u64, len: usize) -> Result<Vec<u8>> {
        const OP: &str = "read_buffer";
        let source = self.buffer(OP, buffer)?;
        if !source.kind.is_host_visible() {
            return Err(driver_error(OP, format!("{buffer:?} is not host visible")));
        }
        let start = offset as usize;
        Ok(source
            .data
            .get(start..start + len)
            .ok_or_else(|| driver_error(OP, "read exceeds the buffer size"))?
            .to_vec())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<()> {
        self.buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| driver_error("destroy_buffer", format!("unknown buffer {buffer:?}")))
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
        Ok(self.alloc_image(desc.extent, desc.format, desc.mip_levels))
    }

    fn destroy_image(&mut self, image: ImageId) -> Result<()> {
        self.images
            .remove(&image)
            .map(|_| ())
            .ok_or_else(|| driver_error("destroy_image", format!("unknown image {image:?}")))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId> {
        let id = SamplerId(self.next_id());
        self.samplers.insert(id, *desc);
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) -> Result<()> {
        self.samplers
            .remove(&sampler)
            .map(|_| ())
            .ok_or_else(|| driver_error("destroy_sampler", format!("unknown sampler {sampler:?}")))
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
        let color = self.alloc_image(desc.extent, desc.color_format, 1);
        let depth = desc
            .depth_format
            .map(|format| self.alloc_image(desc.extent, format, 1));
        let id = TargetId(self.next_id());
        self.targets.insert(
            id,
            SoftTarget {
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
        self.images.remove(&t.color);
        if let Some(depth) = t.depth {
            self.images.remove(&depth);
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
                    extent: surface.extent,
                    color_format: surface.format,
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
        if desc.program.soft_shader().is_none() {
            return Err(configuration_error(
                "create_pipeline",
                format!("program `{}` has no soft implementation", desc.program.name()),
            ));
        }
        let id = PipelineId(self.next_id());
        self.pipelines.insert(id, desc.clone());
        self.stats.pipelines_created += 1;
        log::debug!("Soft pipeline {:?} created for `{}`", id, desc.label);
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        self.pipelines
            .remove(&pipeline)
            .ok_or_else(|| driver_error("destroy_pipeline", format!("unknown pipeline {pipeline:?}")))?;
        self.stats.pipelines_destroyed += 1;
        Ok(())
    }

    fn create_binding_set(&mut self, layout: &BindingLayoutDesc) -> Result<BindingSetId> {
        let id = BindingSetId(self.next_id());
        self.binding_sets.insert(
            id,
            SoftBindingSet {
                layout: layout.clone(),
                resources: BTreeMap::new(),
            },
        );
        self.stats.binding_sets_created += 1;
        Ok(id)
    }

    fn write_binding_set(&mut self, set: BindingSetId, writes: &[BindingWrite]) -> Result<()> {
        const OP: &str = "write_binding_set";
        for write in writes {
            let exists = match write.resource {
                BindingResource::Buffer { buffer, .. } => self.buffers.contains_key(&buffer),
                BindingResource::Image(image) => self.images.contains_key(&image),
                BindingResource::Sampler(sampler) => self.samplers.contains_key(&sampler),
            };
            if !exists {
                return Err(driver_error(OP, format!("binding {} refers to a destroyed resource", write.binding)));
            }
        }
        let target = self
            .binding_sets
            .get_mut(&set)
            .ok_or_else(|| driver_error(OP, format!("unknown binding set {set:?}")))?;
        for write in writes {
            let entry = target
                .layout
                .entry(write.binding)
                .ok_or_else(|| driver_error(OP, format!("binding {} is not in the layout", write.binding)))?;
            let matches = matches!(
                (entry.kind, write.resource),
                (BindingKind::UniformBuffer { .. }, BindingResource::Buffer { .. })
                    | (BindingKind::SampledImage, BindingResource::Image(_))
                    | (BindingKind::Sampler, BindingResource::Sampler(_))
            );
            if !matches {
                return Err(driver_error(OP, format!("binding {} written with the wrong resource kind", write.binding)));
            }
            target.resources.insert(write.binding, write.resource);
        }
        Ok(())
    }

    fn destroy_binding_set(&mut self, set: BindingSetId) -> Result<()> {
        self.binding_sets
            .remove(&set)
            .ok_or_else(|| driver_error("destroy_binding_set", format!("unknown binding set {set:?}")))?;
        self.stats.binding_sets_destroyed += 1;
        Ok(())
    }

    fn create_command_list(&mut self, _queue: QueueKind) -> Result<CommandListId> {
        let id = CommandListId(self.next_id());
        self.command_lists.insert(
            id,
            SoftCommandList {
                state: ListState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(id)
    }

    fn begin_commands(&mut self, list: CommandListId) -> Result<()> {
        let target = self
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| driver_error("begin_commands", format!("unknown command list {list:?}")))?;
        target.commands.clear();
        target.state = ListState::Recording;
        Ok(())
    }

    fn record(&mut self, list: CommandListId, command: &Command) -> Result<()> {
        const OP: &str = "record";
        let target = self
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| driver_error(OP, format!("unknown command list {list:?}")))?;
        if target.state != ListState::Recording {
            return Err(driver_error(OP, format!("{list:?} is not recording")));
        }
        target.commands.push(command.clone());
        Ok(())
    }

    fn end_commands(&mut self, list: CommandListId) -> Result<()> {
        const OP: &str = "end_commands";
        let target = self
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| driver_error(OP, format!("unknown command list {list:?}")))?;
        if target.state != ListState::Recording {
            return Err(driver_error(OP, format!("{list:?} is not recording")));
        }
        target.state = ListState::Executable;
        Ok(())
    }

    fn destroy_command_list(&mut self, list: CommandListId) -> Result<()> {
        self.command_lists
            .remove(&list)
            .map(|_| ())
            .ok_or_else(|| driver_error("destroy_command_list", format!("unknown command list {list:?}")))
    }

    fn create_signal(&mut self) -> Result<SignalId> {
        let id = SignalId(self.next_id());
        self.signals.insert(id, false);
        Ok(id)
    }

    fn destroy_signal(&mut self, signal: SignalId) -> Result<()> {
        self.signals
            .remove(&signal)
            .map(|_| ())
            .ok_or_else(|| driver_error("destroy_signal", format!("unknown signal {signal:?}")))
    }

    fn submit(&mut self, submission: &Submission) -> Result<()> {
        const OP: &str = "submit";
        let commands = match submission.command_list {
            Some(list) => {
                let target = self
                    .command_lists
                    .get_mut(&list)
                    .ok_or_else(|| driver_error(OP, format!("unknown command list {list:?}")))?;
                if target.state != ListState::Executable {
                    return Err(driver_error(OP, format!("{list:?} is {:?}, not executable", target.state)));
                }
                target.state = ListState::Consumed;
                std::mem::take(&mut target.commands)
            }
            None => Vec::new(),
        };

        if let Some(wait) = submission.wait {
            self.consume_signal(OP, wait)?;
        }
        self.execute(&commands)?;
        if let Some(signal) = submission.signal {
            self.raise_signal(OP, signal)?;
        }

        if let Some(list) = submission.command_list {
            if let Some(target) = self.command_lists.get_mut(&list) {
                target.commands = commands;
            }
        }
        self.stats.submissions += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        // Work executes at submit; nothing is ever in flight.
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: SignalId) -> Result<u32> {
        const OP: &str = "acquire_next_image";
        if self.resize_requested {
            self.resize_requested = false;
            self.build_surface();
        }
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| configuration_error(OP, "device has no surface"))?;
        if let Some(index) = surface.acquired {
            return Err(driver_error(OP, format!("image {index} is still acquired and was never presented")));
        }
        let index = surface.next;
        surface.next = (surface.next + 1) % surface.images.len() as u32;
        surface.acquired = Some(index);
        self.raise_signal(OP, signal)?;
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: Option<SignalId>) -> Result<()> {
        const OP: &str = "present";
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| configuration_error(OP, "device has no surface"))?;
        if surface.acquired != Some(image_index) {
            return Err(driver_error(OP, format!("image {image_index} was not acquired")));
        }
        let image = surface.images[image_index as usize];
        if let Some(wait) = wait {
            self.consume_signal(OP, wait)?;
        }
        self.require_layout(OP, image, 0, ImageLayout::PresentSrc)?;
        if let Some(surface) = self.surface.as_mut() {
            surface.acquired = None;
        }
        self.stats.presents += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::error::classify;

    fn offscreen(device: &mut SoftDevice, format: TextureFormat) -> TargetId {
        device
            .create_offscreen_target(&OffscreenTargetDesc {
                label: "test",
                extent: Extent2D::new(2, 2),
                color_format: format,
                depth_format: None,
            })
            .unwrap()
    }

    fn submit_commands(device: &mut SoftDevice, commands: &[Command]) -> Result<()> {
        let list = device.create_command_list(QueueKind::Graphics)?;
        device.begin_commands(list)?;
        for command in commands {
            device.record(list, command)?;
        }
        device.end_commands(list)?;
        device.submit(&Submission {
            command_list: Some(list),
            ..Default::default()
        })
    }

    fn read_color(device: &mut SoftDevice, target: TargetId) -> Vec<u8> {
        let info = device.target_info(RenderTarget::Offscreen(target)).unwrap();
        let image = info.color_image.unwrap();
        let size = info.extent.pixel_count() as u64 * info.color_format.bytes_per_pixel() as u64;
        let buffer = device
            .create_buffer(&BufferDesc {
                label: "readback",
                size,
                kind: BufferKind::Readback,
            })
            .unwrap();
        submit_commands(
            device,
            &[
                Command::TransitionImage {
                    image,
                    base_mip: 0,
                    mip_count: 1,
                    layout: ImageLayout::TransferSrc,
                },
                Command::CopyImageToBuffer { image, buffer },
            ],
        )
        .unwrap();
        device.read_buffer(buffer, 0, size as usize).unwrap()
    }

    #[test]
    fn clear_pass_fills_the_target() {
        let mut device = SoftDevice::new(SoftDeviceDesc::default());
        let target = offscreen(&mut device, TextureFormat::Rgba8Unorm);
        submit_commands(
            &mut device,
            &[
                Command::BeginRenderPass {
                    target: RenderTarget::Offscreen(target),
                    clear_color: Some([0.0, 0.0, 1.0, 1.0]),
                    clear_depth: None,
                },
                Command::EndRenderPass,
            ],
        )
        .unwrap();
        assert_eq!(read_color(&mut device, target), [0, 0, 255, 255].repeat(4));
    }

    #[test]
    fn waiting_on_an_unraised_signal_is_a_driver_error() {
        let mut device = SoftDevice::new(SoftDeviceDesc::default());
        let signal = device.create_signal().unwrap();
        let err = device
            .submit(&Submission {
                wait: Some(signal),
                ..Default::default()
            })
            .unwrap_err();
        assert!(classify(&err).unwrap().is_driver());

        device
            .submit(&Submission {
                signal: Some(signal),
                ..Default::default()
            })
            .unwrap();
        // raising twice without a wait in between is also rejected
        assert!(device
            .submit(&Submission {
                signal: Some(signal),
                ..Default::default()
            })
            .is_err());
        device
            .submit(&Submission {
                wait: Some(signal),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn command_lists_must_be_rebegun_after_submit() {
        let mut device = SoftDevice::new(SoftDeviceDesc::default());
        let list = device.create_command_list(QueueKind::Transfer).unwrap();
        device.begin_commands(list).unwrap();
        device.end_commands(list).unwrap();
        let submission = Submission {
            command_list: Some(list),
            ..Default::default()
        };
        device.submit(&submission).unwrap();
        assert!(device.submit(&submission).is_err());
        assert!(device.record(list, &Command::EndRenderPass).is_err());
    }

    #[test]
    fn copies_respect_image_layouts() {
        let mut device = SoftDevice::new(SoftDeviceDesc::default());
        let image = device
            .create_image(&ImageDesc {
                label: "texture",
                extent: Extent2D::new(1, 1),
                format: TextureFormat::Rgba8Unorm,
                mip_levels: 1,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            })
            .unwrap();
        let staging = device
            .create_buffer(&BufferDesc {
                label: "staging",
                size: 4,
                kind: BufferKind::Staging,
            })
            .unwrap();
        let err = submit_commands(
            &mut device,
            &[Command::CopyBufferToImage {
                buffer: staging,
                image,
                mip_level: 0,
            }],
        )
        .unwrap_err();
        assert!(classify(&err).unwrap().is_driver());
    }

    #[test]
    fn surface_ring_round_robins_and_requires_present_layout() {
        let mut device = SoftDevice::new(SoftDeviceDesc {
            surface: Some((Extent2D::new(4, 4), 2)),
            ..Default::default()
        });
        let acquired = device.create_signal().unwrap();
        let index = device.acquire_next_image(acquired).unwrap();
        assert_eq!(index, 0);
        assert!(device.acquire_next_image(acquired).is_err());

        // never rendered, so still in Undefined
        assert!(device.present(index, Some(acquired)).is_err());
        submit_commands(
            &mut device,
            &[
                Command::BeginRenderPass {
                    target: RenderTarget::Surface,
                    clear_color: Some([0.0; 4]),
                    clear_depth: Some(1.0),
                },
                Command::EndRenderPass,
            ],
        )
        .unwrap();
        device.present(index, None).unwrap();

        assert_eq!(device.acquire_next_image(acquired).unwrap(), 1);
        assert_eq!(device.stats().presents, 1);
    }

    #[test]
    fn unsupported_target_format_is_a_configuration_error() {
        let mut device = SoftDevice::new(SoftDeviceDesc {
            format_support: FormatSupport {
                color_attachment: vec![TextureFormat::Rgba8Unorm],
                ..FormatSupport::all()
            },
            ..Default::default()
        });
        let err = device
            .create_offscreen_target(&OffscreenTargetDesc {
                label: "hdr",
                extent: Extent2D::new(1, 1),
                color_format: TextureFormat::Rgba16Float,
                depth_format: None,
            })
            .unwrap_err();
        assert!(classify(&err).unwrap().is_configuration());
    }
}
