pub mod camera;
pub mod config;
pub mod contexts;
pub mod error;
pub mod handle;
pub mod resources;
pub mod transform;
pub mod util;

use std::sync::Arc;
use color_eyre::Result;
use glam::Mat4;
use winit::window::Window;
use crate::renderer::camera::{Camera, CameraView};
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::{create_device, GpuDevice};
use crate::renderer::contexts::frame_ctx::target_ctx::{PassSetup, RenderTargetRegistry};
use crate::renderer::contexts::frame_ctx::{FrameSummary, RenderFrameContext};
use crate::renderer::contexts::pipeline_ctx::{DrawRequest, PipelineCache, PipelineCacheStats};
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::error::configuration_error;
use crate::renderer::handle::{DrawSiteKey, HandleAllocator, SceneHandle};
use crate::renderer::resources::material::{Material, MaterialId};
use crate::renderer::resources::mesh::{Mesh, MeshData, MeshId};
use crate::renderer::resources::shader::ShaderProgram;
use crate::renderer::resources::texture::{Texture, TextureData};
use crate::renderer::transform::Transform;

/// The pass currently being recorded.
#[derive(Debug, Clone, Copy)]
struct ActivePass {
    target: RenderTarget,
    camera: SceneHandle,
    view: CameraView,
}

pub struct Renderer {
    dev: Box<dyn GpuDevice>,
    res: RenderResourceContext,
    frm: RenderFrameContext,
    pip: PipelineCache,
    tgt: RenderTargetRegistry,

    handles: HandleAllocator,
    next_material_id: u64,
    next_mesh_id: u64,
    active_pass: Option<ActivePass>,
    resize_requested: bool,
}

impl Renderer {
    /// Builds the backend named in `config`. `window` is required by the Vulkan backend.
    pub fn new(config: RenderConfig, window: Option<Arc<Window>>) -> Result<Self> {
        let dev = create_device(&config, window)?;
        Self::with_device(dev, config)
    }

    pub fn with_device(mut dev: Box<dyn GpuDevice>, config: RenderConfig) -> Result<Self> {
        let res = RenderResourceContext::new(&mut *dev)?;
        let frm = RenderFrameContext::new(&mut *dev, &config)?;
        log::info!(
            "Renderer ready on `{}` (sweep every {} frames, threshold {})",
            dev.name(),
            config.sweep_interval,
            config.eviction_threshold
        );
        Ok(Self {
            dev,
            res,
            frm,
            pip: PipelineCache::new(config.eviction_threshold),
            tgt: RenderTargetRegistry::new(),
            handles: HandleAllocator::new(),
            next_material_id: 1,
            next_mesh_id: 1,
            active_pass: None,
            resize_requested: false,
        })
    }

    pub fn device(&self) -> &dyn GpuDevice {
        &*self.dev
    }

    pub fn device_stats(&self) -> DeviceStats {
        self.dev.stats()
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pip
    }

    pub fn cache_stats(&self) -> PipelineCacheStats {
        self.pip.stats()
    }

    /// Number of render targets that currently own a command context.
    pub fn target_contexts(&self) -> usize {
        self.tgt.len()
    }

    pub fn frame_counter(&self) -> u32 {
        self.frm.counter()
    }

    pub fn fallback_texture(&self) -> &Texture {
        self.res.bindings.fallback_texture()
    }

    // Scene handles

    pub fn create_camera(&mut self) -> Camera {
        Camera::new(self.handles.allocate())
    }

    pub fn create_transform(&mut self, world: Mat4) -> Transform {
        Transform::new(self.handles.allocate(), world)
    }

    /// Retires a camera or transform handle. Cache entries keyed on it age out.
    pub fn release_handle(&mut self, handle: SceneHandle) -> bool {
        self.handles.release(handle)
    }

    // Resources

    pub fn create_material(&mut self, name: &str, program: Arc<ShaderProgram>) -> Material {
        let id = MaterialId(self.next_material_id);
        self.next_material_id += 1;
        Material::new(id, name, program)
    }

    pub fn upload_mesh(&mut self, data: &MeshData) -> Result<Mesh> {
        let id = MeshId(self.next_mesh_id);
        self.next_mesh_id += 1;
        self.res.uploader.upload_mesh(&mut *self.dev, id, data)
    }

    pub fn release_mesh(&mut self, mesh: Mesh) -> Result<()> {
        self.res.uploader.release_mesh(&mut *self.dev, mesh)
    }

    pub fn upload_texture(&mut self, data: &TextureData) -> Result<Texture> {
        self.res.uploader.upload_texture(&mut *self.dev, data)
    }

    pub fn release_texture(&mut self, texture: Texture) -> Result<()> {
        self.res.uploader.release_texture(&mut *self.dev, texture)
    }

    // Render targets

    pub fn create_offscreen_target(
        &mut self,
        width: u32,
        height: u32,
        color_format: TextureFormat,
        depth_format: Option<TextureFormat>,
    ) -> Result<RenderTarget> {
        let id = self.dev.create_offscreen_target(&OffscreenTargetDesc {
            label: "offscreen",
            extent: Extent2D::new(width, height),
            color_format,
            depth_format,
        })?;
        Ok(RenderTarget::Offscreen(id))
    }

    /// Destroys an offscreen target along with its command context and every
    /// cache entry built against it.
    pub fn destroy_render_target(&mut self, target: RenderTarget) -> Result<()> {
        const OP: &str = "destroy_render_target";
        let RenderTarget::Offscreen(id) = target else {
            return Err(configuration_error(OP, "the surface cannot be destroyed"));
        };
        if self.active_pass.is_some_and(|p| p.target == target) {
            return Err(configuration_error(OP, format!("{target:?} is recording a pass")));
        }
        if let Some(ctx) = self.tgt.get(target) {
            self.frm.release_context(&mut *self.dev, ctx)?;
        }
        let evicted = self.pip.invalidate_target(&mut *self.dev, &mut self.res.bindings, target)?;
        self.tgt.remove(&mut *self.dev, target)?;
        self.dev.destroy_offscreen_target(id)?;
        log::debug!("Destroyed {target:?} ({evicted} cache entries dropped)");
        Ok(())
    }

    pub fn target_info(&self, target: RenderTarget) -> Result<TargetInfo> {
        self.dev.target_info(target)
    }

    /// Reads an offscreen target's color attachment as tightly packed RGBA8 rows.
    pub fn read_target_pixels(&mut self, target: RenderTarget) -> Result<Vec<u8>> {
        const OP: &str = "read_target_pixels";
        if self.active_pass.is_some_and(|p| p.target == target) {
            return Err(configuration_error(OP, format!("{target:?} is recording a pass")));
        }
        let info = self.dev.target_info(target)?;
        let image = match (target, info.color_image) {
            (RenderTarget::Offscreen(_), Some(image)) => image,
            _ => return Err(configuration_error(OP, format!("{target:?} cannot be read back"))),
        };
        let mut pixels = self
            .res
            .uploader
            .read_image(&mut *self.dev, image, info.extent, info.color_format)?;
        match info.color_format {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8Srgb => {}
            TextureFormat::Bgra8Unorm | TextureFormat::Bgra8Srgb => {
                for texel in pixels.chunks_exact_mut(4) {
                    texel.swap(0, 2);
                }
            }
            other => {
                return Err(configuration_error(OP, format!("{other:?} is not an 8-bit color format")));
            }
        }
        Ok(pixels)
    }

    // Frames

    /// The surface is rebuilt at the next `begin_frame`.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn begin_frame(&mut self) -> Result<u32> {
        if self.resize_requested {
            self.dev.request_surface_resize();
            self.resize_requested = false;
        }
        self.frm.begin_frame(&mut *self.dev)
    }

    pub fn end_frame(&mut self) -> Result<FrameSummary> {
        if let Some(pass) = self.active_pass {
            return Err(configuration_error(
                "end_frame",
                format!("pass into {:?} was never ended", pass.target),
            ));
        }
        self.frm
            .end_frame(&mut *self.dev, &mut self.tgt, &mut self.pip, &mut self.res.bindings)
    }

    /// Runs `f` between `begin_frame` and `end_frame`.
    pub fn render_frame<F>(&mut self, f: F) -> Result<FrameSummary>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.begin_frame()?;
        f(self)?;
        self.end_frame()
    }

    // Passes

    pub fn begin_camera(&mut self, camera: &Camera, target: RenderTarget) -> Result<()> {
        const OP: &str = "begin_camera";
        if !self.frm.in_frame() {
            return Err(configuration_error(OP, "no frame in progress"));
        }
        if let Some(pass) = self.active_pass {
            return Err(configuration_error(
                OP,
                format!("pass into {:?} is still recording", pass.target),
            ));
        }
        if !self.handles.is_live(camera.handle()) {
            return Err(configuration_error(OP, format!("camera {:?} was released", camera.handle())));
        }
        if target.is_surface() && !self.dev.has_surface() {
            return Err(configuration_error(OP, "device has no surface"));
        }

        let info = self.dev.target_info(target)?;
        let view = camera.view_for(info.extent);
        let frame = self.frm.counter();
        let ctx = self.tgt.get_or_create(&mut *self.dev, target, frame)?;
        ctx.begin(&mut *self.dev, &PassSetup::from_view(&view), info.depth_format.is_some(), frame)?;
        self.active_pass = Some(ActivePass {
            target,
            camera: camera.handle(),
            view,
        });
        Ok(())
    }

    pub fn end_camera(&mut self, camera: &Camera, target: RenderTarget) -> Result<()> {
        const OP: &str = "end_camera";
        match self.active_pass {
            Some(pass) if pass.target == target && pass.camera == camera.handle() => {}
            Some(pass) => {
                return Err(configuration_error(
                    OP,
                    format!("recording pass is {:?} from {:?}", pass.target, pass.camera),
                ))
            }
            None => return Err(configuration_error(OP, "no pass is recording")),
        }
        let ctx = self
            .tgt
            .get_mut(target)
            .ok_or_else(|| configuration_error(OP, format!("no context for {target:?}")))?;
        self.frm.submit_pass(&mut *self.dev, ctx)?;
        self.active_pass = None;
        Ok(())
    }

    /// Draws every part of `mesh`, or all of its vertices if it has no parts.
    pub fn draw_mesh(&mut self, mesh: &Mesh, transform: &Transform, material: &Material) -> Result<()> {
        self.draw(mesh, None, transform, material)
    }

    pub fn draw_mesh_part(
        &mut self,
        mesh: &Mesh,
        part: usize,
        transform: &Transform,
        material: &Material,
    ) -> Result<()> {
        self.draw(mesh, Some(part), transform, material)
    }

    fn draw(&mut self, mesh: &Mesh, part: Option<usize>, transform: &Transform, material: &Material) -> Result<()> {
        const OP: &str = "draw_mesh";
        let pass = self
            .active_pass
            .ok_or_else(|| configuration_error(OP, "draw outside begin_camera/end_camera"))?;
        if !self.handles.is_live(transform.handle()) {
            return Err(configuration_error(OP, format!("transform {:?} was released", transform.handle())));
        }
        let parts = match part {
            Some(index) => {
                let selected = mesh.part(index).ok_or_else(|| {
                    configuration_error(
                        OP,
                        format!("mesh {:?} has {} parts, part {index} requested", mesh.id(), mesh.parts().len()),
                    )
                })?;
                std::slice::from_ref(selected)
            }
            None => mesh.parts(),
        };

        let info = self.dev.target_info(pass.target)?;
        let frame = self.frm.counter();
        let request = DrawRequest {
            site: DrawSiteKey::new(transform.handle(), pass.camera),
            material,
            mesh,
            target: pass.target,
            target_info: &info,
        };
        let entry = self.pip.get_or_build(&mut *self.dev, &mut self.res.bindings, &request, frame)?;
        self.res
            .bindings
            .update(&mut *self.dev, entry.binding_set_mut(), material, transform, &pass.view)?;
        let pipeline = entry.pipeline();
        let binding_set = entry.binding_set().id();

        let ctx = self
            .tgt
            .get_mut(pass.target)
            .ok_or_else(|| configuration_error(OP, format!("no context for {:?}", pass.target)))?;
        let dev = &mut *self.dev;
        ctx.record(dev, &Command::BindPipeline(pipeline))?;
        ctx.record(dev, &Command::BindBindingSet(binding_set))?;
        ctx.record(
            dev,
            &Command::BindVertexBuffers {
                first_binding: 0,
                buffers: mesh.vertex_buffers().iter().copied().collect(),
            },
        )?;
        if parts.is_empty() {
            ctx.record(
                dev,
                &Command::Draw {
                    vertex_count: mesh.vertex_count(),
                    first_vertex: 0,
                },
            )?;
        }
        for part in parts {
            ctx.record(
                dev,
                &Command::BindIndexBuffer {
                    buffer: part.index_buffer,
                    format: part.index_format,
                },
            )?;
            ctx.record(
                dev,
                &Command::DrawIndexed {
                    index_count: part.index_count,
                    first_index: 0,
                    vertex_offset: 0,
                },
            )?;
        }
        log::trace!(
            "Drew {:?} with `{}` into {:?} ({} parts)",
            mesh.id(),
            material.name(),
            pass.target,
            parts.len()
        );
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.dev.wait_idle()?;
        self.frm.destroy(&mut *self.dev)?;
        self.pip.clear(&mut *self.dev, &mut self.res.bindings)?;
        self.tgt.destroy_all(&mut *self.dev)?;
        self.res.destroy(&mut *self.dev)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("Renderer teardown failed: {e:?}");
        }
    }
}
