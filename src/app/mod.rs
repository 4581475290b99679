use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use color_eyre::eyre::Report;
use color_eyre::Result;
use glam::{Mat4, Vec3, Vec4};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, StartCause, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use prism::renderer::camera::Camera;
use prism::renderer::config::RenderConfig;
use prism::renderer::contexts::device_ctx::types::{RenderTarget, TextureFormat};
use prism::renderer::resources::builtin;
use prism::renderer::resources::material::{AutoBinding, Material};
use prism::renderer::resources::mesh::{Mesh, MeshData};
use prism::renderer::resources::texture::TextureData;
use prism::renderer::transform::Transform;
use prism::renderer::Renderer;

/// Everything the demo draws: one textured quad spinning in front of the camera.
struct Scene {
    camera: Camera,
    transform: Transform,
    mesh: Mesh,
    material: Material,
    angle: f32,
}

impl Scene {
    const SPIN_RADIANS_PER_SEC: f32 = 1.0;

    fn new(renderer: &mut Renderer) -> Result<Self> {
        let mut camera = renderer.create_camera();
        camera.set_position(Vec3::new(0.0, 0.0, 3.0));
        camera.set_clear_color(Some(Vec4::new(0.05, 0.05, 0.08, 1.0)));

        let texture = renderer.upload_texture(&TextureData::checkerboard(
            64,
            8,
            [230, 230, 230, 255],
            [40, 90, 200, 255],
        ))?;
        let program = Arc::new(builtin::unlit_textured()?);
        let mut material = renderer.create_material("checker", program);
        material.bind_auto("world_view_proj", AutoBinding::WorldViewProjection)?;
        material.set_param("tint", Vec4::ONE)?;
        material.set_texture("albedo", &texture)?;

        let mesh = renderer.upload_mesh(&MeshData::new_quad())?;
        let transform = renderer.create_transform(Mat4::IDENTITY);
        Ok(Self {
            camera,
            transform,
            mesh,
            material,
            angle: 0.0,
        })
    }

    fn advance(&mut self, delta_secs: f32) {
        self.angle = (self.angle + delta_secs * Self::SPIN_RADIANS_PER_SEC) % std::f32::consts::TAU;
        self.transform
            .set_world_matrix(Mat4::from_rotation_y(self.angle) * Mat4::from_rotation_z(self.angle * 0.5));
    }

    fn draw(&self, renderer: &mut Renderer, target: RenderTarget) -> Result<()> {
        renderer.begin_camera(&self.camera, target)?;
        renderer.draw_mesh(&self.mesh, &self.transform, &self.material)?;
        renderer.end_camera(&self.camera, target)
    }
}

pub struct App {
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    scene: Option<Scene>,

    // State
    prev_frame_time: Instant,
    delta_time_secs: f32,
    paused: bool,
    error: Option<Report>,
}

impl App {
    pub fn new() -> Self {
        Self {
            window: None,
            renderer: None,
            scene: None,

            prev_frame_time: Instant::now(),
            delta_time_secs: 0.0,
            paused: false,
            error: None,
        }
    }

    /// Opens a window and renders until it is closed.
    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.run_app(&mut self)?;
        // The scene's handles and the renderer go down before the window
        self.scene = None;
        self.renderer = None;
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(event_loop.create_window(Window::default_attributes().with_title("prism"))?);
        let mut renderer = Renderer::new(RenderConfig::default(), Some(window.clone()))?;
        self.scene = Some(Scene::new(&mut renderer)?);
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn redraw(&mut self) -> Result<()> {
        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_mut()) else {
            return Ok(());
        };
        if !self.paused {
            scene.advance(self.delta_time_secs);
        }
        let scene = &*scene;
        let summary = renderer.render_frame(|r| scene.draw(r, RenderTarget::Surface))?;
        if summary.swept {
            log::debug!(
                "Frame {}: swept {} pipelines, {} contexts",
                summary.frame,
                summary.evicted_pipelines,
                summary.evicted_contexts
            );
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: Report) {
        log::error!("{err:?}");
        self.error = Some(err);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn new_events(&mut self, _event_loop: &ActiveEventLoop, _cause: StartCause) {
        let curr_frame_time = Instant::now();
        self.delta_time_secs = curr_frame_time.duration_since(self.prev_frame_time).as_secs_f32();
        self.prev_frame_time = curr_frame_time;
    }

    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(err) = self.init(event_loop) {
                self.fail(event_loop, err);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.window.as_ref().is_none_or(|w| w.id() != window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_resize();
                }
            }
            WindowEvent::RedrawRequested => {
                let minimized = self
                    .window
                    .as_ref()
                    .is_some_and(|w| w.inner_size().width == 0 || w.inner_size().height == 0);
                if !minimized {
                    if let Err(err) = self.redraw() {
                        self.fail(event_loop, err);
                    }
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: key,
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key.as_ref() {
                Key::Named(NamedKey::Space) => {
                    self.paused = !self.paused;
                    log::info!("paused: {}", self.paused);
                }
                Key::Named(NamedKey::Escape) => event_loop.exit(),
                _ => {}
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

/// Renders one frame of the demo scene on the soft backend and saves it as a PNG.
pub fn render_snapshot(path: &Path, width: u32, height: u32) -> Result<()> {
    let mut renderer = Renderer::new(RenderConfig::soft(), None)?;
    let target = renderer.create_offscreen_target(
        width,
        height,
        TextureFormat::Rgba8Unorm,
        Some(TextureFormat::Depth32Float),
    )?;
    let mut scene = Scene::new(&mut renderer)?;
    scene.advance(0.6);
    renderer.render_frame(|r| scene.draw(r, target))?;

    let pixels = renderer.read_target_pixels(target)?;
    let image = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| color_eyre::eyre::eyre!("readback does not match {width}x{height}"))?;
    image.save(path)?;
    log::info!("Wrote {}", path.display());
    Ok(())
}
