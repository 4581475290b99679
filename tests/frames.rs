use std::sync::Arc;
use glam::{Mat4, Vec2, Vec3, Vec4};
use prism::renderer::camera::{Camera, Projection};
use prism::renderer::config::RenderConfig;
use prism::renderer::contexts::device_ctx::types::{RenderTarget, TextureFormat};
use prism::renderer::error::classify;
use prism::renderer::resources::builtin;
use prism::renderer::resources::material::{AutoBinding, Material};
use prism::renderer::resources::mesh::{Mesh, MeshData};
use prism::renderer::resources::vertex::{PrimitiveTopology, Vertex};
use prism::renderer::transform::Transform;
use prism::renderer::Renderer;

const RED: [u8; 4] = [255, 0, 0, 255];
const GREEN: [u8; 4] = [0, 255, 0, 255];

/// A flat-colored quad filling an orthographic camera's view.
struct Scene {
    renderer: Renderer,
    target: RenderTarget,
    camera: Camera,
    transform: Transform,
    mesh: Mesh,
    material: Material,
}

impl Scene {
    fn new(config: RenderConfig, width: u32, height: u32) -> Self {
        let mut renderer = Renderer::new(config, None).unwrap();
        let target = renderer
            .create_offscreen_target(width, height, TextureFormat::Rgba8Unorm, None)
            .unwrap();
        let camera = ortho_camera(&mut renderer, Some(Vec4::new(0.0, 0.0, 0.0, 1.0)));
        let transform = renderer.create_transform(Mat4::IDENTITY);
        let mesh = renderer.upload_mesh(&MeshData::new_quad()).unwrap();
        let material = flat_material(&mut renderer, Vec4::new(1.0, 0.0, 0.0, 1.0));
        Self {
            renderer,
            target,
            camera,
            transform,
            mesh,
            material,
        }
    }

    fn frame(&mut self) -> u32 {
        let frame = self.renderer.begin_frame().unwrap();
        self.renderer.begin_camera(&self.camera, self.target).unwrap();
        self.renderer
            .draw_mesh(&self.mesh, &self.transform, &self.material)
            .unwrap();
        self.renderer.end_camera(&self.camera, self.target).unwrap();
        self.renderer.end_frame().unwrap();
        frame
    }

    fn idle_frame(&mut self) -> u32 {
        let frame = self.renderer.begin_frame().unwrap();
        self.renderer.end_frame().unwrap();
        frame
    }
}

fn ortho_camera(renderer: &mut Renderer, clear: Option<Vec4>) -> Camera {
    let mut camera = renderer.create_camera();
    camera.set_projection(Projection::Orthographic {
        height: 2.0,
        near: 0.1,
        far: 100.0,
    });
    camera.set_clear_color(clear);
    camera
}

fn flat_material(renderer: &mut Renderer, color: Vec4) -> Material {
    let program = Arc::new(builtin::unlit_color().unwrap());
    let mut material = renderer.create_material("flat", program);
    material
        .bind_auto("world_view_proj", AutoBinding::WorldViewProjection)
        .unwrap();
    material.set_param("color", color).unwrap();
    material.set_depth_test(false);
    material
}

fn texel(pixels: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let i = ((y * width + x) * 4) as usize;
    [pixels[i], pixels[i + 1], pixels[i + 2], pixels[i + 3]]
}

#[test]
fn red_quad_reads_back_red() {
    let mut scene = Scene::new(RenderConfig::soft(), 1, 1);
    scene.frame();
    let pixels = scene.renderer.read_target_pixels(scene.target).unwrap();
    assert_eq!(pixels, RED.to_vec());
}

#[test]
fn later_passes_draw_over_earlier_ones() {
    let mut renderer = Renderer::new(RenderConfig::soft(), None).unwrap();
    let target = renderer
        .create_offscreen_target(2, 2, TextureFormat::Rgba8Unorm, None)
        .unwrap();
    let clearing = ortho_camera(&mut renderer, Some(Vec4::new(1.0, 0.0, 0.0, 1.0)));
    let loading = ortho_camera(&mut renderer, None);
    // Quad squeezed into the left half of the view
    let left_half = renderer.create_transform(
        Mat4::from_translation(Vec3::new(-0.5, 0.0, 0.0)) * Mat4::from_scale(Vec3::new(0.5, 1.0, 1.0)),
    );
    let mesh = renderer.upload_mesh(&MeshData::new_quad()).unwrap();
    let green = flat_material(&mut renderer, Vec4::new(0.0, 1.0, 0.0, 1.0));

    renderer
        .render_frame(|r| {
            r.begin_camera(&clearing, target)?;
            r.end_camera(&clearing, target)?;
            r.begin_camera(&loading, target)?;
            r.draw_mesh(&mesh, &left_half, &green)?;
            r.end_camera(&loading, target)
        })
        .unwrap();

    let pixels = renderer.read_target_pixels(target).unwrap();
    for y in 0..2 {
        assert_eq!(texel(&pixels, 2, 0, y), GREEN);
        assert_eq!(texel(&pixels, 2, 1, y), RED);
    }
}

#[test]
fn thousand_frames_build_one_pipeline() {
    let mut scene = Scene::new(RenderConfig::soft(), 4, 4);
    for _ in 0..1000 {
        scene.frame();
    }
    let stats = scene.renderer.device_stats();
    assert_eq!(stats.pipelines_created, 1);
    assert_eq!(stats.binding_sets_created, 1);
    let cache = scene.renderer.cache_stats();
    assert_eq!(cache.builds, 1);
    assert_eq!(cache.rebuilds, 0);
    assert_eq!(cache.hits, 999);
    assert_eq!(cache.evictions, 0);
}

#[test]
fn state_change_rebuilds_only_the_pipeline() {
    let mut scene = Scene::new(RenderConfig::soft(), 1, 1);
    scene.frame();
    scene.material.set_depth_test(true);
    scene.material.set_param("color", Vec4::new(0.0, 1.0, 0.0, 1.0)).unwrap();
    scene.frame();

    let stats = scene.renderer.device_stats();
    assert_eq!(stats.pipelines_created, 2);
    assert_eq!(stats.live_pipelines(), 1);
    assert_eq!(stats.binding_sets_created, 1);
    assert_eq!(scene.renderer.cache_stats().rebuilds, 1);
    // New parameter values land in the kept buffers
    assert_eq!(scene.renderer.read_target_pixels(scene.target).unwrap(), GREEN.to_vec());
}

#[test]
fn idle_entries_are_evicted_on_the_sweep_after_the_threshold() {
    let mut scene = Scene::new(RenderConfig::soft(), 1, 1);
    assert_eq!(scene.frame(), 1);
    while scene.idle_frame() < 119 {}
    assert_eq!(scene.renderer.pipeline_cache().len(), 1);
    assert_eq!(scene.renderer.target_contexts(), 1);

    assert_eq!(scene.idle_frame(), 120);
    assert!(scene.renderer.pipeline_cache().is_empty());
    assert_eq!(scene.renderer.target_contexts(), 0);
    assert_eq!(scene.renderer.cache_stats().evictions, 1);
    assert_eq!(scene.renderer.device_stats().live_pipelines(), 0);

    // Drawing again rebuilds from scratch
    scene.frame();
    assert_eq!(scene.renderer.cache_stats().builds, 2);
}

#[test]
fn eviction_survives_counter_wraparound() {
    let config = RenderConfig::soft()
        .with_sweep_interval(10)
        .with_initial_frame(u32::MAX - 30);
    let mut scene = Scene::new(config, 1, 1);

    // In use every frame across the wrap
    while scene.frame() != 50 {}
    assert_eq!(scene.renderer.pipeline_cache().len(), 1);
    assert_eq!(scene.renderer.cache_stats().builds, 1);
    assert_eq!(scene.renderer.cache_stats().evictions, 0);

    while scene.idle_frame() != 149 {}
    assert_eq!(scene.renderer.pipeline_cache().len(), 1);
    assert_eq!(scene.idle_frame(), 150);
    assert!(scene.renderer.pipeline_cache().is_empty());
}

#[test]
fn entry_idle_across_the_wrap_is_evicted() {
    let config = RenderConfig::soft()
        .with_sweep_interval(10)
        .with_initial_frame(u32::MAX - 10);
    let mut scene = Scene::new(config, 1, 1);
    // Last use ten frames before the counter wraps
    assert_eq!(scene.frame(), u32::MAX - 9);
    while scene.idle_frame() != 80 {}
    assert_eq!(scene.renderer.pipeline_cache().len(), 1);
    while scene.idle_frame() != 90 {}
    assert!(scene.renderer.pipeline_cache().is_empty());
}

#[test]
fn destroying_a_target_drops_its_entries_and_context() {
    let mut scene = Scene::new(RenderConfig::soft(), 2, 2);
    scene.frame();
    assert_eq!(scene.renderer.pipeline_cache().len(), 1);

    scene.renderer.destroy_render_target(scene.target).unwrap();
    assert!(scene.renderer.pipeline_cache().is_empty());
    assert_eq!(scene.renderer.target_contexts(), 0);
    assert_eq!(scene.renderer.device_stats().live_pipelines(), 0);

    scene.renderer.begin_frame().unwrap();
    let err = scene
        .renderer
        .begin_camera(&scene.camera, scene.target)
        .unwrap_err();
    assert!(classify(&err).is_some_and(|e| e.is_configuration()));
}

#[test]
fn misuse_is_reported_as_configuration_errors() {
    let mut scene = Scene::new(RenderConfig::soft(), 1, 1);

    let err = scene.renderer.begin_camera(&scene.camera, scene.target).unwrap_err();
    assert_eq!(classify(&err).map(|e| e.operation()), Some("begin_camera"));

    scene.renderer.begin_frame().unwrap();
    scene.renderer.begin_camera(&scene.camera, scene.target).unwrap();
    let err = scene.renderer.end_frame().unwrap_err();
    assert!(classify(&err).is_some_and(|e| e.is_configuration()));

    let err = scene
        .renderer
        .begin_camera(&scene.camera, RenderTarget::Surface)
        .unwrap_err();
    assert!(classify(&err).is_some_and(|e| e.is_configuration()));

    let err = scene.material.set_param("colour", Vec4::ONE).unwrap_err();
    assert!(classify(&err).is_some_and(|e| e.is_configuration()));
}

#[test]
fn surface_frames_are_presented() {
    let mut renderer = Renderer::new(RenderConfig::soft().with_surface(4, 4), None).unwrap();
    let camera = ortho_camera(&mut renderer, Some(Vec4::new(0.0, 0.0, 1.0, 1.0)));
    let transform = renderer.create_transform(Mat4::IDENTITY);
    let mesh = renderer.upload_mesh(&MeshData::new_quad()).unwrap();
    let material = flat_material(&mut renderer, Vec4::ONE);

    for _ in 0..3 {
        let summary = renderer
            .render_frame(|r| {
                r.begin_camera(&camera, RenderTarget::Surface)?;
                r.draw_mesh(&mesh, &transform, &material)?;
                r.end_camera(&camera, RenderTarget::Surface)
            })
            .unwrap();
        assert!(summary.presented);
    }
    // A frame with nothing drawn still presents
    assert!(renderer.render_frame(|_| Ok(())).unwrap().presented);
    assert_eq!(renderer.device_stats().presents, 4);
    assert_eq!(renderer.device_stats().pipelines_created, 1);

    let err = renderer.read_target_pixels(RenderTarget::Surface).unwrap_err();
    assert!(classify(&err).is_some_and(|e| e.is_configuration()));
}

const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Two quads side by side, one per part: part 0 covers x in [-1, 0], part 1 x in [0, 1].
fn two_part_mesh() -> MeshData {
    let vertices = [
        Vertex::new(Vec3::new(-1.0, 1.0, 0.0), Vec2::new(0.0, 0.0)),
        Vertex::new(Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, 1.0)),
        Vertex::new(Vec3::new(0.0, 1.0, 0.0), Vec2::new(0.5, 0.0)),
        Vertex::new(Vec3::new(0.0, -1.0, 0.0), Vec2::new(0.5, 1.0)),
        Vertex::new(Vec3::new(1.0, 1.0, 0.0), Vec2::new(1.0, 0.0)),
        Vertex::new(Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, 1.0)),
    ];
    MeshData::from_vertices(&vertices, vec![vec![0, 1, 2, 2, 1, 3], vec![2, 3, 4, 4, 3, 5]])
}

fn draw_part(scene: &mut Scene, part: usize) -> Vec<u8> {
    let (camera, mesh, transform, material, target) =
        (&scene.camera, &scene.mesh, &scene.transform, &scene.material, scene.target);
    scene
        .renderer
        .render_frame(|r| {
            r.begin_camera(camera, target)?;
            r.draw_mesh_part(mesh, part, transform, material)?;
            r.end_camera(camera, target)
        })
        .unwrap();
    scene.renderer.read_target_pixels(target).unwrap()
}

#[test]
fn mesh_parts_draw_against_their_own_indices() {
    let mut scene = Scene::new(RenderConfig::soft(), 2, 1);
    scene.mesh = scene.renderer.upload_mesh(&two_part_mesh()).unwrap();
    // The 2x1 view is 4 units wide
    scene.transform.set_world_matrix(Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0)));

    assert_eq!(draw_part(&mut scene, 0), [RED, BLACK].concat());
    assert_eq!(draw_part(&mut scene, 1), [BLACK, RED].concat());

    scene.frame();
    assert_eq!(scene.renderer.read_target_pixels(scene.target).unwrap(), [RED, RED].concat());
    // Both parts share one draw site, so one pipeline serves all three frames
    assert_eq!(scene.renderer.device_stats().pipelines_created, 1);
}

#[test]
fn out_of_range_part_is_a_configuration_error() {
    let mut scene = Scene::new(RenderConfig::soft(), 1, 1);
    scene.renderer.begin_frame().unwrap();
    scene.renderer.begin_camera(&scene.camera, scene.target).unwrap();
    let err = scene
        .renderer
        .draw_mesh_part(&scene.mesh, 1, &scene.transform, &scene.material)
        .unwrap_err();
    assert_eq!(classify(&err).map(|e| e.operation()), Some("draw_mesh"));
    assert!(classify(&err).is_some_and(|e| e.is_configuration()));

    // The pass is still usable
    scene.renderer.end_camera(&scene.camera, scene.target).unwrap();
    scene.renderer.end_frame().unwrap();
}

#[test]
fn unindexed_mesh_draws_all_vertices() {
    let mut scene = Scene::new(RenderConfig::soft(), 2, 2);
    scene.mesh = scene.renderer.upload_mesh(&MeshData::new_unindexed_quad()).unwrap();
    assert!(scene.mesh.parts().is_empty());
    scene.frame();
    assert_eq!(
        scene.renderer.read_target_pixels(scene.target).unwrap(),
        [RED, RED, RED, RED].concat()
    );
}

#[test]
fn topology_change_rebuilds_only_the_pipeline() {
    let mut scene = Scene::new(RenderConfig::soft(), 2, 2);
    scene.frame();
    scene.mesh.set_topology(PrimitiveTopology::LineList);
    scene.frame();

    let cache = scene.renderer.cache_stats();
    assert_eq!(cache.builds, 1);
    assert_eq!(cache.rebuilds, 1);
    let stats = scene.renderer.device_stats();
    assert_eq!(stats.pipelines_created, 2);
    assert_eq!(stats.live_pipelines(), 1);
    assert_eq!(stats.binding_sets_created, 1);
}

#[test]
fn materials_at_one_draw_site_keep_separate_entries() {
    let mut scene = Scene::new(RenderConfig::soft(), 1, 1);
    let green = flat_material(&mut scene.renderer, Vec4::new(0.0, 1.0, 0.0, 1.0));
    assert_ne!(green.id(), scene.material.id());

    let (camera, mesh, transform, red, target) =
        (&scene.camera, &scene.mesh, &scene.transform, &scene.material, scene.target);
    scene
        .renderer
        .render_frame(|r| {
            r.begin_camera(camera, target)?;
            r.draw_mesh(mesh, transform, &green)?;
            r.draw_mesh(mesh, transform, red)?;
            r.end_camera(camera, target)
        })
        .unwrap();

    assert_eq!(scene.renderer.pipeline_cache().len(), 2);
    assert_eq!(scene.renderer.device_stats().binding_sets_created, 2);
    assert_eq!(scene.renderer.read_target_pixels(scene.target).unwrap(), RED.to_vec());
}
