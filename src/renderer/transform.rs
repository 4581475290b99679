use glam::Mat4;
use crate::renderer::camera::CameraView;
use crate::renderer::handle::SceneHandle;

/// World placement of a drawable, identified by the handle its owner issued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    handle: SceneHandle,
    world: Mat4,
}

impl Transform {
    pub fn new(handle: SceneHandle, world: Mat4) -> Self {
        Self { handle, world }
    }

    pub fn handle(&self) -> SceneHandle {
        self.handle
    }

    pub fn set_world_matrix(&mut self, world: Mat4) {
        self.world = world;
    }

    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    pub fn world_view_matrix(&self, view: &CameraView) -> Mat4 {
        view.view * self.world
    }

    pub fn world_view_proj_matrix(&self, view: &CameraView) -> Mat4 {
        view.view_projection * self.world
    }

    /// Normal matrix for non-uniformly scaled geometry.
    pub fn inv_transposed_world_matrix(&self) -> Mat4 {
        self.world.inverse().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use crate::renderer::camera::Camera;
    use crate::renderer::contexts::device_ctx::types::Extent2D;
    use crate::renderer::handle::HandleAllocator;

    #[test]
    fn derived_matrices_compose_with_camera() {
        let mut handles = HandleAllocator::new();
        let camera = Camera::new(handles.allocate());
        let view = camera.view_for(Extent2D::new(64, 64));
        let transform = Transform::new(
            handles.allocate(),
            Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0)),
        );

        let wvp = transform.world_view_proj_matrix(&view);
        assert!(wvp.abs_diff_eq(view.projection * view.view * transform.world_matrix(), 1e-5));

        let normal = transform.inv_transposed_world_matrix();
        assert!(normal.abs_diff_eq(Mat4::from_scale(Vec3::new(0.5, 1.0, 1.0)), 1e-6));
    }
}
