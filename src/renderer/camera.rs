use glam::{Mat4, Vec2, Vec3, Vec4};
use crate::renderer::contexts::device_ctx::types::{Extent2D, ScissorRect, Viewport};
use crate::renderer::handle::SceneHandle;
use crate::renderer::util;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y_deg: f32,
        near: f32,
        far: f32,
    },
    /// `height` is the visible world-space height; width follows the aspect ratio.
    Orthographic {
        height: f32,
        near: f32,
        far: f32,
    },
    Custom(Mat4),
}

/// Region of the render target a camera draws into, in normalized [0, 1] units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for ViewportRect {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    handle: SceneHandle,
    position: Vec3,
    forward: Vec3,
    up: Vec3,
    right: Vec3,
    world_up: Vec3,
    pivot: Vec3,
    projection: Projection,
    clear_color: Option<Vec4>,
    viewport: ViewportRect,
}

impl Camera {
    const DEFAULT_FOV_Y_DEG: f32 = 45.0;

    pub fn new(handle: SceneHandle) -> Self {
        Self {
            handle,
            position: Vec3::new(0.0, 0.0, 5.0),
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            right: Vec3::X,
            world_up: Vec3::Y,
            pivot: Vec3::ZERO,
            projection: Projection::Perspective {
                fov_y_deg: Self::DEFAULT_FOV_Y_DEG,
                near: 0.1,
                far: 100.0,
            },
            clear_color: Some(Vec4::new(0.0, 0.0, 0.0, 1.0)),
            viewport: ViewportRect::default(),
        }
    }

    pub fn handle(&self) -> SceneHandle {
        self.handle
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.look_at(self.pivot);
    }

    pub fn look_at(&mut self, target: Vec3) {
        if target == self.position {
            return;
        }
        self.pivot = target;
        self.forward = (target - self.position).normalize();
        self.right = self.forward.cross(self.world_up).normalize();
        self.up = self.right.cross(self.forward).normalize();
    }

    pub fn set_projection(&mut self, projection: Projection) {
        self.projection = projection;
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn set_clear_color(&mut self, color: Option<Vec4>) {
        self.clear_color = color;
    }

    pub fn clear_color(&self) -> Option<Vec4> {
        self.clear_color
    }

    pub fn has_color_clearing(&self) -> bool {
        self.clear_color.is_some()
    }

    pub fn set_viewport(&mut self, viewport: ViewportRect) {
        self.viewport = viewport;
    }

    pub fn viewport(&self) -> ViewportRect {
        self.viewport
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward, self.up)
    }

    pub fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        match self.projection {
            Projection::Perspective {
                fov_y_deg,
                near,
                far,
            } => Mat4::perspective_rh(fov_y_deg.to_radians(), aspect_ratio, near, far),
            Projection::Orthographic { height, near, far } => {
                let half_h = height * 0.5;
                let half_w = half_h * aspect_ratio;
                Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far)
            }
            Projection::Custom(matrix) => matrix,
        }
    }

    pub fn view_projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        self.projection_matrix(aspect_ratio) * self.view_matrix()
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn forward(&self) -> Vec3 {
        self.forward
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn right(&self) -> Vec3 {
        self.right
    }

    pub fn pitch(&self) -> f32 {
        util::calculate_pitch(self.forward)
    }

    pub fn yaw(&self) -> f32 {
        util::calculate_yaw(self.forward)
    }

    /// Resolves the camera against a concrete target size for one pass.
    pub fn view_for(&self, target: Extent2D) -> CameraView {
        let vp = self.viewport;
        let x = (vp.x * target.width as f32).round();
        let y = (vp.y * target.height as f32).round();
        let width = (vp.width * target.width as f32).round().max(1.0);
        let height = (vp.height * target.height as f32).round().max(1.0);

        let view = self.view_matrix();
        let projection = self.projection_matrix(width / height);

        CameraView {
            camera: self.handle,
            view,
            projection,
            view_projection: projection * view,
            position: self.position,
            viewport: Viewport {
                x,
                y,
                width,
                height,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: ScissorRect {
                x: x as i32,
                y: y as i32,
                width: width as u32,
                height: height as u32,
            },
            viewport_size: Vec2::new(width, height),
            clear_color: self.clear_color,
        }
    }
}

/// Snapshot of a camera for the pass currently being recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    pub camera: SceneHandle,
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub position: Vec3,
    pub viewport: Viewport,
    pub scissor: ScissorRect,
    pub viewport_size: Vec2,
    pub clear_color: Option<Vec4>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::renderer::handle::HandleAllocator;

    #[test]
    fn view_matches_viewport_fraction() {
        let mut handles = HandleAllocator::new();
        let mut camera = Camera::new(handles.allocate());
        camera.set_viewport(ViewportRect {
            x: 0.5,
            y: 0.0,
            width: 0.5,
            height: 1.0,
        });

        let view = camera.view_for(Extent2D::new(200, 100));
        assert_eq!(view.scissor, ScissorRect { x: 100, y: 0, width: 100, height: 100 });
        assert_relative_eq!(view.viewport.width, 100.0);
        assert_eq!(view.viewport_size, Vec2::new(100.0, 100.0));
    }

    #[test]
    fn look_at_points_forward_at_target() {
        let mut handles = HandleAllocator::new();
        let mut camera = Camera::new(handles.allocate());
        camera.set_position(Vec3::new(0.0, 0.0, 10.0));
        camera.look_at(Vec3::ZERO);
        assert!(camera.forward().abs_diff_eq(Vec3::NEG_Z, 1e-6));

        // The pivot lands in the middle of clip space
        let clip = camera.view_projection_matrix(1.0) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(clip.x / clip.w, 0.0, epsilon = 1e-6);
        assert_relative_eq!(clip.y / clip.w, 0.0, epsilon = 1e-6);
        let depth = clip.z / clip.w;
        assert!(depth > 0.0 && depth < 1.0);
    }

    #[test]
    fn custom_projection_is_used_verbatim() {
        let mut handles = HandleAllocator::new();
        let mut camera = Camera::new(handles.allocate());
        camera.set_projection(Projection::Custom(Mat4::IDENTITY));
        assert_eq!(camera.projection_matrix(3.0), Mat4::IDENTITY);
        camera.set_clear_color(None);
        assert!(!camera.has_color_clearing());
    }
}
