use glam::{Vec2, Vec4};
use crate::renderer::contexts::device_ctx::soft::program::{
    SoftShader, TextureView, UniformView, VertexOutput, MAX_VARYINGS, MAX_VERTEX_ATTRIBUTES,
};
use crate::renderer::contexts::device_ctx::soft::texel;
use crate::renderer::contexts::device_ctx::types::{Extent2D, PipelineDesc, ScissorRect, TextureFormat, Viewport};
use crate::renderer::resources::material::{BlendMode, CullMode, FrontFace, PolygonMode};
use crate::renderer::resources::vertex::{PrimitiveTopology, VertexFormat};

const W_EPSILON: f32 = 1e-6;

/// Attachments of the pass being drawn into, borrowed out of the device for one draw.
pub struct Attachments<'a> {
    pub extent: Extent2D,
    pub color_format: TextureFormat,
    pub color: &'a mut [u8],
    pub depth: Option<&'a mut [u8]>,
}

pub struct DrawState<'a> {
    pub pipeline: &'a PipelineDesc,
    pub shader: &'a dyn SoftShader,
    pub uniforms: &'a UniformView<'a>,
    pub textures: &'a TextureView<'a>,
    /// Indexed by vertex buffer binding slot.
    pub vertex_buffers: &'a [Option<&'a [u8]>],
    pub viewport: Viewport,
    pub scissor: ScissorRect,
}

/// Screen-space vertex ready for rasterization.
#[derive(Debug, Clone, Copy)]
struct ScreenVertex {
    x: f32,
    y: f32,
    z: f32,
    inv_w: f32,
    /// Varyings pre-divided by w.
    varyings: [Vec4; MAX_VARYINGS],
}

/// Runs the vertex stage on every index in `vertices`, assembles primitives
/// for the pipeline topology and rasterizes them into `target`.
pub fn draw(state: &DrawState, target: &mut Attachments, vertices: &[u32]) -> Result<(), String> {
    let outputs = vertices
        .iter()
        .map(|&index| {
            let attributes = fetch_attributes(state, index)?;
            Ok(state.shader.vertex(&attributes, state.uniforms))
        })
        .collect::<Result<Vec<_>, String>>()?;

    match state.pipeline.topology {
        PrimitiveTopology::TriangleList => {
            for tri in outputs.chunks_exact(3) {
                draw_triangle(state, target, [tri[0], tri[1], tri[2]]);
            }
        }
        PrimitiveTopology::TriangleStrip => {
            for i in 0..outputs.len().saturating_sub(2) {
                let tri = if i % 2 == 0 {
                    [outputs[i], outputs[i + 1], outputs[i + 2]]
                } else {
                    [outputs[i + 1], outputs[i], outputs[i + 2]]
                };
                draw_triangle(state, target, tri);
            }
        }
        PrimitiveTopology::LineList => {
            for line in outputs.chunks_exact(2) {
                if let (Some(a), Some(b)) = (project(state, &line[0]), project(state, &line[1])) {
                    draw_line(state, target, a, b);
                }
            }
        }
        PrimitiveTopology::PointList => {
            for point in &outputs {
                if let Some(p) = project(state, point) {
                    shade_pixel(state, target, p.x.floor() as i32, p.y.floor() as i32, p.z, &unproject(&p, p.inv_w));
                }
            }
        }
    }
    Ok(())
}

fn fetch_attributes(state: &DrawState, index: u32) -> Result<[Vec4; MAX_VERTEX_ATTRIBUTES], String> {
    let mut attributes = [Vec4::new(0.0, 0.0, 0.0, 1.0); MAX_VERTEX_ATTRIBUTES];
    for (slot, layout) in state.pipeline.vertex_buffers.iter().enumerate() {
        let data = state
            .vertex_buffers
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| format!("no vertex buffer bound at slot {slot}"))?;
        for attribute in &layout.attributes {
            let start = index as usize * layout.stride as usize + attribute.offset as usize;
            let bytes = data
                .get(start..start + attribute.format.size() as usize)
                .ok_or_else(|| format!("vertex {index} reads past the end of the buffer at slot {slot}"))?;
            let location = attribute.location as usize;
            if location >= MAX_VERTEX_ATTRIBUTES {
                return Err(format!("vertex location {location} out of range"));
            }
            attributes[location] = decode_attribute(attribute.format, bytes);
        }
    }
    Ok(attributes)
}

fn decode_attribute(format: VertexFormat, bytes: &[u8]) -> Vec4 {
    let float = |i: usize| bytemuck::pod_read_unaligned::<f32>(&bytes[i * 4..i * 4 + 4]);
    match format {
        VertexFormat::Float32 => Vec4::new(float(0), 0.0, 0.0, 1.0),
        VertexFormat::Float32x2 => Vec4::new(float(0), float(1), 0.0, 1.0),
        VertexFormat::Float32x3 => Vec4::new(float(0), float(1), float(2), 1.0),
        VertexFormat::Float32x4 => Vec4::new(float(0), float(1), float(2), float(3)),
        VertexFormat::Unorm8x4 => Vec4::new(
            bytes[0] as f32 / 255.0,
            bytes[1] as f32 / 255.0,
            bytes[2] as f32 / 255.0,
            bytes[3] as f32 / 255.0,
        ),
        VertexFormat::Uint32 => {
            let value = bytemuck::pod_read_unaligned::<u32>(&bytes[..4]);
            Vec4::new(value as f32, 0.0, 0.0, 1.0)
        }
    }
}

/// Clips against the near (`z >= 0`) and far (`z <= w`) planes.
fn clip_depth(polygon: Vec<VertexOutput>) -> Vec<VertexOutput> {
    let near = |v: &VertexOutput| v.position.z;
    let far = |v: &VertexOutput| v.position.w - v.position.z;
    let polygon = clip_plane(polygon, near);
    clip_plane(polygon, far)
}

fn clip_plane(polygon: Vec<VertexOutput>, distance: impl Fn(&VertexOutput) -> f32) -> Vec<VertexOutput> {
    let mut out = Vec::with_capacity(polygon.len() + 2);
    for i in 0..polygon.len() {
        let a = &polygon[i];
        let b = &polygon[(i + 1) % polygon.len()];
        let (da, db) = (distance(a), distance(b));
        if da >= 0.0 {
            out.push(*a);
        }
        if (da >= 0.0) != (db >= 0.0) {
            let t = da / (da - db);
            out.push(lerp_output(a, b, t));
        }
    }
    out
}

fn lerp_output(a: &VertexOutput, b: &VertexOutput, t: f32) -> VertexOutput {
    let mut out = VertexOutput::new(a.position.lerp(b.position, t));
    for i in 0..MAX_VARYINGS {
        out.varyings[i] = a.varyings[i].lerp(b.varyings[i], t);
    }
    out
}

/// Perspective divide and viewport transform. NDC +Y points up; framebuffer rows grow downward.
fn project(state: &DrawState, v: &VertexOutput) -> Option<ScreenVertex> {
    let w = v.position.w;
    if w <= W_EPSILON {
        return None;
    }
    let inv_w = 1.0 / w;
    let ndc = v.position.truncate() * inv_w;
    let vp = &state.viewport;
    let mut varyings = v.varyings;
    for varying in varyings.iter_mut() {
        *varying *= inv_w;
    }
    Some(ScreenVertex {
        x: vp.x + (ndc.x + 1.0) * 0.5 * vp.width,
        y: vp.y + (1.0 - ndc.y) * 0.5 * vp.height,
        z: vp.min_depth + ndc.z * (vp.max_depth - vp.min_depth),
        inv_w,
        varyings,
    })
}

fn unproject(v: &ScreenVertex, one_over_w: f32) -> [Vec4; MAX_VARYINGS] {
    let mut varyings = v.varyings;
    for varying in varyings.iter_mut() {
        *varying /= one_over_w.max(W_EPSILON);
    }
    varyings
}

fn draw_triangle(state: &DrawState, target: &mut Attachments, tri: [VertexOutput; 3]) {
    let polygon = clip_depth(tri.to_vec());
    if polygon.len() < 3 {
        return;
    }
    let Some(screen) = polygon
        .iter()
        .map(|v| project(state, v))
        .collect::<Option<Vec<_>>>()
    else {
        return;
    };

    // Facing is decided on the whole clipped polygon, which keeps the original winding.
    let area = signed_area(&screen);
    if area == 0.0 {
        return;
    }
    let counter_clockwise = area > 0.0;
    let front = match state.pipeline.state.front_face {
        FrontFace::CounterClockwise => counter_clockwise,
        FrontFace::Clockwise => !counter_clockwise,
    };
    match state.pipeline.state.cull {
        CullMode::Back if !front => return,
        CullMode::Front if front => return,
        _ => {}
    }

    for i in 1..screen.len() - 1 {
        let (a, b, c) = (screen[0], screen[i], screen[i + 1]);
        match state.pipeline.state.polygon_mode {
            PolygonMode::Fill => fill_triangle(state, target, a, b, c),
            PolygonMode::Line => {
                draw_line(state, target, a, b);
                draw_line(state, target, b, c);
                draw_line(state, target, c, a);
            }
        }
    }
}

/// Positive when the polygon winds counter-clockwise as seen on screen.
fn signed_area(vertices: &[ScreenVertex]) -> f32 {
    let mut sum = 0.0;
    for i in 0..vertices.len() {
        let a = &vertices[i];
        let b = &vertices[(i + 1) % vertices.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    -0.5 * sum
}

fn edge(a: &ScreenVertex, b: &ScreenVertex, x: f32, y: f32) -> f32 {
    (b.x - a.x) * (y - a.y) - (b.y - a.y) * (x - a.x)
}

/// Top-left rule for pixel centers exactly on an edge, with the vertices in
/// `fill_triangle` order (interior on the positive side). Left edges run up the
/// screen and top edges run right. A shared edge is walked in opposite
/// directions by its two triangles, so exactly one of them owns it.
fn owns_edge(a: &ScreenVertex, b: &ScreenVertex) -> bool {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    dy < 0.0 || (dy == 0.0 && dx > 0.0)
}

fn fill_triangle(
    state: &DrawState,
    target: &mut Attachments,
    a: ScreenVertex,
    b: ScreenVertex,
    c: ScreenVertex,
) {
    let (a, b, c) = if edge(&a, &b, c.x, c.y) < 0.0 { (a, c, b) } else { (a, b, c) };
    let area = edge(&a, &b, c.x, c.y);
    if area <= 0.0 {
        return;
    }

    let Some((min_x, min_y, max_x, max_y)) = clip_bounds(
        state,
        target.extent,
        a.x.min(b.x).min(c.x),
        a.y.min(b.y).min(c.y),
        a.x.max(b.x).max(c.x),
        a.y.max(b.y).max(c.y),
    ) else {
        return;
    };

    let owns = [owns_edge(&b, &c), owns_edge(&c, &a), owns_edge(&a, &b)];
    for py in min_y..=max_y {
        for px in min_x..=max_x {
            let (x, y) = (px as f32 + 0.5, py as f32 + 0.5);
            let weights = [edge(&b, &c, x, y), edge(&c, &a, x, y), edge(&a, &b, x, y)];
            let inside = weights
                .iter()
                .zip(owns)
                .all(|(&w, owned)| w > 0.0 || (w == 0.0 && owned));
            if !inside {
                continue;
            }

            let (l0, l1, l2) = (weights[0] / area, weights[1] / area, weights[2] / area);
            let depth = l0 * a.z + l1 * b.z + l2 * c.z;
            let one_over_w = l0 * a.inv_w + l1 * b.inv_w + l2 * c.inv_w;
            let mut varyings = [Vec4::ZERO; MAX_VARYINGS];
            for (i, varying) in varyings.iter_mut().enumerate() {
                *varying = (a.varyings[i] * l0 + b.varyings[i] * l1 + c.varyings[i] * l2)
                    / one_over_w.max(W_EPSILON);
            }
            shade_pixel(state, target, px, py, depth, &varyings);
        }
    }
}

fn draw_line(state: &DrawState, target: &mut Attachments, a: ScreenVertex, b: ScreenVertex) {
    let steps = (b.x - a.x).abs().max((b.y - a.y).abs()).ceil().max(1.0) as u32;
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        let x = a.x + (b.x - a.x) * t;
        let y = a.y + (b.y - a.y) * t;
        let depth = a.z + (b.z - a.z) * t;
        let one_over_w = a.inv_w + (b.inv_w - a.inv_w) * t;
        let mut varyings = [Vec4::ZERO; MAX_VARYINGS];
        for (i, varying) in varyings.iter_mut().enumerate() {
            *varying = a.varyings[i].lerp(b.varyings[i], t) / one_over_w.max(W_EPSILON);
        }
        shade_pixel(state, target, x.floor() as i32, y.floor() as i32, depth, &varyings);
    }
}

/// Intersects a float bounding box with the scissor, viewport and attachment.
fn clip_bounds(
    state: &DrawState,
    extent: Extent2D,
    min_x: f32,
    min_y: f32,
    max_x: f32,
    max_y: f32,
) -> Option<(i32, i32, i32, i32)> {
    let (lo_x, lo_y, hi_x, hi_y) = pixel_window(state, extent);
    let min_x = (min_x.floor() as i32).max(lo_x);
    let min_y = (min_y.floor() as i32).max(lo_y);
    let max_x = (max_x.ceil() as i32).min(hi_x);
    let max_y = (max_y.ceil() as i32).min(hi_y);
    (min_x <= max_x && min_y <= max_y).then_some((min_x, min_y, max_x, max_y))
}

/// Inclusive pixel range writable by this draw.
fn pixel_window(state: &DrawState, extent: Extent2D) -> (i32, i32, i32, i32) {
    let s = &state.scissor;
    let vp = &state.viewport;
    let lo_x = s.x.max(vp.x.floor() as i32).max(0);
    let lo_y = s.y.max(vp.y.floor() as i32).max(0);
    let hi_x = (s.x + s.width as i32)
        .min((vp.x + vp.width).ceil() as i32)
        .min(extent.width as i32)
        - 1;
    let hi_y = (s.y + s.height as i32)
        .min((vp.y + vp.height).ceil() as i32)
        .min(extent.height as i32)
        - 1;
    (lo_x, lo_y, hi_x, hi_y)
}

fn shade_pixel(
    state: &DrawState,
    target: &mut Attachments,
    px: i32,
    py: i32,
    depth: f32,
    varyings: &[Vec4; MAX_VARYINGS],
) {
    let (lo_x, lo_y, hi_x, hi_y) = pixel_window(state, target.extent);
    if px < lo_x || py < lo_y || px > hi_x || py > hi_y {
        return;
    }
    let vp = &state.viewport;
    let (depth_min, depth_max) = (vp.min_depth.min(vp.max_depth), vp.min_depth.max(vp.max_depth));
    if depth < depth_min || depth > depth_max {
        return;
    }

    let pixel = py as usize * target.extent.width as usize + px as usize;
    let pipeline_state = &state.pipeline.state;
    if pipeline_state.depth_test {
        if let Some(depth_buffer) = target.depth.as_deref_mut() {
            let slot = &mut depth_buffer[pixel * 4..pixel * 4 + 4];
            let stored = f32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
            if !pipeline_state.depth_compare.passes(depth, stored) {
                return;
            }
            if pipeline_state.depth_write {
                slot.copy_from_slice(&depth.to_le_bytes());
            }
        }
    }

    let src = state.shader.fragment(varyings, state.uniforms, state.textures);
    let bpp = target.color_format.bytes_per_pixel() as usize;
    let texel_bytes = &mut target.color[pixel * bpp..(pixel + 1) * bpp];
    let out = match pipeline_state.blend {
        BlendMode::Opaque => src,
        BlendMode::Alpha => {
            let dst = texel::decode(target.color_format, texel_bytes);
            let rgb = src.truncate() * src.w + dst.truncate() * (1.0 - src.w);
            rgb.extend(src.w)
        }
        BlendMode::Additive => {
            let dst = texel::decode(target.color_format, texel_bytes);
            (src.truncate() + dst.truncate()).extend(src.w)
        }
    };
    texel::encode(target.color_format, out, texel_bytes);
}

/// Bilinear or nearest fetch from a decoded mip level, `uv` already wrapped into [0, 1].
pub fn sample_level(
    format: TextureFormat,
    extent: Extent2D,
    data: &[u8],
    uv: Vec2,
    linear: bool,
) -> Vec4 {
    let bpp = format.bytes_per_pixel() as usize;
    let (w, h) = (extent.width.max(1) as i32, extent.height.max(1) as i32);
    let fetch = |x: i32, y: i32| {
        let x = x.clamp(0, w - 1) as usize;
        let y = y.clamp(0, h - 1) as usize;
        let start = (y * w as usize + x) * bpp;
        texel::decode(format, &data[start..start + bpp])
    };

    let x = uv.x * w as f32 - 0.5;
    let y = uv.y * h as f32 - 0.5;
    if !linear {
        return fetch((x + 0.5).floor() as i32, (y + 0.5).floor() as i32);
    }
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i32, y0 as i32);
    let top = fetch(x0, y0).lerp(fetch(x0 + 1, y0), fx);
    let bottom = fetch(x0, y0 + 1).lerp(fetch(x0 + 1, y0 + 1), fx);
    top.lerp(bottom, fy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, y: f32) -> ScreenVertex {
        ScreenVertex {
            x,
            y,
            z: 0.0,
            inv_w: 1.0,
            varyings: [Vec4::ZERO; MAX_VARYINGS],
        }
    }

    #[test]
    fn screen_winding_matches_on_screen_direction() {
        // top left, bottom left, top right: counter-clockwise on screen
        let ccw = [vertex(0.0, 0.0), vertex(0.0, 2.0), vertex(2.0, 0.0)];
        assert!(signed_area(&ccw) > 0.0);
        let cw = [vertex(0.0, 0.0), vertex(2.0, 0.0), vertex(0.0, 2.0)];
        assert!(signed_area(&cw) < 0.0);
    }

    #[test]
    fn shared_edges_have_one_owner() {
        let (a, b) = (vertex(0.0, 0.0), vertex(3.0, 5.0));
        assert_ne!(owns_edge(&a, &b), owns_edge(&b, &a));
        let (c, d) = (vertex(0.0, 1.0), vertex(4.0, 1.0));
        assert_ne!(owns_edge(&c, &d), owns_edge(&d, &c));
    }

    #[test]
    fn left_and_top_edges_are_owned() {
        // Flat top, left side vertical, hypotenuse on the bottom right
        let (a, b, c) = (vertex(0.0, 0.0), vertex(4.0, 0.0), vertex(0.0, 4.0));
        assert!(edge(&a, &b, c.x, c.y) > 0.0);
        assert!(owns_edge(&a, &b), "top");
        assert!(owns_edge(&c, &a), "left");
        assert!(!owns_edge(&b, &c));

        // Flat bottom, right side vertical
        let (a, b, c) = (vertex(0.0, 4.0), vertex(4.0, 0.0), vertex(4.0, 4.0));
        assert!(edge(&a, &b, c.x, c.y) > 0.0);
        assert!(!owns_edge(&b, &c), "right");
        assert!(!owns_edge(&c, &a), "bottom");
        assert!(owns_edge(&a, &b));
    }

    #[test]
    fn near_plane_clipping_splits_the_triangle() {
        let inside = VertexOutput::new(Vec4::new(0.0, 0.0, 0.5, 1.0));
        let behind = VertexOutput::new(Vec4::new(0.0, 1.0, -0.5, 1.0));
        let polygon = clip_depth(vec![inside, inside, behind]);
        assert_eq!(polygon.len(), 4);
        assert!(polygon.iter().all(|v| v.position.z >= 0.0));
    }

    #[test]
    fn nearest_sampling_picks_the_texel_under_uv() {
        let data = [255, 0, 0, 255, 0, 255, 0, 255];
        let extent = Extent2D::new(2, 1);
        let left = sample_level(TextureFormat::Rgba8Unorm, extent, &data, Vec2::new(0.2, 0.5), false);
        let right = sample_level(TextureFormat::Rgba8Unorm, extent, &data, Vec2::new(0.8, 0.5), false);
        assert_eq!(left, Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(right, Vec4::new(0.0, 1.0, 0.0, 1.0));
        let middle = sample_level(TextureFormat::Rgba8Unorm, extent, &data, Vec2::new(0.5, 0.5), true);
        assert!((middle.x - 0.5).abs() < 1e-5);
    }
}
