use glam::{Mat4, Vec2, Vec3, Vec4};
use crate::renderer::resources::shader::{ParamType, ShaderLayout};

pub const MAX_VARYINGS: usize = 4;
pub const MAX_VERTEX_ATTRIBUTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexOutput {
    /// Clip-space position.
    pub position: Vec4,
    pub varyings: [Vec4; MAX_VARYINGS],
}

impl VertexOutput {
    pub fn new(position: Vec4) -> Self {
        Self {
            position,
            varyings: [Vec4::ZERO; MAX_VARYINGS],
        }
    }

    pub fn with_varying(mut self, index: usize, value: Vec4) -> Self {
        self.varyings[index] = value;
        self
    }
}

/// Read access to the uniform blocks bound for a draw, addressed by member name.
pub struct UniformView<'a> {
    layout: &'a ShaderLayout,
    blocks: Vec<(u32, &'a [u8])>,
}

impl<'a> UniformView<'a> {
    pub fn new(layout: &'a ShaderLayout, blocks: Vec<(u32, &'a [u8])>) -> Self {
        Self { layout, blocks }
    }

    fn member_bytes(&self, name: &str, ty: ParamType) -> Option<&'a [u8]> {
        let (block, member) = self.layout.find_param(name)?;
        if member.ty != ty {
            return None;
        }
        let bytes = self
            .blocks
            .iter()
            .find(|(binding, _)| *binding == block.binding)
            .map(|(_, bytes)| *bytes)?;
        let start = member.offset as usize;
        bytes.get(start..start + member.size as usize)
    }

    fn floats<const N: usize>(&self, name: &str, ty: ParamType) -> Option<[f32; N]> {
        let bytes = self.member_bytes(name, ty)?;
        let bytes = bytes.get(..N * 4)?;
        let mut out = [0.0f32; N];
        for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = bytemuck::pod_read_unaligned(chunk);
        }
        Some(out)
    }

    pub fn float(&self, name: &str) -> f32 {
        self.floats::<1>(name, ParamType::Float).map_or(0.0, |[v]| v)
    }

    pub fn vec2(&self, name: &str) -> Vec2 {
        self.floats::<2>(name, ParamType::Vec2).map_or(Vec2::ZERO, Vec2::from_array)
    }

    pub fn vec3(&self, name: &str) -> Vec3 {
        self.floats::<3>(name, ParamType::Vec3).map_or(Vec3::ZERO, Vec3::from_array)
    }

    pub fn vec4(&self, name: &str) -> Vec4 {
        self.floats::<4>(name, ParamType::Vec4).map_or(Vec4::ZERO, Vec4::from_array)
    }

    pub fn mat4(&self, name: &str) -> Mat4 {
        self.floats::<16>(name, ParamType::Mat4)
            .map_or(Mat4::IDENTITY, |cols| Mat4::from_cols_array(&cols))
    }
}

/// Sampling hook the soft device provides for the textures bound to a draw.
pub trait TextureLookup {
    fn sample(&self, texture_binding: u32, sampler_binding: Option<u32>, uv: Vec2) -> Vec4;
}

pub struct TextureView<'a> {
    layout: &'a ShaderLayout,
    lookup: &'a dyn TextureLookup,
}

impl<'a> TextureView<'a> {
    pub fn new(layout: &'a ShaderLayout, lookup: &'a dyn TextureLookup) -> Self {
        Self { layout, lookup }
    }

    pub fn sample(&self, name: &str, uv: Vec2) -> Vec4 {
        match self.layout.texture(name) {
            Some(slot) => self.lookup.sample(slot.binding, slot.sampler_binding, uv),
            None => Vec4::ZERO,
        }
    }
}

/// CPU implementation of a shader program, run by the soft device.
pub trait SoftShader: Send + Sync {
    /// `attributes` is indexed by vertex input location.
    fn vertex(&self, attributes: &[Vec4; MAX_VERTEX_ATTRIBUTES], uniforms: &UniformView) -> VertexOutput;

    fn fragment(
        &self,
        varyings: &[Vec4; MAX_VARYINGS],
        uniforms: &UniformView,
        textures: &TextureView,
    ) -> Vec4;
}
