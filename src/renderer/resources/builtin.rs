use std::sync::Arc;
use color_eyre::Result;
use glam::{Vec2, Vec4};
use crate::renderer::contexts::device_ctx::soft::program::{
    SoftShader, TextureView, UniformView, VertexOutput, MAX_VARYINGS, MAX_VERTEX_ATTRIBUTES,
};
use crate::renderer::resources::shader::ShaderProgram;

pub const UNLIT_COLOR_WGSL: &str = r#"
struct Uniforms {
    world_view_proj: mat4x4<f32>,
    color: vec4<f32>,
};

@group(0) @binding(0) var<uniform> uniforms: Uniforms;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return uniforms.world_view_proj * vec4<f32>(position, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return uniforms.color;
}
"#;

pub const UNLIT_TEXTURED_WGSL: &str = r#"
struct Uniforms {
    world_view_proj: mat4x4<f32>,
    tint: vec4<f32>,
};

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(0) @binding(1) var albedo: texture_2d<f32>;
@group(0) @binding(2) var albedo_sampler: sampler;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) texcoord: vec2<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) texcoord: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = uniforms.world_view_proj * vec4<f32>(position, 1.0);
    out.texcoord = texcoord;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(albedo, albedo_sampler, in.texcoord) * uniforms.tint;
}
"#;

struct UnlitColor;

impl SoftShader for UnlitColor {
    fn vertex(&self, attributes: &[Vec4; MAX_VERTEX_ATTRIBUTES], uniforms: &UniformView) -> VertexOutput {
        let position = attributes[0].truncate().extend(1.0);
        VertexOutput::new(uniforms.mat4("world_view_proj") * position)
    }

    fn fragment(&self, _varyings: &[Vec4; MAX_VARYINGS], uniforms: &UniformView, _textures: &TextureView) -> Vec4 {
        uniforms.vec4("color")
    }
}

struct UnlitTextured;

impl SoftShader for UnlitTextured {
    fn vertex(&self, attributes: &[Vec4; MAX_VERTEX_ATTRIBUTES], uniforms: &UniformView) -> VertexOutput {
        let position = attributes[0].truncate().extend(1.0);
        VertexOutput::new(uniforms.mat4("world_view_proj") * position).with_varying(0, attributes[2])
    }

    fn fragment(&self, varyings: &[Vec4; MAX_VARYINGS], uniforms: &UniformView, textures: &TextureView) -> Vec4 {
        let uv = Vec2::new(varyings[0].x, varyings[0].y);
        textures.sample("albedo", uv) * uniforms.vec4("tint")
    }
}

/// Solid color: `world_view_proj` (mat4) and `color` (vec4).
pub fn unlit_color() -> Result<ShaderProgram> {
    Ok(ShaderProgram::from_wgsl("unlit_color", UNLIT_COLOR_WGSL)?.with_soft_shader(Arc::new(UnlitColor)))
}

/// Texture times tint: `world_view_proj`, `tint`, texture `albedo`.
pub fn unlit_textured() -> Result<ShaderProgram> {
    Ok(ShaderProgram::from_wgsl("unlit_textured", UNLIT_TEXTURED_WGSL)?
        .with_soft_shader(Arc::new(UnlitTextured)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_programs_compile() {
        let color = unlit_color().unwrap();
        assert!(color.layout().find_param("color").is_some());
        assert_eq!(color.layout().vertex_inputs.len(), 1);
        assert!(color.soft_shader().is_some());

        let textured = unlit_textured().unwrap();
        assert_eq!(textured.layout().textures.len(), 1);
        assert_eq!(textured.layout().textures[0].sampler_binding, Some(2));
    }
}
