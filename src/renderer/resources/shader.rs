use std::fmt;
use std::sync::Arc;
use color_eyre::Result;
use naga::back::spv;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use crate::renderer::contexts::device_ctx::soft::program::SoftShader;
use crate::renderer::contexts::device_ctx::types::{BindingKind, BindingLayoutDesc, BindingLayoutEntry};
use crate::renderer::error::configuration_error;
use crate::renderer::util::Fingerprint;

/// Value type of a uniform member, as far as parameters and auto-bindings care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    Float,
    Int,
    UInt,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub ty: ParamType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlock {
    pub name: String,
    pub binding: u32,
    pub size: u32,
    pub members: Vec<UniformMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSlot {
    pub name: String,
    pub binding: u32,
    /// Sampler slot paired with this texture, if the program declares one.
    pub sampler_binding: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerSlot {
    pub name: String,
    pub binding: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInput {
    pub name: String,
    pub location: u32,
    pub components: u32,
}

/// Everything the renderer learns about a program by introspecting it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderLayout {
    pub uniform_blocks: Vec<UniformBlock>,
    pub textures: Vec<TextureSlot>,
    pub samplers: Vec<SamplerSlot>,
    pub vertex_inputs: Vec<VertexInput>,
}

impl ShaderLayout {
    fn reflect(module: &naga::Module, vertex_entry: &naga::EntryPoint) -> Result<Self> {
        let gctx = module.to_ctx();
        let mut layout = ShaderLayout::default();

        for (_, var) in module.global_variables.iter() {
            let Some(binding) = var.binding.as_ref() else {
                continue;
            };
            let var_name = var
                .name
                .clone()
                .unwrap_or_else(|| format!("binding{}", binding.binding));
            if binding.group != 0 {
                return Err(configuration_error(
                    "reflect shader",
                    format!("`{}` uses bind group {}, only group 0 is supported", var_name, binding.group),
                ));
            }

            let ty = &module.types[var.ty];
            match var.space {
                naga::AddressSpace::Uniform => {
                    let size = ty.inner.size(gctx);
                    let members = match &ty.inner {
                        naga::TypeInner::Struct { members, .. } => members
                            .iter()
                            .map(|member| {
                                let member_ty = &module.types[member.ty].inner;
                                UniformMember {
                                    name: member.name.clone().unwrap_or_default(),
                                    offset: member.offset,
                                    size: member_ty.size(gctx),
                                    ty: param_type(member_ty),
                                }
                            })
                            .collect(),
                        inner => vec![UniformMember {
                            name: var_name.clone(),
                            offset: 0,
                            size,
                            ty: param_type(inner),
                        }],
                    };
                    layout.uniform_blocks.push(UniformBlock {
                        name: var_name,
                        binding: binding.binding,
                        size,
                        members,
                    });
                }
                naga::AddressSpace::Handle => match ty.inner {
                    naga::TypeInner::Image { .. } => layout.textures.push(TextureSlot {
                        name: var_name,
                        binding: binding.binding,
                        sampler_binding: None,
                    }),
                    naga::TypeInner::Sampler { .. } => layout.samplers.push(SamplerSlot {
                        name: var_name,
                        binding: binding.binding,
                    }),
                    _ => {}
                },
                other => {
                    return Err(configuration_error(
                        "reflect shader",
                        format!("`{}` lives in unsupported address space {:?}", var_name, other),
                    ));
                }
            }
        }

        // `albedo` pairs with `albedo_sampler`; a lone sampler serves every texture
        let lone_sampler = match layout.samplers.as_slice() {
            [only] => Some(only.binding),
            _ => None,
        };
        for texture in &mut layout.textures {
            let paired_name = format!("{}_sampler", texture.name);
            texture.sampler_binding = layout
                .samplers
                .iter()
                .find(|s| s.name == paired_name)
                .map(|s| s.binding)
                .or(lone_sampler);
        }

        let mut names = std::collections::HashSet::new();
        for member in layout.uniform_blocks.iter().flat_map(|b| b.members.iter()) {
            if !names.insert(member.name.as_str()) {
                return Err(configuration_error(
                    "reflect shader",
                    format!("uniform member `{}` is declared more than once", member.name),
                ));
            }
        }

        for arg in &vertex_entry.function.arguments {
            match &arg.binding {
                Some(naga::Binding::Location { location, .. }) => {
                    layout.vertex_inputs.push(VertexInput {
                        name: arg.name.clone().unwrap_or_default(),
                        location: *location,
                        components: component_count(&module.types[arg.ty].inner),
                    });
                }
                Some(naga::Binding::BuiltIn(_)) => {}
                None => {
                    if let naga::TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
                        for member in members {
                            if let Some(naga::Binding::Location { location, .. }) = &member.binding {
                                layout.vertex_inputs.push(VertexInput {
                                    name: member.name.clone().unwrap_or_default(),
                                    location: *location,
                                    components: component_count(&module.types[member.ty].inner),
                                });
                            }
                        }
                    }
                }
            }
        }
        layout.vertex_inputs.sort_by_key(|input| input.location);

        Ok(layout)
    }

    pub fn find_param(&self, name: &str) -> Option<(&UniformBlock, &UniformMember)> {
        self.uniform_blocks.iter().find_map(|block| {
            block
                .members
                .iter()
                .find(|member| member.name == name)
                .map(|member| (block, member))
        })
    }

    pub fn texture(&self, name: &str) -> Option<&TextureSlot> {
        self.textures.iter().find(|t| t.name == name)
    }

    pub fn binding_layout(&self) -> BindingLayoutDesc {
        let mut entries = Vec::new();
        for block in &self.uniform_blocks {
            entries.push(BindingLayoutEntry {
                binding: block.binding,
                kind: BindingKind::UniformBuffer {
                    size: block.size as u64,
                },
            });
        }
        for texture in &self.textures {
            entries.push(BindingLayoutEntry {
                binding: texture.binding,
                kind: BindingKind::SampledImage,
            });
        }
        for sampler in &self.samplers {
            entries.push(BindingLayoutEntry {
                binding: sampler.binding,
                kind: BindingKind::Sampler,
            });
        }
        entries.sort_by_key(|e| e.binding);
        BindingLayoutDesc { entries }
    }
}

fn param_type(inner: &naga::TypeInner) -> ParamType {
    use naga::{ScalarKind, TypeInner, VectorSize};
    match *inner {
        TypeInner::Scalar(scalar) => match scalar.kind {
            ScalarKind::Float => ParamType::Float,
            ScalarKind::Sint => ParamType::Int,
            ScalarKind::Uint => ParamType::UInt,
            _ => ParamType::Other,
        },
        TypeInner::Vector { size, scalar } if scalar.kind == ScalarKind::Float && scalar.width == 4 => {
            match size {
                VectorSize::Bi => ParamType::Vec2,
                VectorSize::Tri => ParamType::Vec3,
                VectorSize::Quad => ParamType::Vec4,
            }
        }
        TypeInner::Matrix {
            columns: VectorSize::Quad,
            rows: VectorSize::Quad,
            scalar,
        } if scalar.width == 4 => ParamType::Mat4,
        _ => ParamType::Other,
    }
}

fn component_count(inner: &naga::TypeInner) -> u32 {
    match *inner {
        naga::TypeInner::Vector { size, .. } => size as u32,
        _ => 1,
    }
}

/// A vertex + fragment program, compiled from WGSL and introspected once.
pub struct ShaderProgram {
    id: u64,
    name: String,
    layout: ShaderLayout,
    vertex_entry: String,
    fragment_entry: String,
    vertex_spirv: Vec<u32>,
    fragment_spirv: Vec<u32>,
    soft: Option<Arc<dyn SoftShader>>,
}

impl ShaderProgram {
    pub fn from_wgsl(name: &str, source: &str) -> Result<Self> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| {
            configuration_error("compile shader", format!("{}: {}", name, e.emit_to_string(source)))
        })?;
        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| configuration_error("compile shader", format!("{}: {}", name, e)))?;

        let find_entry = |stage: naga::ShaderStage| {
            module
                .entry_points
                .iter()
                .find(|ep| ep.stage == stage)
                .ok_or_else(|| {
                    configuration_error(
                        "compile shader",
                        format!("{} has no {:?} entry point", name, stage),
                    )
                })
        };
        let vertex = find_entry(naga::ShaderStage::Vertex)?;
        let fragment = find_entry(naga::ShaderStage::Fragment)?;

        let layout = ShaderLayout::reflect(&module, vertex)?;
        let vertex_spirv = emit_spirv(name, &module, &info, naga::ShaderStage::Vertex, &vertex.name)?;
        let fragment_spirv =
            emit_spirv(name, &module, &info, naga::ShaderStage::Fragment, &fragment.name)?;

        let id = Fingerprint::new().write_str(name).write_str(source).finish();
        log::debug!(
            "Compiled shader program `{}`: {} uniform blocks, {} textures, {} vertex inputs",
            name,
            layout.uniform_blocks.len(),
            layout.textures.len(),
            layout.vertex_inputs.len()
        );

        Ok(Self {
            id,
            name: name.to_owned(),
            layout,
            vertex_entry: vertex.name.clone(),
            fragment_entry: fragment.name.clone(),
            vertex_spirv,
            fragment_spirv,
            soft: None,
        })
    }

    /// Attaches the CPU implementation the soft backend runs for this program.
    pub fn with_soft_shader(mut self, shader: Arc<dyn SoftShader>) -> Self {
        self.soft = Some(shader);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &ShaderLayout {
        &self.layout
    }

    pub fn vertex_entry(&self) -> &str {
        &self.vertex_entry
    }

    pub fn fragment_entry(&self) -> &str {
        &self.fragment_entry
    }

    pub fn vertex_spirv(&self) -> &[u32] {
        &self.vertex_spirv
    }

    pub fn fragment_spirv(&self) -> &[u32] {
        &self.fragment_spirv
    }

    pub fn soft_shader(&self) -> Option<&Arc<dyn SoftShader>> {
        self.soft.as_ref()
    }
}

impl fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("name", &self.name)
            .field("id", &format_args!("{:016x}", self.id))
            .field("layout", &self.layout)
            .field("soft", &self.soft.is_some())
            .finish()
    }
}

fn emit_spirv(
    name: &str,
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> Result<Vec<u32>> {
    let mut options = spv::Options::default();
    // WGSL clip space is Y-up; flip it for Vulkan
    options.flags |= spv::WriterFlags::ADJUST_COORDINATE_SPACE;
    let pipeline_options = spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_owned(),
    };
    spv::write_vec(module, info, &options, Some(&pipeline_options)).map_err(|e| {
        configuration_error("compile shader", format!("{} ({:?}): {}", name, stage, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SHADER: &str = r#"
struct Globals {
    world_view_proj: mat4x4<f32>,
    tint: vec4<f32>,
    eye: vec3<f32>,
    strength: f32,
};

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var albedo: texture_2d<f32>;
@group(0) @binding(2) var albedo_sampler: sampler;

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) uv: vec2<f32>) -> VertexOut {
    var out: VertexOut;
    out.clip = globals.world_view_proj * vec4<f32>(position, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    return textureSample(albedo, albedo_sampler, in.uv) * globals.tint * globals.strength;
}
"#;

    #[test]
    fn reflects_uniforms_textures_and_inputs() {
        let program = ShaderProgram::from_wgsl("test", TEST_SHADER).unwrap();
        let layout = program.layout();

        assert_eq!(layout.uniform_blocks.len(), 1);
        let block = &layout.uniform_blocks[0];
        assert_eq!(block.binding, 0);
        assert_eq!(block.size, 96);

        let (_, wvp) = layout.find_param("world_view_proj").unwrap();
        assert_eq!((wvp.offset, wvp.ty), (0, ParamType::Mat4));
        let (_, tint) = layout.find_param("tint").unwrap();
        assert_eq!((tint.offset, tint.ty), (64, ParamType::Vec4));
        let (_, eye) = layout.find_param("eye").unwrap();
        assert_eq!((eye.offset, eye.ty), (80, ParamType::Vec3));
        let (_, strength) = layout.find_param("strength").unwrap();
        assert_eq!((strength.offset, strength.ty), (92, ParamType::Float));
        assert!(layout.find_param("missing").is_none());

        let albedo = layout.texture("albedo").unwrap();
        assert_eq!(albedo.binding, 1);
        assert_eq!(albedo.sampler_binding, Some(2));

        let locations: Vec<u32> = layout.vertex_inputs.iter().map(|v| v.location).collect();
        assert_eq!(locations, vec![0, 2]);

        assert_eq!(program.vertex_entry(), "vs_main");
        assert_eq!(program.fragment_entry(), "fs_main");
        assert!(!program.vertex_spirv().is_empty());
        assert!(!program.fragment_spirv().is_empty());
    }

    #[test]
    fn binding_layout_is_sorted_by_binding() {
        let program = ShaderProgram::from_wgsl("test", TEST_SHADER).unwrap();
        let desc = program.layout().binding_layout();
        let bindings: Vec<u32> = desc.entries.iter().map(|e| e.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2]);
        assert_eq!(desc.entries[0].kind, BindingKind::UniformBuffer { size: 96 });
    }

    #[test]
    fn invalid_source_is_a_configuration_error() {
        let report = ShaderProgram::from_wgsl("broken", "fn nope( {").unwrap_err();
        let err = crate::renderer::error::classify(&report).unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn program_identity_follows_source() {
        let a = ShaderProgram::from_wgsl("test", TEST_SHADER).unwrap();
        let b = ShaderProgram::from_wgsl("test", TEST_SHADER).unwrap();
        let c = ShaderProgram::from_wgsl("other", TEST_SHADER).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }
}
