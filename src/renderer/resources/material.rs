use std::collections::BTreeMap;
use std::sync::Arc;
use color_eyre::Result;
use glam::{Mat4, Vec2, Vec3, Vec4};
use crate::renderer::camera::CameraView;
use crate::renderer::contexts::device_ctx::types::{ImageId, SamplerId};
use crate::renderer::error::configuration_error;
use crate::renderer::resources::shader::{ParamType, ShaderProgram};
use crate::renderer::resources::texture::Texture;
use crate::renderer::transform::Transform;
use crate::renderer::util::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// Blended over what is already drawn; callers order their own draws.
    Alpha,
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

/// Winding of front faces as seen on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    #[default]
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    pub fn passes(&self, incoming: f32, stored: f32) -> bool {
        match self {
            Self::Never => false,
            Self::Less => incoming < stored,
            Self::Equal => incoming == stored,
            Self::LessOrEqual => incoming <= stored,
            Self::Greater => incoming > stored,
            Self::NotEqual => incoming != stored,
            Self::GreaterOrEqual => incoming >= stored,
            Self::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

/// Fixed-function state a pipeline is specialized for. Changing any field
/// changes the material's state fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub blend: BlendMode,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub polygon_mode: PolygonMode,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            blend: BlendMode::Opaque,
            cull: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            depth_test: true,
            depth_write: true,
            depth_compare: CompareOp::LessOrEqual,
            polygon_mode: PolygonMode::Fill,
        }
    }
}

impl PipelineState {
    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_cull(mut self, cull: CullMode, front_face: FrontFace) -> Self {
        self.cull = cull;
        self.front_face = front_face;
        self
    }

    pub fn with_depth(mut self, test: bool, write: bool, compare: CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    pub fn with_polygon_mode(mut self, mode: PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    fn hash_into(&self, hasher: &mut Fingerprint) {
        hasher
            .write_u32(self.blend as u32)
            .write_u32(self.cull as u32)
            .write_u32(self.front_face as u32)
            .write_u32(self.depth_test as u32)
            .write_u32(self.depth_write as u32)
            .write_u32(self.depth_compare as u32)
            .write_u32(self.polygon_mode as u32);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    UInt(u32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::Float(_) => ParamType::Float,
            Self::Int(_) => ParamType::Int,
            Self::UInt(_) => ParamType::UInt,
            Self::Vec2(_) => ParamType::Vec2,
            Self::Vec3(_) => ParamType::Vec3,
            Self::Vec4(_) => ParamType::Vec4,
            Self::Mat4(_) => ParamType::Mat4,
        }
    }

    /// Writes the value's bytes at the start of `out`, which must be large enough.
    pub fn write_to(&self, out: &mut [u8]) {
        let bytes: &[u8] = match self {
            Self::Float(v) => bytemuck::bytes_of(v),
            Self::Int(v) => bytemuck::bytes_of(v),
            Self::UInt(v) => bytemuck::bytes_of(v),
            Self::Vec2(v) => bytemuck::bytes_of(v),
            Self::Vec3(v) => bytemuck::bytes_of(v),
            Self::Vec4(v) => bytemuck::bytes_of(v),
            Self::Mat4(v) => bytemuck::bytes_of(v),
        };
        out[..bytes.len()].copy_from_slice(bytes);
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::UInt(v)
    }
}

impl From<Vec2> for ParamValue {
    fn from(v: Vec2) -> Self {
        Self::Vec2(v)
    }
}

impl From<Vec3> for ParamValue {
    fn from(v: Vec3) -> Self {
        Self::Vec3(v)
    }
}

impl From<Vec4> for ParamValue {
    fn from(v: Vec4) -> Self {
        Self::Vec4(v)
    }
}

impl From<Mat4> for ParamValue {
    fn from(v: Mat4) -> Self {
        Self::Mat4(v)
    }
}

/// Values the renderer fills in per draw from the current transform and camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoBinding {
    World,
    View,
    Projection,
    ViewProjection,
    WorldView,
    WorldViewProjection,
    InverseTransposeWorld,
    InverseView,
    /// `vec3` position, or `vec4` with w = 1.
    CameraPosition,
    /// `vec2` size in pixels, or `vec4(width, height, 1/width, 1/height)`.
    ViewportSize,
}

impl AutoBinding {
    pub fn accepts(&self, ty: ParamType) -> bool {
        match self {
            Self::CameraPosition => matches!(ty, ParamType::Vec3 | ParamType::Vec4),
            Self::ViewportSize => matches!(ty, ParamType::Vec2 | ParamType::Vec4),
            _ => ty == ParamType::Mat4,
        }
    }

    pub fn resolve(&self, ty: ParamType, transform: &Transform, view: &CameraView) -> ParamValue {
        match self {
            Self::World => ParamValue::Mat4(transform.world_matrix()),
            Self::View => ParamValue::Mat4(view.view),
            Self::Projection => ParamValue::Mat4(view.projection),
            Self::ViewProjection => ParamValue::Mat4(view.view_projection),
            Self::WorldView => ParamValue::Mat4(transform.world_view_matrix(view)),
            Self::WorldViewProjection => ParamValue::Mat4(transform.world_view_proj_matrix(view)),
            Self::InverseTransposeWorld => ParamValue::Mat4(transform.inv_transposed_world_matrix()),
            Self::InverseView => ParamValue::Mat4(view.view.inverse()),
            Self::CameraPosition => match ty {
                ParamType::Vec4 => ParamValue::Vec4(view.position.extend(1.0)),
                _ => ParamValue::Vec3(view.position),
            },
            Self::ViewportSize => {
                let size = view.viewport_size;
                match ty {
                    ParamType::Vec4 => ParamValue::Vec4(Vec4::new(
                        size.x,
                        size.y,
                        1.0 / size.x.max(1.0),
                        1.0 / size.y.max(1.0),
                    )),
                    _ => ParamValue::Vec2(size),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamSlot {
    Value(ParamValue),
    Auto(AutoBinding),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    pub image: ImageId,
    pub sampler: SamplerId,
}

/// A shader program plus the fixed-function state and parameter values to draw it with.
///
/// Not `Clone`: the id keys the pipeline cache, so every material comes from
/// `Renderer::create_material`.
#[derive(Debug)]
pub struct Material {
    id: MaterialId,
    name: String,
    program: Arc<ShaderProgram>,
    state: PipelineState,
    params: BTreeMap<String, ParamSlot>,
    textures: BTreeMap<String, TextureBinding>,
}

impl Material {
    pub(crate) fn new(id: MaterialId, name: &str, program: Arc<ShaderProgram>) -> Self {
        Self {
            id,
            name: name.to_owned(),
            program,
            state: PipelineState::default(),
            params: BTreeMap::new(),
            textures: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> MaterialId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Arc<ShaderProgram> {
        &self.program
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn set_state(&mut self, state: PipelineState) {
        self.state = state;
    }

    pub fn set_blend_mode(&mut self, blend: BlendMode) {
        self.state.blend = blend;
    }

    pub fn set_cull_mode(&mut self, cull: CullMode, front_face: FrontFace) {
        self.state.cull = cull;
        self.state.front_face = front_face;
    }

    pub fn set_depth_test(&mut self, enabled: bool) {
        self.state.depth_test = enabled;
    }

    pub fn set_depth_write(&mut self, enabled: bool) {
        self.state.depth_write = enabled;
    }

    pub fn set_polygon_mode(&mut self, mode: PolygonMode) {
        self.state.polygon_mode = mode;
    }

    /// Sets an explicit value for a uniform member declared by the program.
    pub fn set_param(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        let value = value.into();
        let declared = self.declared_type(name, "set_param")?;
        if declared != value.param_type() {
            return Err(configuration_error(
                "set_param",
                format!(
                    "material `{}`: parameter `{}` is {:?}, got {:?}",
                    self.name,
                    name,
                    declared,
                    value.param_type()
                ),
            ));
        }
        self.params.insert(name.to_owned(), ParamSlot::Value(value));
        Ok(())
    }

    /// Ties a uniform member to a value the renderer resolves per draw.
    pub fn bind_auto(&mut self, name: &str, binding: AutoBinding) -> Result<()> {
        let declared = self.declared_type(name, "bind_auto")?;
        if !binding.accepts(declared) {
            return Err(configuration_error(
                "bind_auto",
                format!(
                    "material `{}`: {:?} cannot feed parameter `{}` of type {:?}",
                    self.name, binding, name, declared
                ),
            ));
        }
        self.params.insert(name.to_owned(), ParamSlot::Auto(binding));
        Ok(())
    }

    pub fn set_texture(&mut self, name: &str, texture: &Texture) -> Result<()> {
        if self.program.layout().texture(name).is_none() {
            return Err(configuration_error(
                "set_texture",
                format!(
                    "material `{}`: program `{}` declares no texture `{}`",
                    self.name,
                    self.program.name(),
                    name
                ),
            ));
        }
        self.textures.insert(name.to_owned(), texture.binding());
        Ok(())
    }

    pub fn param(&self, name: &str) -> Option<&ParamSlot> {
        self.params.get(name)
    }

    pub fn texture(&self, name: &str) -> Option<TextureBinding> {
        self.textures.get(name).copied()
    }

    /// Hash of everything that shapes the pipeline: program identity and
    /// fixed-function state. Parameter values and textures are not included.
    pub fn state_fingerprint(&self) -> u64 {
        let mut hasher = Fingerprint::new();
        hasher.write_u64(self.program.id());
        self.state.hash_into(&mut hasher);
        hasher.finish()
    }

    fn declared_type(&self, name: &str, operation: &'static str) -> Result<ParamType> {
        self.program
            .layout()
            .find_param(name)
            .map(|(_, member)| member.ty)
            .ok_or_else(|| {
                configuration_error(
                    operation,
                    format!(
                        "material `{}`: program `{}` declares no parameter `{}`",
                        self.name,
                        self.program.name(),
                        name
                    ),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::error::classify;
    use crate::renderer::resources::builtin;

    fn unlit() -> Material {
        let program = Arc::new(builtin::unlit_color().unwrap());
        Material::new(MaterialId(1), "unlit", program)
    }

    #[test]
    fn unknown_parameter_fails_fast() {
        let mut material = unlit();
        let report = material.set_param("does_not_exist", 1.0f32).unwrap_err();
        assert!(classify(&report).unwrap().is_configuration());
        let report = material
            .bind_auto("does_not_exist", AutoBinding::World)
            .unwrap_err();
        assert!(classify(&report).unwrap().is_configuration());
    }

    #[test]
    fn parameter_type_must_match() {
        let mut material = unlit();
        assert!(material.set_param("color", Vec3::ONE).is_err());
        assert!(material.set_param("color", Vec4::ONE).is_ok());
        assert!(material.bind_auto("color", AutoBinding::World).is_err());
        assert!(material
            .bind_auto("world_view_proj", AutoBinding::WorldViewProjection)
            .is_ok());
    }

    #[test]
    fn fingerprint_ignores_parameter_values() {
        let mut material = unlit();
        let before = material.state_fingerprint();
        material.set_param("color", Vec4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
        assert_eq!(before, material.state_fingerprint());

        material.set_blend_mode(BlendMode::Alpha);
        let blended = material.state_fingerprint();
        assert_ne!(before, blended);

        material.set_blend_mode(BlendMode::Opaque);
        assert_eq!(before, material.state_fingerprint());

        material.set_depth_write(false);
        assert_ne!(before, material.state_fingerprint());
    }

    #[test]
    fn compare_ops() {
        assert!(CompareOp::LessOrEqual.passes(0.5, 0.5));
        assert!(!CompareOp::Less.passes(0.5, 0.5));
        assert!(CompareOp::Always.passes(2.0, 0.0));
        assert!(!CompareOp::Never.passes(0.0, 1.0));
    }
}
