/// "Resources" are the objects a caller builds and hands to the renderer:
/// programs, materials, meshes and textures. The renderer never owns them.

pub mod builtin;
pub mod material;
pub mod mesh;
pub mod shader;
pub mod texture;
pub mod vertex;
