use color_eyre::Result;
use crate::renderer::camera::CameraView;
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::GpuDevice;
use crate::renderer::contexts::resource_ctx::uploader::Uploader;
use crate::renderer::resources::material::{Material, ParamSlot, TextureBinding};
use crate::renderer::resources::shader::{ShaderLayout, UniformBlock};
use crate::renderer::resources::texture::{Texture, TextureData};
use crate::renderer::transform::Transform;

struct UniformSlot {
    buffer: BufferId,
    /// Bytes last written to `buffer`.
    shadow: Vec<u8>,
}

struct TextureSlotState {
    name: String,
    binding: u32,
    sampler_binding: Option<u32>,
    current: TextureBinding,
}

/// A device binding set plus the uniform buffers it points at. Owned by one
/// pipeline cache entry and kept across pipeline rebuilds.
pub struct BindingSet {
    id: BindingSetId,
    uniforms: Vec<UniformSlot>,
    textures: Vec<TextureSlotState>,
    buffer_writes: u64,
    texture_writes: u64,
}

impl BindingSet {
    pub fn id(&self) -> BindingSetId {
        self.id
    }

    /// Uniform buffers backing this set, in binding order.
    pub fn uniform_buffers(&self) -> Vec<BufferId> {
        self.uniforms.iter().map(|u| u.buffer).collect()
    }

    /// Number of uniform buffer uploads issued by updates so far.
    pub fn buffer_writes(&self) -> u64 {
        self.buffer_writes
    }

    /// Number of texture rebinds issued by updates so far.
    pub fn texture_writes(&self) -> u64 {
        self.texture_writes
    }
}

/// Creates binding sets shaped by a program's reflection and keeps them in
/// sync with material parameters and per-draw auto values.
///
/// Texture slots a material leaves unset are bound to a 1x1 white texture so
/// the set is always complete.
pub struct BindingSetAllocator {
    fallback: Texture,
    live: usize,
}

impl BindingSetAllocator {
    pub fn new(dev: &mut dyn GpuDevice, uploader: &Uploader) -> Result<Self> {
        let fallback = uploader.upload_texture(dev, &TextureData::solid([255, 255, 255, 255]))?;
        Ok(Self { fallback, live: 0 })
    }

    pub fn fallback_texture(&self) -> &Texture {
        &self.fallback
    }

    pub fn live_sets(&self) -> usize {
        self.live
    }

    pub fn allocate(&mut self, dev: &mut dyn GpuDevice, layout: &ShaderLayout) -> Result<BindingSet> {
        let id = dev.create_binding_set(&layout.binding_layout())?;
        let mut set = BindingSet {
            id,
            uniforms: Vec::with_capacity(layout.uniform_blocks.len()),
            textures: Vec::with_capacity(layout.textures.len()),
            buffer_writes: 0,
            texture_writes: 0,
        };
        if let Err(e) = self.fill(dev, layout, &mut set) {
            self.free(dev, set)?;
            return Err(e);
        }
        self.live += 1;
        Ok(set)
    }

    fn fill(&self, dev: &mut dyn GpuDevice, layout: &ShaderLayout, set: &mut BindingSet) -> Result<()> {
        let mut writes = Vec::new();
        for block in &layout.uniform_blocks {
            let buffer = dev.create_buffer(&BufferDesc {
                label: &block.name,
                size: block.size as u64,
                kind: BufferKind::Uniform,
            })?;
            let shadow = vec![0u8; block.size as usize];
            set.uniforms.push(UniformSlot {
                buffer,
                shadow: shadow.clone(),
            });
            dev.write_buffer(buffer, 0, &shadow)?;
            writes.push(BindingWrite {
                binding: block.binding,
                resource: BindingResource::Buffer {
                    buffer,
                    offset: 0,
                    size: block.size as u64,
                },
            });
        }

        let fallback = self.fallback.binding();
        for slot in &layout.textures {
            set.textures.push(TextureSlotState {
                name: slot.name.clone(),
                binding: slot.binding,
                sampler_binding: slot.sampler_binding,
                current: fallback,
            });
            texture_writes(&mut writes, slot.binding, slot.sampler_binding, fallback);
        }
        // Samplers that no texture claims still need something bound
        for sampler in &layout.samplers {
            if !writes.iter().any(|w| w.binding == sampler.binding) {
                writes.push(BindingWrite {
                    binding: sampler.binding,
                    resource: BindingResource::Sampler(fallback.sampler),
                });
            }
        }
        dev.write_binding_set(set.id, &writes)
    }

    /// Rewrites uniform bytes and texture bindings from `material`, resolving
    /// auto-bound members against `transform` and `view`. Members the material
    /// never set stay zero. Nothing is written when the result is unchanged.
    pub fn update(
        &self,
        dev: &mut dyn GpuDevice,
        set: &mut BindingSet,
        material: &Material,
        transform: &Transform,
        view: &CameraView,
    ) -> Result<()> {
        let layout = material.program().layout();
        for (slot, block) in set.uniforms.iter_mut().zip(&layout.uniform_blocks) {
            let bytes = pack_block(block, material, transform, view);
            if bytes != slot.shadow {
                dev.write_buffer(slot.buffer, 0, &bytes)?;
                slot.shadow = bytes;
                set.buffer_writes += 1;
            }
        }

        let mut writes = Vec::new();
        for slot in set.textures.iter_mut() {
            let wanted = material
                .texture(&slot.name)
                .unwrap_or_else(|| self.fallback.binding());
            if wanted != slot.current {
                texture_writes(&mut writes, slot.binding, slot.sampler_binding, wanted);
                slot.current = wanted;
            }
        }
        if !writes.is_empty() {
            dev.write_binding_set(set.id, &writes)?;
            set.texture_writes += 1;
        }
        Ok(())
    }

    pub fn release(&mut self, dev: &mut dyn GpuDevice, set: BindingSet) -> Result<()> {
        self.live = self.live.saturating_sub(1);
        self.free(dev, set)
    }

    fn free(&self, dev: &mut dyn GpuDevice, set: BindingSet) -> Result<()> {
        dev.destroy_binding_set(set.id)?;
        for slot in set.uniforms {
            dev.destroy_buffer(slot.buffer)?;
        }
        Ok(())
    }

    pub fn destroy(&mut self, dev: &mut dyn GpuDevice, uploader: &Uploader) -> Result<()> {
        if self.live > 0 {
            log::warn!("{} binding sets still alive at shutdown", self.live);
        }
        uploader.release_texture(dev, self.fallback.clone())
    }
}

fn texture_writes(writes: &mut Vec<BindingWrite>, binding: u32, sampler_binding: Option<u32>, texture: TextureBinding) {
    writes.push(BindingWrite {
        binding,
        resource: BindingResource::Image(texture.image),
    });
    if let Some(sampler_binding) = sampler_binding {
        writes.push(BindingWrite {
            binding: sampler_binding,
            resource: BindingResource::Sampler(texture.sampler),
        });
    }
}

fn pack_block(block: &UniformBlock, material: &Material, transform: &Transform, view: &CameraView) -> Vec<u8> {
    let mut bytes = vec![0u8; block.size as usize];
    for member in &block.members {
        let value = match material.param(&member.name) {
            Some(ParamSlot::Value(value)) => *value,
            Some(ParamSlot::Auto(auto)) => auto.resolve(member.ty, transform, view),
            None => continue,
        };
        let start = member.offset as usize;
        let end = start + member.size as usize;
        if let Some(out) = bytes.get_mut(start..end) {
            value.write_to(out);
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use glam::{Mat4, Vec3, Vec4};
    use crate::renderer::camera::Camera;
    use crate::renderer::contexts::device_ctx::soft::{SoftDevice, SoftDeviceDesc};
    use crate::renderer::handle::HandleAllocator;
    use crate::renderer::resources::builtin;
    use crate::renderer::resources::material::{AutoBinding, MaterialId};

    struct Fixture {
        dev: SoftDevice,
        uploader: Uploader,
        allocator: BindingSetAllocator,
        material: Material,
        transform: Transform,
        view: CameraView,
    }

    fn fixture() -> Fixture {
        let mut dev = SoftDevice::new(SoftDeviceDesc::default());
        let uploader = Uploader::new(&mut dev).unwrap();
        let allocator = BindingSetAllocator::new(&mut dev, &uploader).unwrap();
        let program = Arc::new(builtin::unlit_textured().unwrap());
        let mut material = Material::new(MaterialId(1), "textured", program);
        material.bind_auto("world_view_proj", AutoBinding::WorldViewProjection).unwrap();
        material.set_param("tint", Vec4::ONE).unwrap();

        let mut handles = HandleAllocator::new();
        let mut camera = Camera::new(handles.allocate());
        camera.set_position(Vec3::new(0.0, 0.0, 5.0));
        let view = camera.view_for(Extent2D::new(4, 4));
        let transform = Transform::new(handles.allocate(), Mat4::IDENTITY);
        Fixture {
            dev,
            uploader,
            allocator,
            material,
            transform,
            view,
        }
    }

    #[test]
    fn updates_are_idempotent() {
        let mut f = fixture();
        let layout = f.material.program().layout().clone();
        let mut set = f.allocator.allocate(&mut f.dev, &layout).unwrap();

        f.allocator
            .update(&mut f.dev, &mut set, &f.material, &f.transform, &f.view)
            .unwrap();
        assert_eq!(set.buffer_writes(), 1);
        assert_eq!(set.texture_writes(), 0);

        f.allocator
            .update(&mut f.dev, &mut set, &f.material, &f.transform, &f.view)
            .unwrap();
        assert_eq!(set.buffer_writes(), 1);

        f.material.set_param("tint", Vec4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
        f.allocator
            .update(&mut f.dev, &mut set, &f.material, &f.transform, &f.view)
            .unwrap();
        assert_eq!(set.buffer_writes(), 2);
    }

    #[test]
    fn uniform_bytes_follow_reflection_offsets() {
        let mut f = fixture();
        let layout = f.material.program().layout().clone();
        let mut set = f.allocator.allocate(&mut f.dev, &layout).unwrap();
        f.material.set_param("tint", Vec4::new(0.25, 0.5, 0.75, 1.0)).unwrap();
        f.allocator
            .update(&mut f.dev, &mut set, &f.material, &f.transform, &f.view)
            .unwrap();

        let (_, tint) = layout.find_param("tint").unwrap();
        let bytes = f
            .dev
            .read_buffer(set.uniform_buffers()[0], tint.offset as u64, 16)
            .unwrap();
        let values: [f32; 4] = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(values, [0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn texture_changes_rebind_only_once() {
        let mut f = fixture();
        let layout = f.material.program().layout().clone();
        let mut set = f.allocator.allocate(&mut f.dev, &layout).unwrap();
        let texture = f
            .uploader
            .upload_texture(&mut f.dev, &TextureData::solid([0, 0, 255, 255]))
            .unwrap();
        f.material.set_texture("albedo", &texture).unwrap();

        for _ in 0..3 {
            f.allocator
                .update(&mut f.dev, &mut set, &f.material, &f.transform, &f.view)
                .unwrap();
        }
        assert_eq!(set.texture_writes(), 1);

        f.allocator.release(&mut f.dev, set).unwrap();
        assert_eq!(f.allocator.live_sets(), 0);
        assert_eq!(f.dev.stats().live_binding_sets(), 0);
    }
}
