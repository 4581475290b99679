use std::collections::hash_map::Entry;
use std::collections::HashMap;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::types::{PipelineDesc, PipelineId, RenderTarget, TargetInfo};
use crate::renderer::contexts::device_ctx::GpuDevice;
use crate::renderer::contexts::resource_ctx::binding_allocator::{BindingSet, BindingSetAllocator};
use crate::renderer::error::configuration_error;
use crate::renderer::handle::DrawSiteKey;
use crate::renderer::resources::material::Material;
use crate::renderer::resources::mesh::Mesh;
use crate::renderer::resources::vertex::VertexBufferLayout;
use crate::renderer::util::{self, Fingerprint};

/// Identity of one cached pipeline: where it is drawn from, into what, with what.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineCacheKey(u64);

impl PipelineCacheKey {
    pub fn new(site: DrawSiteKey, target: RenderTarget, material: &Material, mesh: &Mesh) -> Self {
        let mut hasher = Fingerprint::new();
        hasher
            .write_u64(site.transform.to_bits())
            .write_u64(site.camera.to_bits())
            .write_u64(target.to_bits())
            .write_u64(material.id().0)
            .write_u64(mesh.id().0);
        Self(hasher.finish())
    }
}

/// Hash of the attachment formats a pipeline is compiled against.
pub fn target_fingerprint(info: &TargetInfo) -> u64 {
    let mut hasher = Fingerprint::new();
    hasher.write_u32(info.color_format as u32);
    hasher.write_u32(info.depth_format.map_or(u32::MAX, |f| f as u32));
    hasher.finish()
}

/// Everything `get_or_build` needs to know about one draw.
pub struct DrawRequest<'a> {
    pub site: DrawSiteKey,
    pub material: &'a Material,
    pub mesh: &'a Mesh,
    pub target: RenderTarget,
    pub target_info: &'a TargetInfo,
}

impl DrawRequest<'_> {
    pub fn key(&self) -> PipelineCacheKey {
        PipelineCacheKey::new(self.site, self.target, self.material, self.mesh)
    }
}

pub struct PipelineCacheEntry {
    key: PipelineCacheKey,
    pipeline: PipelineId,
    binding_set: BindingSet,
    material_fingerprint: u64,
    mesh_fingerprint: u64,
    target_fingerprint: u64,
    target: RenderTarget,
    frame_of_last_use: u32,
}

impl PipelineCacheEntry {
    pub fn key(&self) -> PipelineCacheKey {
        self.key
    }

    pub fn pipeline(&self) -> PipelineId {
        self.pipeline
    }

    pub fn binding_set(&self) -> &BindingSet {
        &self.binding_set
    }

    pub fn binding_set_mut(&mut self) -> &mut BindingSet {
        &mut self.binding_set
    }

    pub fn target(&self) -> RenderTarget {
        self.target
    }

    pub fn frame_of_last_use(&self) -> u32 {
        self.frame_of_last_use
    }

    fn is_current(&self, material: u64, mesh: u64, target: u64) -> bool {
        self.material_fingerprint == material && self.mesh_fingerprint == mesh && self.target_fingerprint == target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineCacheStats {
    pub builds: u64,
    pub rebuilds: u64,
    pub hits: u64,
    pub evictions: u64,
}

/// Responsibilities:
/// - Build pipelines and binding sets the first time a draw site needs them
/// - Rebuild only the pipeline when material, mesh or target shape changes
/// - Evict entries that went unused for `eviction_threshold` frames
pub struct PipelineCache {
    entries: HashMap<PipelineCacheKey, PipelineCacheEntry>,
    eviction_threshold: u32,
    stats: PipelineCacheStats,
}

impl PipelineCache {
    pub fn new(eviction_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            eviction_threshold,
            stats: PipelineCacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PipelineCacheStats {
        self.stats
    }

    pub fn eviction_threshold(&self) -> u32 {
        self.eviction_threshold
    }

    pub fn get(&self, key: PipelineCacheKey) -> Option<&PipelineCacheEntry> {
        self.entries.get(&key)
    }

    /// Returns the entry for `request`, building it on first use and rebuilding
    /// its pipeline when a fingerprint changed. Always stamps `frame` as the last use.
    pub fn get_or_build(
        &mut self,
        dev: &mut dyn GpuDevice,
        bindings: &mut BindingSetAllocator,
        request: &DrawRequest,
        frame: u32,
    ) -> Result<&mut PipelineCacheEntry> {
        let key = request.key();
        let material_fingerprint = request.material.state_fingerprint();
        let mesh_fingerprint = request.mesh.layout_fingerprint();
        let target_fingerprint = target_fingerprint(request.target_info);
        let cached = self.entries.len();

        let entry = match self.entries.entry(key) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if entry.is_current(material_fingerprint, mesh_fingerprint, target_fingerprint) {
                    self.stats.hits += 1;
                } else {
                    // The binding set keeps its buffers; only the pipeline is replaced
                    let pipeline = dev.create_pipeline(&pipeline_desc(request)?)?;
                    dev.destroy_pipeline(entry.pipeline)?;
                    entry.pipeline = pipeline;
                    entry.material_fingerprint = material_fingerprint;
                    entry.mesh_fingerprint = mesh_fingerprint;
                    entry.target_fingerprint = target_fingerprint;
                    self.stats.rebuilds += 1;
                    log::debug!("Rebuilt pipeline for `{}` ({:?})", request.material.name(), key);
                }
                entry
            }
            Entry::Vacant(vacant) => {
                let desc = pipeline_desc(request)?;
                let binding_set = bindings.allocate(dev, request.material.program().layout())?;
                let pipeline = match dev.create_pipeline(&desc) {
                    Ok(pipeline) => pipeline,
                    Err(e) => {
                        bindings.release(dev, binding_set)?;
                        return Err(e);
                    }
                };
                self.stats.builds += 1;
                log::debug!(
                    "Built pipeline for `{}` into {:?} ({} cached)",
                    request.material.name(),
                    request.target,
                    cached + 1
                );
                vacant.insert(PipelineCacheEntry {
                    key,
                    pipeline,
                    binding_set,
                    material_fingerprint,
                    mesh_fingerprint,
                    target_fingerprint,
                    target: request.target,
                    frame_of_last_use: frame,
                })
            }
        };
        entry.frame_of_last_use = frame;
        Ok(entry)
    }

    /// Drops every entry not used within the eviction threshold. Returns how many went.
    pub fn sweep(&mut self, dev: &mut dyn GpuDevice, bindings: &mut BindingSetAllocator, now: u32) -> Result<usize> {
        let threshold = self.eviction_threshold;
        self.evict_where(dev, bindings, |entry| util::is_stale(now, entry.frame_of_last_use, threshold))
    }

    /// Drops every entry built against `target`.
    pub fn invalidate_target(
        &mut self,
        dev: &mut dyn GpuDevice,
        bindings: &mut BindingSetAllocator,
        target: RenderTarget,
    ) -> Result<usize> {
        self.evict_where(dev, bindings, |entry| entry.target == target)
    }

    pub fn clear(&mut self, dev: &mut dyn GpuDevice, bindings: &mut BindingSetAllocator) -> Result<usize> {
        self.evict_where(dev, bindings, |_| true)
    }

    fn evict_where(
        &mut self,
        dev: &mut dyn GpuDevice,
        bindings: &mut BindingSetAllocator,
        predicate: impl Fn(&PipelineCacheEntry) -> bool,
    ) -> Result<usize> {
        let doomed: Vec<PipelineCacheKey> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.key)
            .collect();
        for key in &doomed {
            if let Some(entry) = self.entries.remove(key) {
                dev.destroy_pipeline(entry.pipeline)?;
                bindings.release(dev, entry.binding_set)?;
                self.stats.evictions += 1;
            }
        }
        if !doomed.is_empty() {
            log::debug!("Evicted {} pipeline cache entries, {} remain", doomed.len(), self.entries.len());
        }
        Ok(doomed.len())
    }
}

/// Describes the pipeline for `request`. Every vertex input of the program must
/// be fed by some mesh attribute; attributes the program ignores are left out.
fn pipeline_desc(request: &DrawRequest) -> Result<PipelineDesc> {
    let program = request.material.program();
    let layouts = request.mesh.layouts();
    for input in &program.layout().vertex_inputs {
        let provided = layouts.iter().any(|layout| layout.attribute(input.location).is_some());
        if !provided {
            return Err(configuration_error(
                "get_or_build",
                format!(
                    "material `{}` reads vertex input `{}` at location {}, which mesh {:?} does not provide",
                    request.material.name(),
                    input.name,
                    input.location,
                    request.mesh.id()
                ),
            ));
        }
    }

    let consumed = |location: u32| program.layout().vertex_inputs.iter().any(|i| i.location == location);
    let vertex_buffers = layouts
        .iter()
        .map(|layout| VertexBufferLayout {
            stride: layout.stride,
            attributes: layout
                .attributes
                .iter()
                .filter(|a| consumed(a.location))
                .copied()
                .collect(),
        })
        .collect();

    Ok(PipelineDesc {
        label: format!("{}/{:?}", request.material.name(), request.mesh.id()),
        program: program.clone(),
        binding_layout: program.layout().binding_layout(),
        vertex_buffers,
        topology: request.mesh.topology(),
        state: *request.material.state(),
        color_format: request.target_info.color_format,
        depth_format: request.target_info.depth_format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::renderer::contexts::device_ctx::soft::{SoftDevice, SoftDeviceDesc};
    use crate::renderer::contexts::device_ctx::types::{Extent2D, TargetId, TextureFormat};
    use crate::renderer::contexts::resource_ctx::uploader::Uploader;
    use crate::renderer::error::classify;
    use crate::renderer::handle::HandleAllocator;
    use crate::renderer::resources::builtin;
    use crate::renderer::resources::material::{BlendMode, MaterialId};
    use crate::renderer::resources::mesh::{MeshData, MeshId};

    struct Fixture {
        dev: SoftDevice,
        bindings: BindingSetAllocator,
        cache: PipelineCache,
        material: Material,
        mesh: Mesh,
        site: DrawSiteKey,
        info: TargetInfo,
    }

    const TARGET: RenderTarget = RenderTarget::Offscreen(TargetId(1000));

    fn fixture() -> Fixture {
        let mut dev = SoftDevice::new(SoftDeviceDesc::default());
        let uploader = Uploader::new(&mut dev).unwrap();
        let bindings = BindingSetAllocator::new(&mut dev, &uploader).unwrap();
        let mesh = uploader.upload_mesh(&mut dev, MeshId(1), &MeshData::new_quad()).unwrap();
        let material = Material::new(MaterialId(1), "unlit", Arc::new(builtin::unlit_color().unwrap()));
        let mut handles = HandleAllocator::new();
        Fixture {
            dev,
            bindings,
            cache: PipelineCache::new(100),
            material,
            mesh,
            site: DrawSiteKey::new(handles.allocate(), handles.allocate()),
            info: TargetInfo {
                extent: Extent2D::new(4, 4),
                color_format: TextureFormat::Rgba8Unorm,
                depth_format: Some(TextureFormat::Depth32Float),
                color_image: None,
            },
        }
    }

    impl Fixture {
        fn lookup(&mut self, frame: u32) -> Result<(PipelineId, Vec<crate::renderer::contexts::device_ctx::types::BufferId>)> {
            let request = DrawRequest {
                site: self.site,
                material: &self.material,
                mesh: &self.mesh,
                target: TARGET,
                target_info: &self.info,
            };
            let entry = self.cache.get_or_build(&mut self.dev, &mut self.bindings, &request, frame)?;
            Ok((entry.pipeline(), entry.binding_set().uniform_buffers()))
        }
    }

    #[test]
    fn unchanged_fingerprints_reuse_the_pipeline() {
        let mut f = fixture();
        let (first, _) = f.lookup(1).unwrap();
        let (second, _) = f.lookup(2).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.cache.stats().builds, 1);
        assert_eq!(f.cache.stats().hits, 1);
        assert_eq!(f.dev.stats().pipelines_created, 1);
    }

    #[test]
    fn state_change_rebuilds_pipeline_but_keeps_buffers() {
        let mut f = fixture();
        let (first, buffers) = f.lookup(1).unwrap();
        f.material.set_blend_mode(BlendMode::Alpha);
        let (second, rebuilt_buffers) = f.lookup(2).unwrap();
        assert_ne!(first, second);
        assert_eq!(buffers, rebuilt_buffers);
        assert_eq!(f.cache.stats().rebuilds, 1);
        assert_eq!(f.dev.stats().live_pipelines(), 1);
    }

    #[test]
    fn target_format_change_rebuilds() {
        let mut f = fixture();
        let (first, _) = f.lookup(1).unwrap();
        f.info.color_format = TextureFormat::Bgra8Unorm;
        let (second, _) = f.lookup(2).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn stale_entries_are_swept() {
        let mut f = fixture();
        f.lookup(1).unwrap();
        assert_eq!(f.cache.sweep(&mut f.dev, &mut f.bindings, 100).unwrap(), 0);
        assert_eq!(f.cache.sweep(&mut f.dev, &mut f.bindings, 101).unwrap(), 1);
        assert!(f.cache.is_empty());
        assert_eq!(f.dev.stats().live_pipelines(), 0);
        assert_eq!(f.dev.stats().live_binding_sets(), 0);
    }

    #[test]
    fn entries_touched_across_wraparound_survive() {
        let mut f = fixture();
        let mut frame = u32::MAX - 5;
        for _ in 0..12 {
            f.lookup(frame).unwrap();
            assert_eq!(f.cache.sweep(&mut f.dev, &mut f.bindings, frame).unwrap(), 0);
            frame = frame.wrapping_add(1);
        }
        assert_eq!(f.cache.len(), 1);
        assert_eq!(f.cache.stats().builds, 1);
    }

    #[test]
    fn invalidating_a_target_drops_its_entries() {
        let mut f = fixture();
        f.lookup(1).unwrap();
        assert_eq!(f.cache.invalidate_target(&mut f.dev, &mut f.bindings, RenderTarget::Surface).unwrap(), 0);
        assert_eq!(f.cache.invalidate_target(&mut f.dev, &mut f.bindings, TARGET).unwrap(), 1);
        assert!(f.cache.is_empty());
    }

    #[test]
    fn missing_vertex_input_is_a_configuration_error() {
        let mut f = fixture();
        let textured = Arc::new(builtin::unlit_textured().unwrap());
        f.material = Material::new(MaterialId(2), "textured", textured);
        // drop the texcoord attribute from the mesh
        let mut data = MeshData::new_quad();
        data.streams[0].layout.attributes.retain(|a| a.location == 0);
        let uploader = Uploader::new(&mut f.dev).unwrap();
        f.mesh = uploader.upload_mesh(&mut f.dev, MeshId(2), &data).unwrap();

        let err = f.lookup(1).unwrap_err();
        assert!(classify(&err).unwrap().is_configuration());
        assert_eq!(f.dev.stats().pipelines_created, 0);
        assert_eq!(f.bindings.live_sets(), 0);
    }

    #[test]
    fn rejected_pipeline_is_fatal_and_leaks_nothing() {
        let mut f = fixture();
        f.info.color_format = TextureFormat::Rgba16Float;
        let mut dev = SoftDevice::new(SoftDeviceDesc {
            format_support: crate::renderer::contexts::device_ctx::types::FormatSupport {
                color_attachment: vec![TextureFormat::Rgba8Unorm],
                ..crate::renderer::contexts::device_ctx::types::FormatSupport::all()
            },
            ..Default::default()
        });
        let uploader = Uploader::new(&mut dev).unwrap();
        let mut bindings = BindingSetAllocator::new(&mut dev, &uploader).unwrap();
        let mesh = uploader.upload_mesh(&mut dev, MeshId(3), &MeshData::new_quad()).unwrap();
        let request = DrawRequest {
            site: f.site,
            material: &f.material,
            mesh: &mesh,
            target: TARGET,
            target_info: &f.info,
        };
        let err = f.cache.get_or_build(&mut dev, &mut bindings, &request, 1).err().unwrap();
        assert!(classify(&err).unwrap().is_configuration());
        assert_eq!(bindings.live_sets(), 0);
        assert!(f.cache.is_empty());
    }
}
