pub mod binding_allocator;
pub mod uploader;

use color_eyre::Result;
use crate::renderer::contexts::device_ctx::GpuDevice;
use crate::renderer::contexts::resource_ctx::binding_allocator::BindingSetAllocator;
use crate::renderer::contexts::resource_ctx::uploader::Uploader;

/// Responsibilities:
/// - Upload buffers, images and meshes with blocking submits
/// - Allocate and update binding sets for cached pipelines
/// - Own the fallback texture unset texture slots are bound to
pub struct RenderResourceContext {
    pub uploader: Uploader,
    pub bindings: BindingSetAllocator,
}

impl RenderResourceContext {
    pub fn new(dev: &mut dyn GpuDevice) -> Result<Self> {
        let uploader = Uploader::new(dev)?;
        let bindings = BindingSetAllocator::new(dev, &uploader)?;
        Ok(Self { uploader, bindings })
    }

    pub fn destroy(&mut self, dev: &mut dyn GpuDevice) -> Result<()> {
        self.bindings.destroy(dev, &self.uploader)?;
        self.uploader.destroy(dev)
    }
}
