pub mod soft;
pub mod types;
pub mod vulkan;

use std::sync::Arc;
use color_eyre::Result;
use winit::window::Window;
use crate::renderer::config::{BackendKind, RenderConfig};
use crate::renderer::contexts::device_ctx::soft::SoftDevice;
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::vulkan::VulkanDevice;
use crate::renderer::error::configuration_error;

/// The one seam between the renderer core and a graphics API.
///
/// Every resource is referred to by an opaque id the device hands out. All
/// calls happen on the thread driving the frame; nothing here is shared.
pub trait GpuDevice {
    fn backend(&self) -> BackendKind;
    fn name(&self) -> &str;
    fn limits(&self) -> &DeviceLimits;
    fn format_support(&self) -> &FormatSupport;
    fn stats(&self) -> DeviceStats;

    /// True if the device presents to a surface.
    fn has_surface(&self) -> bool;
    /// The surface is rebuilt at the next acquire.
    fn request_surface_resize(&mut self);

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId>;
    /// Host-visible buffers only.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    /// Host-visible buffers only.
    fn read_buffer(&mut self, buffer: BufferId, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<()>;

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId>;
    fn destroy_image(&mut self, image: ImageId) -> Result<()>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId>;
    fn destroy_sampler(&mut self, sampler: SamplerId) -> Result<()>;

    fn create_offscreen_target(&mut self, desc: &OffscreenTargetDesc) -> Result<TargetId>;
    fn destroy_offscreen_target(&mut self, target: TargetId) -> Result<()>;
    fn target_info(&self, target: RenderTarget) -> Result<TargetInfo>;

    /// Fails with a configuration error if a format in `desc` is unsupported.
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId) -> Result<()>;

    fn create_binding_set(&mut self, layout: &BindingLayoutDesc) -> Result<BindingSetId>;
    fn write_binding_set(&mut self, set: BindingSetId, writes: &[BindingWrite]) -> Result<()>;
    fn destroy_binding_set(&mut self, set: BindingSetId) -> Result<()>;

    fn create_command_list(&mut self, queue: QueueKind) -> Result<CommandListId>;
    /// Resets the list and starts recording.
    fn begin_commands(&mut self, list: CommandListId) -> Result<()>;
    fn record(&mut self, list: CommandListId, command: &Command) -> Result<()>;
    fn end_commands(&mut self, list: CommandListId) -> Result<()>;
    fn destroy_command_list(&mut self, list: CommandListId) -> Result<()>;

    fn create_signal(&mut self) -> Result<SignalId>;
    fn destroy_signal(&mut self, signal: SignalId) -> Result<()>;
    /// Waiting consumes the wait signal; the signal is raised once the batch completes.
    fn submit(&mut self, submission: &Submission) -> Result<()>;
    /// Blocks until every queue is idle.
    fn wait_idle(&mut self) -> Result<()>;

    /// Blocks until a presentation image is available, raising `signal` when it is.
    fn acquire_next_image(&mut self, signal: SignalId) -> Result<u32>;
    fn present(&mut self, image_index: u32, wait: Option<SignalId>) -> Result<()>;
}

/// Rejects a pipeline whose attachment or vertex formats the device cannot use.
pub(crate) fn validate_pipeline_formats(support: &FormatSupport, desc: &PipelineDesc) -> Result<()> {
    const OP: &str = "create_pipeline";
    if !support.supports_color_attachment(desc.color_format) {
        return Err(configuration_error(
            OP,
            format!("`{}`: {:?} is not a supported color attachment", desc.label, desc.color_format),
        ));
    }
    if let Some(depth) = desc.depth_format {
        if !support.supports_depth_attachment(depth) {
            return Err(configuration_error(
                OP,
                format!("`{}`: {depth:?} is not a supported depth attachment", desc.label),
            ));
        }
    }
    let unsupported = desc
        .vertex_buffers
        .iter()
        .flat_map(|layout| &layout.attributes)
        .find(|attribute| !support.supports_vertex(attribute.format));
    if let Some(attribute) = unsupported {
        return Err(configuration_error(
            OP,
            format!(
                "`{}`: vertex format {:?} at location {} is not supported",
                desc.label, attribute.format, attribute.location
            ),
        ));
    }
    Ok(())
}

/// Builds the backend named in `config`. This is the only place a backend is chosen.
pub fn create_device(
    config: &RenderConfig,
    window: Option<Arc<Window>>,
) -> Result<Box<dyn GpuDevice>> {
    let device: Box<dyn GpuDevice> = match config.backend {
        BackendKind::Vulkan => Box::new(VulkanDevice::new(config, window)?),
        BackendKind::Soft => Box::new(SoftDevice::from_config(config)),
    };
    log::info!("Using {:?} device `{}`", device.backend(), device.name());
    Ok(device)
}
