use std::sync::Arc;
use bitflags::bitflags;
use smallvec::SmallVec;
use crate::renderer::resources::material::PipelineState;
use crate::renderer::resources::shader::ShaderProgram;
use crate::renderer::resources::vertex::{PrimitiveTopology, VertexBufferLayout, VertexFormat};

macro_rules! device_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

device_id!(
    /// Opaque handle to a GPU buffer owned by the device.
    BufferId,
    /// Opaque handle to a GPU image owned by the device.
    ImageId,
    SamplerId,
    /// Compiled pipeline object.
    PipelineId,
    BindingSetId,
    CommandListId,
    /// GPU-side completion signal (binary semaphore semantics).
    SignalId,
    /// Offscreen attachment set created through the device.
    TargetId,
);

/// The attachment set a pass draws into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderTarget {
    Surface,
    Offscreen(TargetId),
}

impl RenderTarget {
    pub fn is_surface(&self) -> bool {
        matches!(self, Self::Surface)
    }

    pub(crate) fn to_bits(self) -> u64 {
        match self {
            Self::Surface => u64::MAX,
            Self::Offscreen(id) => id.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Device-local, filled through a staging copy.
    Vertex,
    /// Device-local, filled through a staging copy.
    Index,
    /// Host-visible, written directly every draw.
    Uniform,
    /// Host-visible transfer source.
    Staging,
    /// Host-readable transfer destination.
    Readback,
}

impl BufferKind {
    pub fn is_host_visible(&self) -> bool {
        matches!(self, Self::Uniform | Self::Staging | Self::Readback)
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub kind: BufferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Srgb | Self::Bgra8Unorm | Self::Bgra8Srgb => 4,
            Self::Rgba16Float => 8,
            Self::Depth32Float => 4,
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, Self::Rgba8Srgb | Self::Bgra8Srgb)
    }

    pub fn is_bgra(&self) -> bool {
        matches!(self, Self::Bgra8Unorm | Self::Bgra8Srgb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const TRANSFER_SRC = 1 << 1;
        const TRANSFER_DST = 1 << 2;
        const COLOR_ATTACHMENT = 1 << 3;
        const DEPTH_ATTACHMENT = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub label: &'a str,
    pub extent: Extent2D,
    pub format: TextureFormat,
    pub mip_levels: u32,
    pub usage: ImageUsage,
}

/// Access layout of an image (or of one of its mip levels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderRead,
    ColorAttachment,
    DepthAttachment,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirrorRepeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_mode: AddressMode,
}

#[derive(Debug, Clone)]
pub struct OffscreenTargetDesc<'a> {
    pub label: &'a str,
    pub extent: Extent2D,
    pub color_format: TextureFormat,
    pub depth_format: Option<TextureFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub extent: Extent2D,
    pub color_format: TextureFormat,
    pub depth_format: Option<TextureFormat>,
    /// Color attachment. For the surface this is the currently acquired image, if any.
    pub color_image: Option<ImageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer { size: u64 },
    SampledImage,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingLayoutEntry {
    pub binding: u32,
    pub kind: BindingKind,
}

/// Shape of a binding set: one entry per declared uniform block, texture and sampler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingLayoutDesc {
    pub entries: Vec<BindingLayoutEntry>,
}

impl BindingLayoutDesc {
    pub fn entry(&self, binding: u32) -> Option<&BindingLayoutEntry> {
        self.entries.iter().find(|e| e.binding == binding)
    }

    pub fn count(&self, kind: fn(&BindingKind) -> bool) -> u32 {
        self.entries.iter().filter(|e| kind(&e.kind)).count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    Buffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    Image(ImageId),
    Sampler(SamplerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingWrite {
    pub binding: u32,
    pub resource: BindingResource,
}

#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub label: String,
    pub program: Arc<ShaderProgram>,
    pub binding_layout: BindingLayoutDesc,
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub topology: PrimitiveTopology,
    pub state: PipelineState,
    pub color_format: TextureFormat,
    pub depth_format: Option<TextureFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Everything a command list can hold. Both backends consume the same stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        target: RenderTarget,
        clear_color: Option<[f32; 4]>,
        clear_depth: Option<f32>,
    },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindPipeline(PipelineId),
    BindBindingSet(BindingSetId),
    BindVertexBuffers {
        first_binding: u32,
        buffers: SmallVec<[BufferId; 4]>,
    },
    BindIndexBuffer {
        buffer: BufferId,
        format: IndexFormat,
    },
    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        size: u64,
    },
    /// Tightly packed texels into one mip level; the level must be in `TransferDst`.
    CopyBufferToImage {
        buffer: BufferId,
        image: ImageId,
        mip_level: u32,
    },
    /// Mip level 0 into a tightly packed buffer; the image must be in `TransferSrc`.
    CopyImageToBuffer {
        image: ImageId,
        buffer: BufferId,
    },
    /// Moves every level in the range from its current layout to `layout`.
    TransitionImage {
        image: ImageId,
        base_mip: u32,
        mip_count: u32,
        layout: ImageLayout,
    },
    /// Downsamples `src_level` (in `TransferSrc`) into `src_level + 1` (in `TransferDst`).
    BlitMip {
        image: ImageId,
        src_level: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Submission {
    /// `None` submits an empty batch, which still waits and signals.
    pub command_list: Option<CommandListId>,
    pub wait: Option<SignalId>,
    pub signal: Option<SignalId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_image_dimension: u32,
    pub max_vertex_buffers: u32,
    pub min_uniform_buffer_offset_alignment: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_image_dimension: 8192,
            max_vertex_buffers: 8,
            min_uniform_buffer_offset_alignment: 256,
        }
    }
}

/// Formats the device can use for each purpose. Queried once when the device is created.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormatSupport {
    pub color_attachment: Vec<TextureFormat>,
    pub depth_attachment: Vec<TextureFormat>,
    pub sampled: Vec<TextureFormat>,
    pub vertex: Vec<VertexFormat>,
}

impl FormatSupport {
    pub fn all() -> Self {
        let color = vec![
            TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8Srgb,
            TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8Srgb,
            TextureFormat::Rgba16Float,
        ];
        Self {
            color_attachment: color.clone(),
            depth_attachment: vec![TextureFormat::Depth32Float],
            sampled: color,
            vertex: VertexFormat::ALL.to_vec(),
        }
    }

    pub fn supports_color_attachment(&self, format: TextureFormat) -> bool {
        self.color_attachment.contains(&format)
    }

    pub fn supports_depth_attachment(&self, format: TextureFormat) -> bool {
        self.depth_attachment.contains(&format)
    }

    pub fn supports_sampled(&self, format: TextureFormat) -> bool {
        self.sampled.contains(&format)
    }

    pub fn supports_vertex(&self, format: VertexFormat) -> bool {
        self.vertex.contains(&format)
    }
}

/// Running counters kept by every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub pipelines_created: u64,
    pub pipelines_destroyed: u64,
    pub binding_sets_created: u64,
    pub binding_sets_destroyed: u64,
    pub submissions: u64,
    pub presents: u64,
    pub live_buffers: u64,
    pub live_images: u64,
}

impl DeviceStats {
    pub fn live_pipelines(&self) -> u64 {
        self.pipelines_created - self.pipelines_destroyed
    }

    pub fn live_binding_sets(&self) -> u64 {
        self.binding_sets_created - self.binding_sets_destroyed
    }
}
