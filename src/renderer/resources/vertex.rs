use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use crate::renderer::util::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Unorm8x4,
    Uint32,
}

impl VertexFormat {
    pub const ALL: [VertexFormat; 6] = [
        Self::Float32,
        Self::Float32x2,
        Self::Float32x3,
        Self::Float32x4,
        Self::Unorm8x4,
        Self::Uint32,
    ];

    pub fn size(&self) -> u32 {
        match self {
            Self::Float32 | Self::Unorm8x4 | Self::Uint32 => 4,
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
        }
    }

    pub fn component_count(&self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 => 1,
            Self::Float32x2 => 2,
            Self::Float32x3 => 3,
            Self::Float32x4 | Self::Unorm8x4 => 4,
        }
    }

    fn tag(&self) -> u32 {
        match self {
            Self::Float32 => 0,
            Self::Float32x2 => 1,
            Self::Float32x3 => 2,
            Self::Float32x4 => 3,
            Self::Unorm8x4 => 4,
            Self::Uint32 => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

impl PrimitiveTopology {
    fn tag(&self) -> u32 {
        match self {
            Self::TriangleList => 0,
            Self::TriangleStrip => 1,
            Self::LineList => 2,
            Self::PointList => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Layout of one vertex buffer: its stride and the attributes it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexBufferLayout {
    pub fn attribute(&self, location: u32) -> Option<&VertexAttribute> {
        self.attributes.iter().find(|a| a.location == location)
    }
}

/// Hashes exactly the vertex-side fields a pipeline is specialized for.
pub fn layout_fingerprint(layouts: &[VertexBufferLayout], topology: PrimitiveTopology) -> u64 {
    let mut hasher = Fingerprint::new();
    hasher.write_u32(topology.tag()).write_u32(layouts.len() as u32);
    for layout in layouts {
        hasher.write_u32(layout.stride).write_u32(layout.attributes.len() as u32);
        for attr in &layout.attributes {
            hasher
                .write_u32(attr.location)
                .write_u32(attr.format.tag())
                .write_u32(attr.offset);
        }
    }
    hasher.finish()
}

/// Standard interleaved vertex used by the mesh helpers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub texcoord: Vec2,
    pub color: Vec4,
}

impl Vertex {
    pub const POSITION_LOCATION: u32 = 0;
    pub const NORMAL_LOCATION: u32 = 1;
    pub const TEXCOORD_LOCATION: u32 = 2;
    pub const COLOR_LOCATION: u32 = 3;

    pub fn new(position: Vec3, texcoord: Vec2) -> Self {
        Self {
            position,
            normal: Vec3::Z,
            texcoord,
            color: Vec4::ONE,
        }
    }

    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            stride: std::mem::size_of::<Vertex>() as u32,
            attributes: vec![
                VertexAttribute {
                    location: Self::POSITION_LOCATION,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: Self::NORMAL_LOCATION,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
                VertexAttribute {
                    location: Self::TEXCOORD_LOCATION,
                    format: VertexFormat::Float32x2,
                    offset: 24,
                },
                VertexAttribute {
                    location: Self::COLOR_LOCATION,
                    format: VertexFormat::Float32x4,
                    offset: 32,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        let layout = Vertex::layout();
        assert_eq!(layout.stride, 48);
        let color = layout.attribute(Vertex::COLOR_LOCATION).unwrap();
        assert_eq!(color.offset + color.format.size(), layout.stride);
    }

    #[test]
    fn fingerprint_tracks_layout_and_topology() {
        let layout = vec![Vertex::layout()];
        let base = layout_fingerprint(&layout, PrimitiveTopology::TriangleList);
        assert_eq!(base, layout_fingerprint(&layout, PrimitiveTopology::TriangleList));
        assert_ne!(base, layout_fingerprint(&layout, PrimitiveTopology::LineList));

        let mut narrowed = layout.clone();
        narrowed[0].attributes[3].format = VertexFormat::Unorm8x4;
        assert_ne!(base, layout_fingerprint(&narrowed, PrimitiveTopology::TriangleList));
    }
}
