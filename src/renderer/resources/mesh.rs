use glam::{Vec2, Vec3, Vec4};
use crate::renderer::contexts::device_ctx::types::{BufferId, IndexFormat};
use crate::renderer::resources::vertex::{self, PrimitiveTopology, Vertex, VertexBufferLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// CPU-side bytes for one vertex buffer.
#[derive(Debug, Clone)]
pub struct VertexStream {
    pub layout: VertexBufferLayout,
    pub data: Vec<u8>,
}

/// Mesh contents before upload. An empty `parts` list means non-indexed drawing.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub streams: Vec<VertexStream>,
    pub vertex_count: u32,
    pub parts: Vec<Vec<u32>>,
    pub topology: PrimitiveTopology,
}

impl MeshData {
    pub fn from_vertices(vertices: &[Vertex], parts: Vec<Vec<u32>>) -> Self {
        Self {
            streams: vec![VertexStream {
                layout: Vertex::layout(),
                data: bytemuck::cast_slice(vertices).to_vec(),
            }],
            vertex_count: vertices.len() as u32,
            parts,
            topology: PrimitiveTopology::TriangleList,
        }
    }

    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn new_triangle() -> Self {
        let vertices = [
            colored(Vec3::new(-0.5, -0.5, 0.0), Vec2::new(0.0, 1.0), Vec4::new(1.0, 0.0, 0.0, 1.0)),
            colored(Vec3::new(0.5, -0.5, 0.0), Vec2::new(1.0, 1.0), Vec4::new(0.0, 1.0, 0.0, 1.0)),
            colored(Vec3::new(0.0, 0.5, 0.0), Vec2::new(0.5, 0.0), Vec4::new(0.0, 0.0, 1.0, 1.0)),
        ];
        Self::from_vertices(&vertices, vec![vec![0, 1, 2]])
    }

    /// Indexed quad spanning [-1, 1] on X and Y.
    pub fn new_quad() -> Self {
        let vertices = [
            Vertex::new(Vec3::new(-1.0, 1.0, 0.0), Vec2::new(0.0, 0.0)), // Top left
            Vertex::new(Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, 1.0)), // Bottom left
            Vertex::new(Vec3::new(1.0, 1.0, 0.0), Vec2::new(1.0, 0.0)), // Top right
            Vertex::new(Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, 1.0)), // Bottom right
        ];

        // Counter-clockwise winding order
        let indices = vec![
            0, 1, 2, // Top left triangle
            2, 1, 3, // Bottom right triangle
        ];

        Self::from_vertices(&vertices, vec![indices])
    }

    /// Same quad as `new_quad`, as six unindexed vertices.
    pub fn new_unindexed_quad() -> Self {
        let quad = [
            Vertex::new(Vec3::new(-1.0, 1.0, 0.0), Vec2::new(0.0, 0.0)),
            Vertex::new(Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, 1.0)),
            Vertex::new(Vec3::new(1.0, 1.0, 0.0), Vec2::new(1.0, 0.0)),
            Vertex::new(Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, 1.0)),
        ];
        let vertices = [quad[0], quad[1], quad[2], quad[2], quad[1], quad[3]];
        Self::from_vertices(&vertices, Vec::new())
    }
}

fn colored(position: Vec3, texcoord: Vec2, color: Vec4) -> Vertex {
    Vertex {
        color,
        ..Vertex::new(position, texcoord)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshPart {
    pub index_buffer: BufferId,
    pub index_count: u32,
    pub index_format: IndexFormat,
}

/// A mesh resident on the device.
#[derive(Debug, Clone)]
pub struct Mesh {
    id: MeshId,
    vertex_buffers: Vec<BufferId>,
    layouts: Vec<VertexBufferLayout>,
    vertex_count: u32,
    parts: Vec<MeshPart>,
    topology: PrimitiveTopology,
}

impl Mesh {
    pub(crate) fn new(
        id: MeshId,
        vertex_buffers: Vec<BufferId>,
        layouts: Vec<VertexBufferLayout>,
        vertex_count: u32,
        parts: Vec<MeshPart>,
        topology: PrimitiveTopology,
    ) -> Self {
        Self {
            id,
            vertex_buffers,
            layouts,
            vertex_count,
            parts,
            topology,
        }
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn vertex_buffers(&self) -> &[BufferId] {
        &self.vertex_buffers
    }

    pub fn layouts(&self) -> &[VertexBufferLayout] {
        &self.layouts
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn parts(&self) -> &[MeshPart] {
        &self.parts
    }

    pub fn part(&self, index: usize) -> Option<&MeshPart> {
        self.parts.get(index)
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.topology
    }

    pub fn set_topology(&mut self, topology: PrimitiveTopology) {
        self.topology = topology;
    }

    /// Hash of the vertex layouts and topology; buffer contents are not included.
    pub fn layout_fingerprint(&self) -> u64 {
        vertex::layout_fingerprint(&self.layouts, self.topology)
    }

    pub(crate) fn into_buffers(self) -> impl Iterator<Item = BufferId> {
        self.vertex_buffers
            .into_iter()
            .chain(self.parts.into_iter().map(|p| p.index_buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_data_is_interleaved() {
        let quad = MeshData::new_quad();
        assert_eq!(quad.vertex_count, 4);
        assert_eq!(quad.streams[0].data.len(), 4 * 48);
        assert_eq!(quad.parts, vec![vec![0, 1, 2, 2, 1, 3]]);

        let flat = MeshData::new_unindexed_quad();
        assert_eq!(flat.vertex_count, 6);
        assert!(flat.parts.is_empty());
    }

    #[test]
    fn topology_changes_the_fingerprint() {
        let mut mesh = Mesh::new(
            MeshId(1),
            vec![BufferId(1)],
            vec![Vertex::layout()],
            3,
            Vec::new(),
            PrimitiveTopology::TriangleList,
        );
        let before = mesh.layout_fingerprint();
        mesh.set_topology(PrimitiveTopology::LineList);
        assert_ne!(before, mesh.layout_fingerprint());
    }
}
