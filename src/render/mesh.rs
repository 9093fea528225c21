//! CPU-side chunk meshes decoded from mesher readbacks

use bytemuck::{Pod, Zeroable};

use crate::math::Aabb;
use crate::voxel::chunk::{CHUNK_SIZE_XZ, CHUNK_SIZE_Y, INDICES_PER_QUAD, VERTICES_PER_QUAD};

/// Scalars per vertex in the mesher's output stream
pub const VERTEX_STRIDE_FLOATS: usize = 16;

/// Bytes per vertex in the mesher's output stream
pub const VERTEX_STRIDE_BYTES: usize = VERTEX_STRIDE_FLOATS * std::mem::size_of::<f32>();

/// One mesher output vertex. Field order matches the compute shader exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PackedVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    /// Repeats across merged quads (0..width, 0..height)
    pub uv: [f32; 2],
    pub ao: f32,
    pub shadow: f32,
    pub tangent: [f32; 4],
    /// Atlas tile column and row
    pub tile: [f32; 2],
}

const _: () = assert!(std::mem::size_of::<PackedVertex>() == VERTEX_STRIDE_BYTES);

/// Clamp reported counts to capacity, then truncate to whole quads.
pub fn clamp_to_quads(vertices: u32, indices: u32, max_vertices: u32, max_indices: u32) -> (u32, u32) {
    let v = vertices.min(max_vertices);
    let i = indices.min(max_indices);
    let quads = (v / VERTICES_PER_QUAD).min(i / INDICES_PER_QUAD);
    (quads * VERTICES_PER_QUAD, quads * INDICES_PER_QUAD)
}

/// A finished chunk mesh in chunk-local space
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkMesh {
    pub vertices: Vec<PackedVertex>,
    pub indices: Vec<u32>,
    /// Whole-chunk box; never recomputed from the vertices
    pub bounds: Aabb,
}

impl ChunkMesh {
    /// Conservative local bounds of one chunk
    pub fn chunk_bounds() -> Aabb {
        Aabb::from_origin_size(
            glam::Vec3::ZERO,
            glam::Vec3::new(CHUNK_SIZE_XZ as f32, CHUNK_SIZE_Y as f32, CHUNK_SIZE_XZ as f32),
        )
    }

    pub fn empty() -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            bounds: Self::chunk_bounds(),
        }
    }

    /// Decode raw vertex and index readbacks. Trailing partial records are
    /// ignored.
    pub fn from_readback(vertex_bytes: &[u8], index_bytes: &[u8]) -> Self {
        let vertices = vertex_bytes
            .chunks_exact(VERTEX_STRIDE_BYTES)
            .map(bytemuck::pod_read_unaligned::<PackedVertex>)
            .collect();
        let indices = index_bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self {
            vertices,
            indices,
            bounds: Self::chunk_bounds(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn quad_count(&self) -> usize {
        self.indices.len() / INDICES_PER_QUAD as usize
    }

    /// Vertex buffer layout matching `PackedVertex`
    pub fn vertex_layout() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 7] = wgpu::vertex_attr_array![
            0 => Float32x3, // position
            1 => Float32x3, // normal
            2 => Float32x2, // uv
            3 => Float32,   // ao
            4 => Float32,   // shadow
            5 => Float32x4, // tangent
            6 => Float32x2, // tile
        ];
        wgpu::VertexBufferLayout {
            array_stride: VERTEX_STRIDE_BYTES as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_stride() {
        assert_eq!(std::mem::size_of::<PackedVertex>(), 64);
        assert_eq!(ChunkMesh::vertex_layout().array_stride, 64);
    }

    #[test]
    fn test_clamp_to_whole_quads() {
        assert_eq!(clamp_to_quads(10, 17, 1000, 1000), (8, 12));
        assert_eq!(clamp_to_quads(3, 5, 1000, 1000), (0, 0));
        assert_eq!(clamp_to_quads(400, 600, 1000, 1000), (400, 600));
        // Capacity clamp applies before quad truncation
        assert_eq!(clamp_to_quads(5000, 5000, 42, 60), (40, 60));
    }

    #[test]
    fn test_from_readback_layout() {
        let vertex = PackedVertex {
            position: [1.0, 2.0, 3.0],
            normal: [0.0, 1.0, 0.0],
            uv: [4.0, 2.0],
            ao: 0.75,
            shadow: 1.0,
            tangent: [1.0, 0.0, 0.0, 1.0],
            tile: [3.0, 0.0],
        };
        let mut vertex_bytes = Vec::new();
        for _ in 0..4 {
            vertex_bytes.extend_from_slice(bytemuck::bytes_of(&vertex));
        }
        // Unaligned start must still decode
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&vertex_bytes);

        let index_bytes: Vec<u8> = [0u32, 1, 2, 0, 2, 3]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect();

        let mesh = ChunkMesh::from_readback(&shifted[1..], &index_bytes);
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.vertices[2], vertex);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.quad_count(), 1);
        assert_eq!(mesh.bounds, ChunkMesh::chunk_bounds());
    }

    #[test]
    fn test_empty_mesh_keeps_chunk_bounds() {
        let mesh = ChunkMesh::empty();
        assert!(mesh.is_empty());
        assert_eq!(mesh.bounds.max, glam::Vec3::new(32.0, 128.0, 32.0));
    }
}
