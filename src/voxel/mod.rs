//! Voxel data structures: chunk definitions, lifecycle state and block types

pub mod block;
pub mod chunk;

pub use block::{BlockDefinition, BlockFace, BlockFaceTextures, BlockId, BlockRegistry};
pub use chunk::{
    Chunk, ChunkCoord, ChunkState, CHUNK_SIZE_XZ, CHUNK_SIZE_Y, MAX_INDICES_PER_CHUNK,
    MAX_VERTICES_PER_CHUNK, VOXELS_PER_CHUNK,
};
