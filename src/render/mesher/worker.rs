//! Mesh worker interface and greedy stage table

use glam::Vec3;

use crate::voxel::chunk::{ChunkCoord, CHUNK_SIZE_XZ, CHUNK_SIZE_Y, MAX_INDICES_PER_CHUNK, MAX_VERTICES_PER_CHUNK};

use super::readback::ReadbackHandle;

/// Greedy stages run per chunk
pub const GREEDY_STAGE_COUNT: u8 = 6;

/// One greedy-merge dispatch. Stages run in declaration order; `PosY` also
/// builds the candidate face mask the other stages consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GreedyStage {
    PosY = 0,
    NegY = 1,
    PosX = 2,
    NegX = 3,
    PosZ = 4,
    NegZ = 5,
}

impl GreedyStage {
    pub const ALL: [GreedyStage; 6] = [
        GreedyStage::PosY,
        GreedyStage::NegY,
        GreedyStage::PosX,
        GreedyStage::NegX,
        GreedyStage::PosZ,
        GreedyStage::NegZ,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Compute shader entry point
    pub fn entry_point(self) -> &'static str {
        match self {
            GreedyStage::PosY => "greedy_pos_y",
            GreedyStage::NegY => "greedy_neg_y",
            GreedyStage::PosX => "greedy_pos_x",
            GreedyStage::NegX => "greedy_neg_x",
            GreedyStage::PosZ => "greedy_pos_z",
            GreedyStage::NegZ => "greedy_neg_z",
        }
    }

    /// Workgroups: one per 2D slice along the stage's axis
    pub fn workgroups(self) -> u32 {
        match self {
            GreedyStage::PosY | GreedyStage::NegY => CHUNK_SIZE_Y,
            _ => CHUNK_SIZE_XZ,
        }
    }
}

/// Per-chunk shading parameters bound by `prepare_for_chunk`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshParams {
    pub sun_direction: Vec3,
    pub shadow_steps: u32,
    pub shadow_step_length: f32,
    pub atlas_tiles_per_row: u32,
}

impl Default for MeshParams {
    fn default() -> Self {
        Self {
            sun_direction: Vec3::Y,
            shadow_steps: 0,
            shadow_step_length: 0.75,
            atlas_tiles_per_row: 16,
        }
    }
}

/// One reusable set of mesher buffers, able to mesh one chunk at a time.
pub trait MeshWorker {
    /// Copy a chunk's voxel volume into the input buffer
    fn upload(&mut self, voxels: &[u8]);

    /// Bind per-chunk uniforms and zero the output counters
    fn prepare_for_chunk(&mut self, coord: ChunkCoord, params: &MeshParams);

    /// Issue exactly one dispatch for `stage`
    fn dispatch_greedy_stage(&mut self, stage: GreedyStage);

    /// Read back (vertex count, index count)
    fn request_counters(&mut self) -> ReadbackHandle;

    /// Read back exactly `vertex_count` vertices and `index_count` indices
    fn request_mesh_data(&mut self, vertex_count: u32, index_count: u32) -> (ReadbackHandle, ReadbackHandle);

    /// Replace the block face tile table
    fn set_face_textures(&mut self, table: &[u32]);

    /// Replace the per-block flag table (`BLOCK_FLAG_*` bits per id)
    fn set_block_flags(&mut self, flags: &[u32]);

    /// Output capacity as (vertices, indices)
    fn capacity(&self) -> (u32, u32) {
        (MAX_VERTICES_PER_CHUNK, MAX_INDICES_PER_CHUNK)
    }

    /// Drive pending GPU callbacks; called once per tick
    fn maintain(&mut self) {}
}

/// Decode a counters readback into (vertices, indices)
pub fn decode_counters(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 8 {
        return None;
    }
    let vertices = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let indices = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Some((vertices, indices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        for (i, stage) in GreedyStage::ALL.iter().enumerate() {
            assert_eq!(stage.index() as usize, i);
            assert_eq!(GreedyStage::from_index(i as u8), Some(*stage));
        }
        assert_eq!(GreedyStage::from_index(GREEDY_STAGE_COUNT), None);
        assert_eq!(GreedyStage::PosY.entry_point(), "greedy_pos_y");
    }

    #[test]
    fn test_workgroups_follow_slices() {
        assert_eq!(GreedyStage::PosY.workgroups(), 128);
        assert_eq!(GreedyStage::NegX.workgroups(), 32);
        assert_eq!(GreedyStage::PosZ.workgroups(), 32);
    }

    #[test]
    fn test_decode_counters() {
        let mut bytes = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&17u32.to_le_bytes());
        assert_eq!(decode_counters(&bytes), Some((10, 17)));
        assert_eq!(decode_counters(&bytes[..4]), None);
    }
}
