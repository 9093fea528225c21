//! Chunk definitions, lifecycle state machine and per-chunk pipeline bookkeeping

use std::time::Instant;

use glam::{IVec2, Vec3};
use serde::Serialize;

use crate::generation::{GenerationPool, GenerationTask};
use crate::render::mesh::ChunkMesh;

/// Chunk width and length in voxels
pub const CHUNK_SIZE_XZ: u32 = 32;

/// Chunk height in voxels
pub const CHUNK_SIZE_Y: u32 = 128;

/// Voxels in one chunk (one block-type byte each)
pub const VOXELS_PER_CHUNK: usize = (CHUNK_SIZE_XZ * CHUNK_SIZE_XZ * CHUNK_SIZE_Y) as usize;

pub const VERTICES_PER_QUAD: u32 = 4;
pub const INDICES_PER_QUAD: u32 = 6;

/// Worst-case visible faces of one chunk: a 3D checkerboard exposes all six
/// faces of every other voxel and none of them can merge.
pub const MAX_QUADS_PER_CHUNK: u32 = (VOXELS_PER_CHUNK as u32 / 2) * 6;

/// Vertex capacity of one worker's output stream
pub const MAX_VERTICES_PER_CHUNK: u32 = MAX_QUADS_PER_CHUNK * VERTICES_PER_QUAD;

/// Index capacity of one worker's output stream
pub const MAX_INDICES_PER_CHUNK: u32 = MAX_QUADS_PER_CHUNK * INDICES_PER_QUAD;

/// Linear index of a voxel inside a chunk volume (x fastest, then z, then y)
#[inline]
pub fn voxel_index(x: u32, y: u32, z: u32) -> usize {
    (x + z * CHUNK_SIZE_XZ + y * CHUNK_SIZE_XZ * CHUNK_SIZE_XZ) as usize
}

/// Integer coordinate identifying a chunk in the world grid.
///
/// Streaming is horizontal-only, so `y` stays 0 for every streamed chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    /// Create a new chunk coordinate
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Horizontal chunk coordinate containing a world position
    pub fn from_world_pos(pos: Vec3) -> Self {
        Self {
            x: (pos.x / CHUNK_SIZE_XZ as f32).floor() as i32,
            y: 0,
            z: (pos.z / CHUNK_SIZE_XZ as f32).floor() as i32,
        }
    }

    /// Chunk at `offset` (dx, dz) from this one
    pub fn offset(&self, offset: IVec2) -> Self {
        Self::new(self.x + offset.x, 0, self.z + offset.y)
    }

    /// Horizontal offset (dx, dz) of this chunk relative to `center`
    pub fn offset_from(&self, center: ChunkCoord) -> IVec2 {
        IVec2::new(self.x - center.x, self.z - center.z)
    }

    /// Horizontal Chebyshev distance in chunks
    pub fn chebyshev_distance(&self, other: ChunkCoord) -> u32 {
        let d = self.offset_from(other).abs();
        d.x.max(d.y) as u32
    }

    /// World-space origin (minimum corner) of this chunk
    pub fn world_origin(&self) -> Vec3 {
        Vec3::new(
            self.x as f32 * CHUNK_SIZE_XZ as f32,
            self.y as f32 * CHUNK_SIZE_Y as f32,
            self.z as f32 * CHUNK_SIZE_XZ as f32,
        )
    }
}

/// Lifecycle state of a streamed chunk.
///
/// Disposal is not a state: a chunk leaves the store when it is disposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ChunkState {
    /// Created, generation not yet scheduled
    Requested,
    /// Background generation task owns the voxel volume
    Generating,
    /// Voxels complete, waiting in the ready queue for a free worker
    ReadyForMesh,
    /// Bound to a worker: receiving greedy stages or waiting on counters
    MeshingGpu,
    /// Counters known, vertex/index readback in flight
    Uploading,
    /// Mesh attached, drawable
    Active,
}

impl ChunkState {
    pub const ALL: [ChunkState; 6] = [
        ChunkState::Requested,
        ChunkState::Generating,
        ChunkState::ReadyForMesh,
        ChunkState::MeshingGpu,
        ChunkState::Uploading,
        ChunkState::Active,
    ];

    /// Transition table of the pipeline.
    pub fn can_transition_to(self, next: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, next),
            (Requested, Generating)
                | (Generating, ReadyForMesh)
                | (ReadyForMesh, MeshingGpu)
                | (MeshingGpu, Uploading)
                // empty mesh or retries exhausted on the counters phase
                | (MeshingGpu, Active)
                | (Uploading, Active)
        )
    }

    /// True while a worker's buffers hold this chunk's data
    pub fn is_in_flight(self) -> bool {
        matches!(self, ChunkState::MeshingGpu | ChunkState::Uploading)
    }
}

/// A streamed chunk: voxel volume, lifecycle state and GPU pipeline progress.
pub struct Chunk {
    /// Coordinate of this chunk in the world grid
    pub coord: ChunkCoord,
    state: ChunkState,
    /// Allocated once; lent to the generation task while it runs
    voxels: Option<Box<[u8]>>,
    generation: Option<GenerationTask>,
    mesh: Option<ChunkMesh>,
    /// Greedy stages dispatched so far (0..=6)
    pub gpu_stage: u8,
    /// Retries spent on the current readback phase
    pub retry_count: u32,
    /// When the counters readback was (re)issued
    pub gpu_start: Option<Instant>,
    /// When the vertex/index readback was (re)issued
    pub upload_start: Option<Instant>,
    /// Last requested vertex count for readback
    pub pending_vertex_count: u32,
    /// Last requested index count for readback
    pub pending_index_count: u32,
    /// Whether vertex/index readback has been requested
    pub mesh_data_requested: bool,
    /// Out of range while in flight; disposed once its readback resolves
    pub pending_removal: bool,
    /// Generation ended without returning the volume
    generation_failed: bool,
    /// Identifies the attached mesh; a reloaded chunk gets a new one
    mesh_revision: u64,
}

impl Chunk {
    /// Create a chunk in the `Requested` state with a zeroed voxel volume
    pub fn new(coord: ChunkCoord) -> Self {
        Self {
            coord,
            state: ChunkState::Requested,
            voxels: Some(vec![0u8; VOXELS_PER_CHUNK].into_boxed_slice()),
            generation: None,
            mesh: None,
            gpu_stage: 0,
            retry_count: 0,
            gpu_start: None,
            upload_start: None,
            pending_vertex_count: 0,
            pending_index_count: 0,
            mesh_data_requested: false,
            pending_removal: false,
            generation_failed: false,
            mesh_revision: 0,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Move to `next` if the transition table allows it.
    pub fn transition(&mut self, next: ChunkState) -> bool {
        if !self.state.can_transition_to(next) {
            log::error!(
                "Chunk {:?}: rejected transition {:?} -> {:?}",
                self.coord, self.state, next
            );
            return false;
        }
        log::trace!("Chunk {:?}: {:?} -> {:?}", self.coord, self.state, next);
        self.state = next;
        true
    }

    /// Hand the voxel volume to a background generation task.
    pub fn begin_generation(&mut self, pool: &GenerationPool) -> bool {
        let Some(voxels) = self.voxels.take() else {
            log::error!("Chunk {:?}: voxel volume missing at generation", self.coord);
            return false;
        };
        if !self.transition(ChunkState::Generating) {
            self.voxels = Some(voxels);
            return false;
        }
        self.generation = Some(pool.schedule(self.coord, voxels));
        true
    }

    /// Non-blocking check of the generation task; on completion the volume
    /// returns to the chunk and the chunk becomes `ReadyForMesh`.
    pub fn poll_generation(&mut self) -> bool {
        if self.state != ChunkState::Generating {
            return false;
        }
        let finished = match self.generation.as_mut() {
            Some(task) => task.is_complete(),
            None => false,
        };
        if !finished {
            return false;
        }
        let Some(task) = self.generation.take() else {
            return false;
        };
        match task.complete() {
            Ok(voxels) => {
                self.voxels = Some(voxels);
                self.transition(ChunkState::ReadyForMesh)
            }
            Err(e) => {
                log::error!("Chunk {:?}: generation failed: {}", self.coord, e);
                self.generation_failed = true;
                false
            }
        }
    }

    /// The generation task finished without a volume. The chunk can never
    /// leave `Generating` and has to be recreated.
    pub fn generation_failed(&self) -> bool {
        self.generation_failed
    }

    /// Voxel volume, available outside of generation
    pub fn voxels(&self) -> Option<&[u8]> {
        self.voxels.as_deref()
    }

    pub fn mesh(&self) -> Option<&ChunkMesh> {
        self.mesh.as_ref()
    }

    pub fn mesh_revision(&self) -> u64 {
        self.mesh_revision
    }

    /// Attach the finished mesh under `revision` and mark the chunk drawable.
    pub fn activate(&mut self, mesh: ChunkMesh, revision: u64) -> bool {
        if !self.transition(ChunkState::Active) {
            return false;
        }
        self.mesh = Some(mesh);
        self.mesh_revision = revision;
        self.mesh_data_requested = false;
        self.gpu_start = None;
        self.upload_start = None;
        true
    }

    /// Bookkeeping reset when the chunk is bound to a worker
    pub fn begin_staging(&mut self) -> bool {
        if !self.transition(ChunkState::MeshingGpu) {
            return false;
        }
        self.gpu_stage = 0;
        self.retry_count = 0;
        self.mesh_data_requested = false;
        self.pending_vertex_count = 0;
        self.pending_index_count = 0;
        true
    }

    /// Release the chunk. A still-running generation task is awaited first so
    /// the volume is never dropped out from under it.
    pub fn dispose(mut self) {
        if let Some(task) = self.generation.take() {
            if let Err(e) = task.complete() {
                log::warn!("Chunk {:?}: generation failed during disposal: {}", self.coord, e);
            }
        }
        log::trace!("Chunk {:?}: disposed in state {:?}", self.coord, self.state);
    }
}
