//! Read-only snapshots of the streaming pipeline

use serde::Serialize;

use crate::voxel::chunk::ChunkState;

/// Chunks per lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub requested: usize,
    pub generating: usize,
    pub ready_for_mesh: usize,
    pub meshing_gpu: usize,
    pub uploading: usize,
    pub active: usize,
}

impl StateCounts {
    pub fn add(&mut self, state: ChunkState) {
        match state {
            ChunkState::Requested => self.requested += 1,
            ChunkState::Generating => self.generating += 1,
            ChunkState::ReadyForMesh => self.ready_for_mesh += 1,
            ChunkState::MeshingGpu => self.meshing_gpu += 1,
            ChunkState::Uploading => self.uploading += 1,
            ChunkState::Active => self.active += 1,
        }
    }

    pub fn get(&self, state: ChunkState) -> usize {
        match state {
            ChunkState::Requested => self.requested,
            ChunkState::Generating => self.generating,
            ChunkState::ReadyForMesh => self.ready_for_mesh,
            ChunkState::MeshingGpu => self.meshing_gpu,
            ChunkState::Uploading => self.uploading,
            ChunkState::Active => self.active,
        }
    }

    pub fn total(&self) -> usize {
        ChunkState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Cumulative pipeline counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineTotals {
    pub loaded: u64,
    pub evicted: u64,
    pub finalized: u64,
    /// Finalized with an empty mesh after exhausting retries
    pub degraded: u64,
    pub retries: u64,
    pub dispatches: u64,
    /// Generation tasks that ended without a volume
    pub generation_failures: u64,
}

/// Snapshot handed to diagnostics; mutating it has no effect on the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamingStats {
    pub enabled: bool,
    /// Streaming center chunk (x, z)
    pub center: [i32; 2],
    pub states: StateCounts,
    pub ready_queue: usize,
    pub in_flight_readbacks: usize,
    pub active_mesh_transfers: usize,
    pub pending_removals: usize,
    pub any_in_flight: bool,
    pub busy_workers: usize,
    pub totals: PipelineTotals,
}

impl std::fmt::Display for StreamingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "center=({}, {}) active={} gen={} ready={} gpu={} upload={} queue={} readbacks={} degraded={}",
            self.center[0],
            self.center[1],
            self.states.active,
            self.states.generating,
            self.states.ready_for_mesh,
            self.states.meshing_gpu,
            self.states.uploading,
            self.ready_queue,
            self.in_flight_readbacks,
            self.totals.degraded
        )
    }
}
