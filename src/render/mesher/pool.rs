//! Fixed-size pool of mesh workers and their chunk bindings

use crate::core::error::Error;
use crate::core::types::Result;
use crate::voxel::chunk::ChunkCoord;

use super::worker::MeshWorker;

pub type WorkerId = usize;

/// Ownership of one worker's buffers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerSlot {
    Free,
    /// Receiving greedy stages for this chunk
    Bound(ChunkCoord),
    /// Buffers hold this chunk's output while it is read back
    ReservedForReadback(ChunkCoord),
}

impl WorkerSlot {
    pub fn chunk(&self) -> Option<ChunkCoord> {
        match *self {
            WorkerSlot::Free => None,
            WorkerSlot::Bound(c) | WorkerSlot::ReservedForReadback(c) => Some(c),
        }
    }
}

/// Arbitrates which chunk owns which worker. A worker is owned by at most
/// one chunk, and a reserved worker is never handed out again until released.
pub struct WorkerPool<W> {
    workers: Vec<W>,
    slots: Vec<WorkerSlot>,
}

impl<W: MeshWorker> WorkerPool<W> {
    pub fn new(workers: Vec<W>) -> Result<Self> {
        if workers.is_empty() {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        let slots = vec![WorkerSlot::Free; workers.len()];
        log::info!("Mesh worker pool: {} workers", workers.len());
        Ok(Self { workers, slots })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// First worker with neither a bound chunk nor a reservation
    pub fn find_free(&self) -> Option<WorkerId> {
        self.slots.iter().position(|s| *s == WorkerSlot::Free)
    }

    /// Bind a free worker to `coord`. Fails if the worker is taken.
    pub fn bind(&mut self, worker: WorkerId, coord: ChunkCoord) -> bool {
        match self.slots.get_mut(worker) {
            Some(slot) if *slot == WorkerSlot::Free => {
                *slot = WorkerSlot::Bound(coord);
                true
            }
            _ => false,
        }
    }

    /// Bound -> ReservedForReadback for the same chunk
    pub fn reserve_for_readback(&mut self, worker: WorkerId) -> bool {
        match self.slots.get_mut(worker) {
            Some(slot) => match *slot {
                WorkerSlot::Bound(coord) => {
                    *slot = WorkerSlot::ReservedForReadback(coord);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Clear binding and reservation. Idempotent.
    pub fn release(&mut self, worker: WorkerId) {
        if let Some(slot) = self.slots.get_mut(worker) {
            *slot = WorkerSlot::Free;
        }
    }

    /// Worker whose buffers currently belong to `coord`
    pub fn find_worker_for(&self, coord: ChunkCoord) -> Option<WorkerId> {
        self.slots.iter().position(|s| s.chunk() == Some(coord))
    }

    pub fn slot(&self, worker: WorkerId) -> Option<WorkerSlot> {
        self.slots.get(worker).copied()
    }

    pub fn worker_mut(&mut self, worker: WorkerId) -> Option<&mut W> {
        self.workers.get_mut(worker)
    }

    /// Workers in the `Bound` state with their chunk, in pool order
    pub fn bound(&self) -> Vec<(WorkerId, ChunkCoord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match *slot {
                WorkerSlot::Bound(coord) => Some((id, coord)),
                _ => None,
            })
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| **s != WorkerSlot::Free).count()
    }

    /// Push block metadata to every worker
    pub fn set_block_data(&mut self, face_textures: &[u32], block_flags: &[u32]) {
        for worker in &mut self.workers {
            worker.set_face_textures(face_textures);
            worker.set_block_flags(block_flags);
        }
    }

    pub fn maintain(&mut self) {
        for worker in &mut self.workers {
            worker.maintain();
        }
    }
}
