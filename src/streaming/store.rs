//! Coordinate-keyed storage of live chunks

use std::collections::HashMap;

use crate::voxel::chunk::{Chunk, ChunkCoord, ChunkState};

use super::stats::StateCounts;

/// Owns every live chunk. A coordinate maps to at most one chunk.
#[derive(Default)]
pub struct ChunkStore {
    chunks: HashMap<ChunkCoord, Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk unless its coordinate is already live.
    pub fn insert(&mut self, chunk: Chunk) -> bool {
        if self.chunks.contains_key(&chunk.coord) {
            return false;
        }
        self.chunks.insert(chunk.coord, chunk);
        true
    }

    pub fn get(&self, coord: ChunkCoord) -> Option<&Chunk> {
        self.chunks.get(&coord)
    }

    pub fn get_mut(&mut self, coord: ChunkCoord) -> Option<&mut Chunk> {
        self.chunks.get_mut(&coord)
    }

    /// Detach a chunk; the caller disposes it
    pub fn remove(&mut self, coord: ChunkCoord) -> Option<Chunk> {
        self.chunks.remove(&coord)
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.chunks.values_mut()
    }

    pub fn coords(&self) -> Vec<ChunkCoord> {
        self.chunks.keys().copied().collect()
    }

    pub fn count_by_state(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for chunk in self.chunks.values() {
            counts.add(chunk.state());
        }
        counts
    }

    pub fn count_in(&self, state: ChunkState) -> usize {
        self.chunks.values().filter(|c| c.state() == state).count()
    }
}
