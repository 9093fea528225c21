//! Voxel generation: terrain fill and the background task pool that runs it

pub mod task;
pub mod terrain_gen;

pub use task::{GenerationPool, GenerationTask};
pub use terrain_gen::{TerrainGenerator, TerrainParams};
