//! Heightmap terrain: grass surface over a dirt band over stone

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};

use crate::voxel::block::BlockId;
use crate::voxel::chunk::{voxel_index, ChunkCoord, CHUNK_SIZE_XZ, CHUNK_SIZE_Y, VOXELS_PER_CHUNK};

/// Horizontal noise frequency (world units to noise units)
const FREQUENCY: f64 = 0.01;
/// Dirt voxels directly under the grass surface
const DIRT_DEPTH: u32 = 3;

/// Parameters for the height noise
#[derive(Clone, Debug)]
pub struct TerrainParams {
    pub seed: u32,
    pub octaves: usize,
    pub persistence: f64,
    pub lacunarity: f64,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            seed: 1337,
            octaves: 5,
            persistence: 0.5,
            lacunarity: 2.0,
        }
    }
}

/// Deterministic column generator. Identical seeds produce identical chunks.
pub struct TerrainGenerator {
    noise: Fbm<Perlin>,
}

impl TerrainGenerator {
    pub fn new(seed: u32) -> Self {
        Self::with_params(TerrainParams {
            seed,
            ..Default::default()
        })
    }

    pub fn with_params(params: TerrainParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves)
            .set_persistence(params.persistence)
            .set_lacunarity(params.lacunarity);
        Self { noise }
    }

    /// Elevation in [0, 1] at a world column
    pub fn elevation(&self, wx: i32, wz: i32) -> f32 {
        let n = self.noise.get([wx as f64 * FREQUENCY, wz as f64 * FREQUENCY]);
        (0.5 + 0.5 * n).clamp(0.0, 1.0) as f32
    }

    /// Surface height of a column, kept one voxel away from floor and ceiling
    pub fn surface_y(&self, wx: i32, wz: i32) -> u32 {
        let max = (CHUNK_SIZE_Y - 1) as f32;
        let y = (self.elevation(wx, wz) * max).floor();
        y.clamp(1.0, (CHUNK_SIZE_Y - 2) as f32) as u32
    }

    /// Block at height `y` of a column whose surface is `surface`
    pub fn block_at(y: u32, surface: u32) -> BlockId {
        if y > surface {
            BlockId::Air
        } else if y == surface {
            BlockId::Grass
        } else if y + DIRT_DEPTH >= surface {
            BlockId::Dirt
        } else {
            BlockId::Stone
        }
    }

    /// Fill a chunk's voxel volume in place.
    pub fn fill_chunk(&self, coord: ChunkCoord, voxels: &mut [u8]) {
        debug_assert_eq!(voxels.len(), VOXELS_PER_CHUNK);
        let size = CHUNK_SIZE_XZ as i32;
        for z in 0..CHUNK_SIZE_XZ {
            for x in 0..CHUNK_SIZE_XZ {
                let wx = coord.x * size + x as i32;
                let wz = coord.z * size + z as i32;
                let surface = self.surface_y(wx, wz);
                for y in 0..CHUNK_SIZE_Y {
                    voxels[voxel_index(x, y, z)] = Self::block_at(y, surface).as_u8();
                }
            }
        }
    }

    /// Allocate and fill a fresh volume
    pub fn generate(&self, coord: ChunkCoord) -> Box<[u8]> {
        let mut voxels = vec![0u8; VOXELS_PER_CHUNK].into_boxed_slice();
        self.fill_chunk(coord, &mut voxels);
        voxels
    }
}
