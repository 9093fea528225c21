//! Block types and their per-face atlas tiles

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Voxels store block ids as a single byte.
pub const MAX_BLOCK_TYPES: usize = 256;

/// Faces per block in the face texture table
pub const FACES_PER_BLOCK: usize = 6;

/// Block flag bits pushed to the mesher alongside the face tile table.
/// Transparent blocks do not hide their neighbours' faces.
pub const BLOCK_FLAG_TRANSPARENT: u32 = 1;
/// Solid blocks show faces against any non-opaque neighbour; non-solid
/// blocks (water) only show faces against other non-solid blocks.
pub const BLOCK_FLAG_SOLID: u32 = 2;

/// Built-in block ids written by terrain generation
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockId {
    Air = 0,
    Grass = 1,
    Dirt = 2,
    Stone = 3,
    Sand = 4,
    Water = 5,
}

impl BlockId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Block face; the discriminant is the face's slot in the texture table
/// and its bit in the mesher's visibility mask.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockFace {
    /// +Y
    Top = 0,
    /// -Y
    Bottom = 1,
    /// +Z
    North = 2,
    /// -Z
    South = 3,
    /// +X
    East = 4,
    /// -X
    West = 5,
}

impl BlockFace {
    pub const ALL: [BlockFace; 6] = [
        BlockFace::Top,
        BlockFace::Bottom,
        BlockFace::North,
        BlockFace::South,
        BlockFace::East,
        BlockFace::West,
    ];
}

/// Atlas tile index for each face of a block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFaceTextures {
    pub top: u32,
    pub bottom: u32,
    pub north: u32,
    pub south: u32,
    pub east: u32,
    pub west: u32,
}

impl BlockFaceTextures {
    /// Same tile on every face
    pub fn uniform(tile: u32) -> Self {
        Self::top_side_bottom(tile, tile, tile)
    }

    /// Distinct top and bottom tiles, one tile for all four sides
    pub fn top_side_bottom(top: u32, side: u32, bottom: u32) -> Self {
        Self {
            top,
            bottom,
            north: side,
            south: side,
            east: side,
            west: side,
        }
    }

    pub fn get(&self, face: BlockFace) -> u32 {
        match face {
            BlockFace::Top => self.top,
            BlockFace::Bottom => self.bottom,
            BlockFace::North => self.north,
            BlockFace::South => self.south,
            BlockFace::East => self.east,
            BlockFace::West => self.west,
        }
    }
}

/// A block type as loaded from the registry file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: u8,
    pub name: String,
    #[serde(default)]
    pub transparent: bool,
    #[serde(default = "default_solid")]
    pub solid: bool,
    pub textures: BlockFaceTextures,
}

fn default_solid() -> bool {
    true
}

impl BlockDefinition {
    pub fn new(id: BlockId, name: &str, transparent: bool, textures: BlockFaceTextures) -> Self {
        Self {
            id: id.as_u8(),
            name: name.to_string(),
            transparent,
            solid: true,
            textures,
        }
    }

    pub fn with_solid(mut self, solid: bool) -> Self {
        self.solid = solid;
        self
    }

    /// Packed `BLOCK_FLAG_*` bits
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.transparent {
            flags |= BLOCK_FLAG_TRANSPARENT;
        }
        if self.solid {
            flags |= BLOCK_FLAG_SOLID;
        }
        flags
    }
}

/// Block definitions plus atlas layout, uploaded to every mesh worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRegistry {
    pub atlas_tiles_per_row: u32,
    pub blocks: Vec<BlockDefinition>,
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self {
            atlas_tiles_per_row: 16,
            blocks: vec![
                BlockDefinition::new(BlockId::Air, "air", true, BlockFaceTextures::uniform(0))
                    .with_solid(false),
                BlockDefinition::new(
                    BlockId::Grass,
                    "grass",
                    false,
                    BlockFaceTextures::top_side_bottom(0, 1, 2),
                ),
                BlockDefinition::new(BlockId::Dirt, "dirt", false, BlockFaceTextures::uniform(2)),
                BlockDefinition::new(BlockId::Stone, "stone", false, BlockFaceTextures::uniform(3)),
                BlockDefinition::new(BlockId::Sand, "sand", false, BlockFaceTextures::uniform(4)),
                BlockDefinition::new(BlockId::Water, "water", true, BlockFaceTextures::uniform(5))
                    .with_solid(false),
            ],
        }
    }
}

impl BlockRegistry {
    /// Load a registry from JSON and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let registry: Self = serde_json::from_str(&text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.atlas_tiles_per_row == 0 {
            return Err(Error::Config("atlas_tiles_per_row must be at least 1".into()));
        }
        let mut seen = [false; MAX_BLOCK_TYPES];
        for block in &self.blocks {
            let slot = &mut seen[block.id as usize];
            if *slot {
                return Err(Error::Config(format!("duplicate block id {}", block.id)));
            }
            *slot = true;
        }
        Ok(())
    }

    pub fn get(&self, id: u8) -> Option<&BlockDefinition> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Flattened face tile table, six entries per block id in `BlockFace`
    /// order. Ids without a definition map to tile 0.
    pub fn face_texture_indices(&self) -> Vec<u32> {
        let len = self
            .blocks
            .iter()
            .map(|b| b.id as usize + 1)
            .max()
            .unwrap_or(0);
        let mut table = vec![0u32; len * FACES_PER_BLOCK];
        for block in &self.blocks {
            let base = block.id as usize * FACES_PER_BLOCK;
            for face in BlockFace::ALL {
                table[base + face as usize] = block.textures.get(face);
            }
        }
        table
    }

    /// Per-id flag table, one entry per block id up to the highest defined
    /// id. Ids without a definition are opaque and solid.
    pub fn block_flags(&self) -> Vec<u32> {
        let len = self
            .blocks
            .iter()
            .map(|b| b.id as usize + 1)
            .max()
            .unwrap_or(0);
        let mut flags = vec![BLOCK_FLAG_SOLID; len];
        for block in &self.blocks {
            flags[block.id as usize] = block.flags();
        }
        flags
    }
}
