//! Stratavox - infinite voxel terrain streaming with GPU compute greedy meshing

pub mod core;
pub mod math;
pub mod voxel;
pub mod generation;
pub mod render;
pub mod streaming;
