//! GPU context, chunk meshes and the compute mesher

pub mod chunk_renderer;
pub mod context;
pub mod mesh;
pub mod mesher;
