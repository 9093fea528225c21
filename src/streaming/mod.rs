//! Chunk streaming: spiral prioritization, chunk lifecycle and GPU meshing
//! orchestration

pub mod driver;
pub mod readback;
pub mod spiral;
pub mod stats;
pub mod store;
pub mod subsystem;

pub use driver::{StreamingDriver, ViewAnchors};
pub use readback::{FinishedReadback, ReadbackScheduler};
pub use spiral::SpiralIndexer;
pub use stats::{PipelineTotals, StateCounts, StreamingStats};
pub use store::ChunkStore;
pub use subsystem::{build_gpu_driver, StreamingSubsystem};
