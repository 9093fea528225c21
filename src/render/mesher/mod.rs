//! GPU greedy meshing: worker interface, wgpu worker, worker pool, readbacks

pub mod gpu_worker;
pub mod pool;
pub mod readback;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use gpu_worker::{GpuMeshWorker, MesherPipelines};
pub use pool::{WorkerId, WorkerPool, WorkerSlot};
pub use readback::{GpuReadback, Readback, ReadbackHandle, ReadbackPoll, ResolvedReadback, StagingBuffer};
pub use worker::{GreedyStage, MeshParams, MeshWorker, GREEDY_STAGE_COUNT};
