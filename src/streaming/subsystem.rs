//! Streaming entry point that disables itself when setup fails

use std::time::Instant;

use crate::core::config::StreamingConfig;
use crate::core::types::Result;
use crate::generation::GenerationPool;
use crate::render::chunk_renderer::ChunkDrawSink;
use crate::render::context::GpuContext;
use crate::render::mesher::{GpuMeshWorker, MeshWorker, MesherPipelines, WorkerPool};

use super::driver::{StreamingDriver, ViewAnchors};
use super::stats::StreamingStats;

/// Owns the driver when setup succeeded. A failed setup is logged once and
/// leaves every per-tick entry point a no-op.
pub struct StreamingSubsystem<W: MeshWorker> {
    driver: Option<StreamingDriver<W>>,
}

impl<W: MeshWorker> StreamingSubsystem<W> {
    pub fn start(driver: Result<StreamingDriver<W>>) -> Self {
        match driver {
            Ok(driver) => {
                log::info!("Streaming subsystem started");
                Self { driver: Some(driver) }
            }
            Err(e) => {
                log::error!("Streaming subsystem disabled: {}", e);
                Self { driver: None }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.driver.is_some()
    }

    pub fn tick(&mut self, anchors: &ViewAnchors, now: Instant) {
        if let Some(driver) = self.driver.as_mut() {
            driver.tick(anchors, now);
        }
    }

    pub fn render(&self, sink: &mut dyn ChunkDrawSink) {
        if let Some(driver) = self.driver.as_ref() {
            driver.render(sink);
        }
    }

    pub fn stats(&self) -> StreamingStats {
        self.driver
            .as_ref()
            .map(StreamingDriver::stats)
            .unwrap_or_default()
    }

    pub fn driver(&self) -> Option<&StreamingDriver<W>> {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> Option<&mut StreamingDriver<W>> {
        self.driver.as_mut()
    }
}

/// Build a wgpu-backed driver: mesher pipelines, `worker_count` workers and
/// the generation thread pool.
pub fn build_gpu_driver(gpu: &GpuContext, config: StreamingConfig) -> Result<StreamingDriver<GpuMeshWorker>> {
    config.validate()?;
    let pipelines = MesherPipelines::new(&gpu.device);
    let workers = (0..config.worker_count)
        .map(|id| GpuMeshWorker::new(&gpu.device, &gpu.queue, pipelines.clone(), id))
        .collect::<Result<Vec<_>>>()?;
    let pool = WorkerPool::new(workers)?;
    let generation = GenerationPool::new(config.generation_threads(), config.seed)?;
    StreamingDriver::new(config, pool, generation)
}

impl StreamingSubsystem<GpuMeshWorker> {
    pub fn start_gpu(gpu: &GpuContext, config: StreamingConfig) -> Self {
        Self::start(build_gpu_driver(gpu, config))
    }
}
