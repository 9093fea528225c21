//! Per-tick streaming orchestration
//!
//! One `tick` runs, in order: center resolution, spiral loading, eviction,
//! promotion of generated chunks, staged GPU work under the dispatch budget,
//! and readback servicing. `render` then draws every active chunk.

use std::time::Instant;

use glam::{IVec2, Vec3};

use crate::core::config::StreamingConfig;
use crate::core::types::Result;
use crate::generation::GenerationPool;
use crate::render::chunk_renderer::ChunkDrawSink;
use crate::render::mesher::{GreedyStage, MeshParams, MeshWorker, WorkerId, WorkerPool, GREEDY_STAGE_COUNT};
use crate::voxel::block::BlockRegistry;
use crate::voxel::chunk::{Chunk, ChunkCoord, ChunkState};

use super::readback::{FinishedReadback, ReadbackScheduler};
use super::spiral::SpiralIndexer;
use super::stats::{PipelineTotals, StreamingStats};
use super::store::ChunkStore;

/// Positions the streaming center may follow, in order of preference.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ViewAnchors {
    /// Dedicated streaming driver (player)
    pub driver: Option<Vec3>,
    pub camera: Option<Vec3>,
    /// Position of the streaming subsystem itself
    pub fallback: Vec3,
}

impl ViewAnchors {
    pub fn at(position: Vec3) -> Self {
        Self {
            driver: Some(position),
            ..Default::default()
        }
    }

    pub fn resolve(&self) -> Vec3 {
        self.driver.or(self.camera).unwrap_or(self.fallback)
    }
}

pub struct StreamingDriver<W: MeshWorker> {
    config: StreamingConfig,
    spiral: SpiralIndexer,
    store: ChunkStore,
    generation: GenerationPool,
    pool: WorkerPool<W>,
    readbacks: ReadbackScheduler,
    /// Generated chunks waiting for a worker, in promotion order
    ready_queue: Vec<ChunkCoord>,
    center: ChunkCoord,
    mesh_params: MeshParams,
    totals: PipelineTotals,
}

impl<W: MeshWorker> StreamingDriver<W> {
    pub fn new(config: StreamingConfig, pool: WorkerPool<W>, generation: GenerationPool) -> Result<Self> {
        config.validate()?;

        let mut spiral = SpiralIndexer::new();
        spiral.ensure(config.view_distance);

        let readbacks = ReadbackScheduler::new(
            config.readback_timeout(),
            config.max_gpu_retries,
            config.max_concurrent_mesh_readbacks,
        );
        let mesh_params = MeshParams {
            sun_direction: config.sun_direction(),
            shadow_steps: config.shadow_steps,
            shadow_step_length: config.shadow_step_length,
            ..Default::default()
        };

        log::info!(
            "Streaming driver: view distance {}, {} workers, {} dispatches/tick",
            config.view_distance,
            pool.len(),
            config.max_greedy_dispatches_per_tick
        );

        let mut driver = Self {
            config,
            spiral,
            store: ChunkStore::new(),
            generation,
            pool,
            readbacks,
            ready_queue: Vec::new(),
            center: ChunkCoord::default(),
            mesh_params,
            totals: PipelineTotals::default(),
        };
        driver.refresh_block_data(&BlockRegistry::default());
        Ok(driver)
    }

    /// Run one orchestration pass.
    pub fn tick(&mut self, anchors: &ViewAnchors, now: Instant) {
        self.center = ChunkCoord::from_world_pos(anchors.resolve());
        self.stream_around(self.center);
        self.evict();
        self.promote();
        self.advance_gpu_work(now);
        self.service_readbacks(now);
    }

    /// Create and schedule generation for missing chunks in spiral order
    /// around `center`, up to the per-tick load cap. Returns chunks created.
    pub fn stream_around(&mut self, center: ChunkCoord) -> usize {
        self.spiral.ensure(self.config.view_distance);
        let mut loaded = 0;
        for offset in self.spiral.offsets() {
            if loaded >= self.config.max_loads_per_tick {
                break;
            }
            let coord = center.offset(*offset);
            if self.store.contains(coord) {
                continue;
            }
            let mut chunk = Chunk::new(coord);
            chunk.begin_generation(&self.generation);
            self.store.insert(chunk);
            loaded += 1;
        }
        if loaded > 0 {
            log::debug!("Loaded {} chunks around {:?}", loaded, center);
            self.totals.loaded += loaded as u64;
        }
        loaded
    }

    /// Remove chunks beyond `view_distance + 1`. Chunks on a worker are only
    /// flagged; they are disposed when their readback resolves.
    fn evict(&mut self) {
        let limit = self.config.view_distance + 1;
        for coord in self.store.coords() {
            let out_of_range = coord.chebyshev_distance(self.center) > limit;
            let Some(chunk) = self.store.get_mut(coord) else {
                continue;
            };
            if !out_of_range {
                chunk.pending_removal = false;
                continue;
            }
            if chunk.state().is_in_flight() {
                if !chunk.pending_removal {
                    log::debug!("Chunk {:?}: out of range in flight, removal deferred", coord);
                    chunk.pending_removal = true;
                }
                continue;
            }
            self.ready_queue.retain(|c| *c != coord);
            if let Some(chunk) = self.store.remove(coord) {
                chunk.dispose();
                self.totals.evicted += 1;
            }
        }
    }

    /// Move finished generation tasks into the ready queue. Chunks whose
    /// generation failed are dropped so the next load pass recreates them.
    fn promote(&mut self) {
        let mut failed = Vec::new();
        for chunk in self.store.iter_mut() {
            if chunk.poll_generation() {
                self.ready_queue.push(chunk.coord);
            } else if chunk.generation_failed() {
                failed.push(chunk.coord);
            }
        }
        for coord in failed {
            if let Some(chunk) = self.store.remove(coord) {
                log::warn!("Chunk {:?}: dropped after failed generation, will reload", coord);
                chunk.dispose();
                self.totals.generation_failures += 1;
            }
        }
    }

    fn advance_gpu_work(&mut self, now: Instant) {
        let mut budget = self.config.max_greedy_dispatches_per_tick;

        for (worker, coord) in self.pool.bound() {
            if budget == 0 {
                return;
            }
            budget = self.run_stages(worker, coord, budget, now);
        }

        let mut begun = 0;
        while budget > 0 && begun < self.config.max_begin_per_tick && !self.ready_queue.is_empty() {
            let Some(worker) = self.pool.find_free() else {
                break;
            };
            let Some(index) = self.pick_ready() else {
                break;
            };
            let coord = self.ready_queue.remove(index);
            if !self.begin_chunk(worker, coord) {
                continue;
            }
            begun += 1;
            budget = self.run_stages(worker, coord, budget, now);
        }
    }

    /// Ready chunk with the lowest spiral priority; first one wins ties.
    fn pick_ready(&self) -> Option<usize> {
        self.ready_queue
            .iter()
            .enumerate()
            .min_by_key(|(_, coord)| self.spiral.priority_of(coord.offset_from(self.center)))
            .map(|(index, _)| index)
    }

    fn begin_chunk(&mut self, worker: WorkerId, coord: ChunkCoord) -> bool {
        let Some(chunk) = self.store.get_mut(coord) else {
            return false;
        };
        if chunk.state() != ChunkState::ReadyForMesh {
            return false;
        }
        let (Some(gpu), Some(voxels)) = (self.pool.worker_mut(worker), chunk.voxels()) else {
            return false;
        };
        gpu.upload(voxels);
        gpu.prepare_for_chunk(coord, &self.mesh_params);
        if !chunk.begin_staging() {
            return false;
        }
        self.pool.bind(worker, coord);
        log::debug!("Chunk {:?}: staged on worker {}", coord, worker);
        true
    }

    /// Dispatch remaining greedy stages for a bound chunk within `budget`.
    /// After the last stage the counters are requested and the worker is
    /// reserved. Returns the unspent budget.
    fn run_stages(&mut self, worker: WorkerId, coord: ChunkCoord, mut budget: usize, now: Instant) -> usize {
        let Some(chunk) = self.store.get_mut(coord) else {
            log::error!("Worker {} bound to missing chunk {:?}; releasing", worker, coord);
            self.pool.release(worker);
            return budget;
        };
        let Some(gpu) = self.pool.worker_mut(worker) else {
            return budget;
        };

        while budget > 0 && chunk.gpu_stage < GREEDY_STAGE_COUNT {
            if let Some(stage) = GreedyStage::from_index(chunk.gpu_stage) {
                gpu.dispatch_greedy_stage(stage);
            }
            chunk.gpu_stage += 1;
            budget -= 1;
            self.totals.dispatches += 1;
        }

        if chunk.gpu_stage >= GREEDY_STAGE_COUNT {
            let handle = gpu.request_counters();
            self.pool.reserve_for_readback(worker);
            self.readbacks.track_counters(chunk, worker, handle, now);
            log::debug!("Chunk {:?}: stages complete, counters requested", coord);
        }
        budget
    }

    fn service_readbacks(&mut self, now: Instant) {
        self.pool.maintain();
        for finished in self.readbacks.service(now, &mut self.store, &mut self.pool) {
            self.finalize(finished);
        }
    }

    fn finalize(&mut self, finished: FinishedReadback) {
        let FinishedReadback { coord, worker, mesh, degraded } = finished;
        self.pool.release(worker);

        let Some(chunk) = self.store.get_mut(coord) else {
            return;
        };
        let quads = mesh.quad_count();
        self.totals.finalized += 1;
        // Finalize count doubles as a unique mesh revision
        chunk.activate(mesh, self.totals.finalized);
        if degraded {
            self.totals.degraded += 1;
        }
        log::debug!("Chunk {:?}: active with {} quads", coord, quads);

        if chunk.pending_removal {
            if let Some(chunk) = self.store.remove(coord) {
                chunk.dispose();
                self.totals.evicted += 1;
            }
        }
    }

    /// Draw every active chunk at its world origin with the shared material.
    pub fn render(&self, sink: &mut dyn ChunkDrawSink) {
        sink.set_atlas_tiles_per_row(self.mesh_params.atlas_tiles_per_row);
        for chunk in self.store.iter() {
            if chunk.state() != ChunkState::Active {
                continue;
            }
            if let Some(mesh) = chunk.mesh() {
                sink.draw_chunk(chunk.coord, chunk.mesh_revision(), chunk.coord.world_origin(), mesh);
            }
        }
    }

    /// Push block face tiles and flags to every worker and update the
    /// material scalar.
    pub fn refresh_block_data(&mut self, registry: &BlockRegistry) {
        let table = registry.face_texture_indices();
        let flags = registry.block_flags();
        self.pool.set_block_data(&table, &flags);
        self.mesh_params.atlas_tiles_per_row = registry.atlas_tiles_per_row;
        log::info!(
            "Block data refreshed: {} face entries, {} block types, {} tiles per row",
            table.len(),
            flags.len(),
            registry.atlas_tiles_per_row
        );
    }

    /// Sun direction used for chunks staged from now on
    pub fn set_sun_direction(&mut self, direction: Vec3) {
        self.mesh_params.sun_direction = direction.try_normalize().unwrap_or(Vec3::Y);
    }

    pub fn stats(&self) -> StreamingStats {
        let states = self.store.count_by_state();
        let mut totals = self.totals;
        totals.retries = self.readbacks.retries();
        StreamingStats {
            enabled: true,
            center: [self.center.x, self.center.z],
            states,
            ready_queue: self.ready_queue.len(),
            in_flight_readbacks: self.readbacks.len(),
            active_mesh_transfers: self.readbacks.active_mesh_transfers(),
            pending_removals: self.store.iter().filter(|c| c.pending_removal).count(),
            any_in_flight: states.meshing_gpu + states.uploading > 0,
            busy_workers: self.pool.busy_count(),
            totals,
        }
    }

    pub fn center(&self) -> ChunkCoord {
        self.center
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool<W> {
        &self.pool
    }

    pub fn ready_queue(&self) -> &[ChunkCoord] {
        &self.ready_queue
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn generation(&self) -> &GenerationPool {
        &self.generation
    }

    /// Spiral rank of a chunk relative to the current center
    pub fn priority_of(&self, coord: ChunkCoord) -> u64 {
        self.spiral.priority_of(coord.offset_from(self.center))
    }

    /// Offsets currently loaded, relative to the center
    pub fn loaded_offsets(&self) -> Vec<IVec2> {
        self.store.iter().map(|c| c.coord.offset_from(self.center)).collect()
    }
}
