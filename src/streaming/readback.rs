//! Readback scheduling: counters, sized mesh transfers, timeout and retry
//!
//! Every chunk that finished its greedy stages owns one entry here until its
//! mesh is known. Retries always reissue on the worker that still holds the
//! chunk's output, which is why that worker stays reserved until the entry
//! finishes.

use std::time::{Duration, Instant};

use crate::render::mesh::{clamp_to_quads, ChunkMesh};
use crate::render::mesher::worker::decode_counters;
use crate::render::mesher::{MeshWorker, ReadbackHandle, ReadbackPoll, WorkerId, WorkerPool};
use crate::voxel::chunk::{Chunk, ChunkCoord, ChunkState};

use super::store::ChunkStore;

struct MeshTransfer {
    vertices: ReadbackHandle,
    indices: ReadbackHandle,
    vertex_bytes: Option<Vec<u8>>,
    index_bytes: Option<Vec<u8>>,
}

impl MeshTransfer {
    fn new((vertices, indices): (ReadbackHandle, ReadbackHandle)) -> Self {
        Self {
            vertices,
            indices,
            vertex_bytes: None,
            index_bytes: None,
        }
    }
}

enum Phase {
    Counters(ReadbackHandle),
    /// Counts known; waiting for a free mesh transfer slot
    AwaitingSlot { vertices: u32, indices: u32 },
    MeshData(MeshTransfer),
}

struct InFlight {
    coord: ChunkCoord,
    worker: WorkerId,
    phase: Phase,
}

enum Step {
    Keep(Phase),
    Finish { mesh: ChunkMesh, degraded: bool },
}

/// A chunk whose readbacks resolved this tick. The caller releases the
/// worker and activates (or disposes) the chunk.
pub struct FinishedReadback {
    pub coord: ChunkCoord,
    pub worker: WorkerId,
    pub mesh: ChunkMesh,
    /// Empty mesh substituted after retries ran out
    pub degraded: bool,
}

pub struct ReadbackScheduler {
    in_flight: Vec<InFlight>,
    active_mesh_transfers: usize,
    max_mesh_transfers: usize,
    timeout: Duration,
    max_retries: u32,
    retries: u64,
}

impl ReadbackScheduler {
    pub fn new(timeout: Duration, max_retries: u32, max_mesh_transfers: usize) -> Self {
        Self {
            in_flight: Vec::new(),
            active_mesh_transfers: 0,
            max_mesh_transfers: max_mesh_transfers.max(1),
            timeout,
            max_retries,
            retries: 0,
        }
    }

    /// Track a counters readback just issued for `chunk` on `worker`.
    pub fn track_counters(&mut self, chunk: &mut Chunk, worker: WorkerId, handle: ReadbackHandle, now: Instant) {
        chunk.gpu_start = Some(now);
        chunk.retry_count = 0;
        chunk.mesh_data_requested = false;
        self.in_flight.push(InFlight {
            coord: chunk.coord,
            worker,
            phase: Phase::Counters(handle),
        });
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn active_mesh_transfers(&self) -> usize {
        self.active_mesh_transfers
    }

    /// Retries issued since creation
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Poll every entry once, in the order they were issued.
    pub fn service<W: MeshWorker>(
        &mut self,
        now: Instant,
        store: &mut ChunkStore,
        pool: &mut WorkerPool<W>,
    ) -> Vec<FinishedReadback> {
        let mut finished = Vec::new();
        for InFlight { coord, worker, phase } in std::mem::take(&mut self.in_flight) {
            let was_transfer = matches!(phase, Phase::MeshData(_));

            let Some(chunk) = store.get_mut(coord) else {
                log::error!("Readback for {:?} lost its chunk; releasing worker {}", coord, worker);
                if was_transfer {
                    self.active_mesh_transfers = self.active_mesh_transfers.saturating_sub(1);
                }
                pool.release(worker);
                continue;
            };
            let Some(gpu) = pool.worker_mut(worker) else {
                log::error!("Readback for {:?} names unknown worker {}", coord, worker);
                continue;
            };

            let step = match phase {
                Phase::Counters(handle) => self.service_counters(now, chunk, gpu, handle),
                Phase::AwaitingSlot { vertices, indices } => {
                    self.start_mesh_transfer(now, chunk, gpu, vertices, indices)
                }
                Phase::MeshData(transfer) => self.service_mesh_data(now, chunk, gpu, transfer),
            };

            match step {
                Step::Keep(phase) => self.in_flight.push(InFlight { coord, worker, phase }),
                Step::Finish { mesh, degraded } => {
                    if was_transfer {
                        self.active_mesh_transfers = self.active_mesh_transfers.saturating_sub(1);
                    }
                    finished.push(FinishedReadback {
                        coord,
                        worker,
                        mesh,
                        degraded,
                    });
                }
            }
        }
        finished
    }

    fn timed_out(&self, start: Option<Instant>, now: Instant) -> bool {
        start.is_some_and(|s| now.saturating_duration_since(s) >= self.timeout)
    }

    fn service_counters<W: MeshWorker>(
        &mut self,
        now: Instant,
        chunk: &mut Chunk,
        worker: &mut W,
        mut handle: ReadbackHandle,
    ) -> Step {
        let reason = match handle.poll() {
            ReadbackPoll::Ready(bytes) => match decode_counters(&bytes) {
                Some((vertices, indices)) => {
                    let (max_v, max_i) = worker.capacity();
                    let (v, i) = clamp_to_quads(vertices, indices, max_v, max_i);
                    if v != vertices || i != indices {
                        log::debug!(
                            "Chunk {:?}: counters ({}, {}) clamped to ({}, {})",
                            chunk.coord, vertices, indices, v, i
                        );
                    }
                    if v == 0 {
                        log::debug!("Chunk {:?}: empty mesh", chunk.coord);
                        return Step::Finish {
                            mesh: ChunkMesh::empty(),
                            degraded: false,
                        };
                    }
                    chunk.pending_vertex_count = v;
                    chunk.pending_index_count = i;
                    return self.start_mesh_transfer(now, chunk, worker, v, i);
                }
                None => format!("short counters readback ({} bytes)", bytes.len()),
            },
            ReadbackPoll::Failed(reason) => reason,
            ReadbackPoll::Pending => {
                if !self.timed_out(chunk.gpu_start, now) {
                    return Step::Keep(Phase::Counters(handle));
                }
                "timed out".to_string()
            }
        };

        if chunk.retry_count < self.max_retries {
            chunk.retry_count += 1;
            self.retries += 1;
            log::warn!(
                "Chunk {:?}: counters readback {}; retry {}/{}",
                chunk.coord, reason, chunk.retry_count, self.max_retries
            );
            chunk.gpu_start = Some(now);
            // Release the stale map before the staging buffer is copied into again
            drop(handle);
            return Step::Keep(Phase::Counters(worker.request_counters()));
        }
        self.degrade(chunk, "counters", &reason)
    }

    fn start_mesh_transfer<W: MeshWorker>(
        &mut self,
        now: Instant,
        chunk: &mut Chunk,
        worker: &mut W,
        vertices: u32,
        indices: u32,
    ) -> Step {
        if self.active_mesh_transfers >= self.max_mesh_transfers {
            return Step::Keep(Phase::AwaitingSlot { vertices, indices });
        }
        if chunk.state() != ChunkState::Uploading {
            chunk.transition(ChunkState::Uploading);
        }
        self.active_mesh_transfers += 1;
        chunk.mesh_data_requested = true;
        chunk.upload_start = Some(now);
        chunk.retry_count = 0;
        log::debug!("Chunk {:?}: reading back {} vertices, {} indices", chunk.coord, vertices, indices);
        Step::Keep(Phase::MeshData(MeshTransfer::new(worker.request_mesh_data(vertices, indices))))
    }

    fn service_mesh_data<W: MeshWorker>(
        &mut self,
        now: Instant,
        chunk: &mut Chunk,
        worker: &mut W,
        mut transfer: MeshTransfer,
    ) -> Step {
        let mut failure = None;
        if transfer.vertex_bytes.is_none() {
            match transfer.vertices.poll() {
                ReadbackPoll::Ready(bytes) => transfer.vertex_bytes = Some(bytes),
                ReadbackPoll::Failed(reason) => failure = Some(reason),
                ReadbackPoll::Pending => {}
            }
        }
        if transfer.index_bytes.is_none() {
            match transfer.indices.poll() {
                ReadbackPoll::Ready(bytes) => transfer.index_bytes = Some(bytes),
                ReadbackPoll::Failed(reason) => failure = Some(reason),
                ReadbackPoll::Pending => {}
            }
        }

        let reason = match (failure, &transfer.vertex_bytes, &transfer.index_bytes) {
            (None, Some(vertex_bytes), Some(index_bytes)) => {
                let mesh = ChunkMesh::from_readback(vertex_bytes, index_bytes);
                return Step::Finish { mesh, degraded: false };
            }
            (Some(reason), _, _) => reason,
            (None, _, _) => {
                if !self.timed_out(chunk.upload_start, now) {
                    return Step::Keep(Phase::MeshData(transfer));
                }
                "timed out".to_string()
            }
        };

        if chunk.retry_count < self.max_retries {
            chunk.retry_count += 1;
            self.retries += 1;
            log::warn!(
                "Chunk {:?}: mesh readback {}; retry {}/{}",
                chunk.coord, reason, chunk.retry_count, self.max_retries
            );
            chunk.upload_start = Some(now);
            drop(transfer);
            let handles = worker.request_mesh_data(chunk.pending_vertex_count, chunk.pending_index_count);
            return Step::Keep(Phase::MeshData(MeshTransfer::new(handles)));
        }
        self.degrade(chunk, "mesh", &reason)
    }

    fn degrade(&self, chunk: &Chunk, phase: &str, reason: &str) -> Step {
        log::warn!(
            "Chunk {:?}: {} readback {} after {} retries; finalizing with an empty mesh",
            chunk.coord, phase, reason, self.max_retries
        );
        Step::Finish {
            mesh: ChunkMesh::empty(),
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::mesher::testing::{FakeCall, FakeGpuState, FakeResponse, FakeWorker, SharedFakeState};
    use crate::render::mesher::GreedyStage;
    use crate::voxel::chunk::ChunkState;

    const TIMEOUT: Duration = Duration::from_millis(100);

    /// A chunk bound to worker 0, staged, with its counters requested.
    fn staged(
        store: &mut ChunkStore,
        pool: &mut WorkerPool<FakeWorker>,
        scheduler: &mut ReadbackScheduler,
        coord: ChunkCoord,
        now: Instant,
    ) -> WorkerId {
        let generation = crate::generation::GenerationPool::deferred(1);
        let mut chunk = Chunk::new(coord);
        chunk.begin_generation(&generation);
        generation.run_deferred();
        chunk.poll_generation();
        chunk.begin_staging();

        let worker = pool.find_free().unwrap();
        pool.bind(worker, coord);
        let gpu = pool.worker_mut(worker).unwrap();
        for stage in GreedyStage::ALL {
            gpu.dispatch_greedy_stage(stage);
        }
        let handle = gpu.request_counters();
        pool.reserve_for_readback(worker);
        scheduler.track_counters(&mut chunk, worker, handle, now);
        store.insert(chunk);
        worker
    }

    fn setup(workers: usize) -> (SharedFakeState, ChunkStore, WorkerPool<FakeWorker>) {
        let state = FakeGpuState::shared();
        let pool = WorkerPool::new(FakeWorker::pool(workers, &state)).unwrap();
        (state, ChunkStore::new(), pool)
    }

    #[test]
    fn test_counters_then_mesh_data() {
        let (state, mut store, mut pool) = setup(1);
        state.lock().unwrap().counts = (10, 17);
        let mut scheduler = ReadbackScheduler::new(TIMEOUT, 3, 2);
        let t0 = Instant::now();
        let coord = ChunkCoord::new(0, 0, 0);
        staged(&mut store, &mut pool, &mut scheduler, coord, t0);

        assert!(scheduler.service(t0, &mut store, &mut pool).is_empty());
        let chunk = store.get(coord).unwrap();
        assert_eq!(chunk.state(), ChunkState::Uploading);
        assert!(chunk.mesh_data_requested);
        assert_eq!((chunk.pending_vertex_count, chunk.pending_index_count), (8, 12));
        assert_eq!(scheduler.active_mesh_transfers(), 1);
        assert!(state.lock().unwrap().calls.contains(&(0, FakeCall::MeshData(8, 12))));

        let finished = scheduler.service(t0, &mut store, &mut pool);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].mesh.vertices.len(), 8);
        assert_eq!(finished[0].mesh.indices.len(), 12);
        assert!(!finished[0].degraded);
        assert_eq!(scheduler.active_mesh_transfers(), 0);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_empty_counters_finish_immediately() {
        let (state, mut store, mut pool) = setup(1);
        state.lock().unwrap().counts = (3, 5);
        let mut scheduler = ReadbackScheduler::new(TIMEOUT, 3, 2);
        let t0 = Instant::now();
        staged(&mut store, &mut pool, &mut scheduler, ChunkCoord::new(0, 0, 0), t0);

        let finished = scheduler.service(t0, &mut store, &mut pool);
        assert_eq!(finished.len(), 1);
        assert!(finished[0].mesh.is_empty());
        assert!(!finished[0].degraded);
        assert_eq!(scheduler.active_mesh_transfers(), 0);
    }

    #[test]
    fn test_counter_timeouts_exhaust_retries() {
        let (state, mut store, mut pool) = setup(1);
        state.lock().unwrap().counter_mode = FakeResponse::Never;
        let mut scheduler = ReadbackScheduler::new(TIMEOUT, 2, 2);
        let t0 = Instant::now();
        let coord = ChunkCoord::new(1, 0, 1);
        staged(&mut store, &mut pool, &mut scheduler, coord, t0);

        // Not yet timed out
        assert!(scheduler.service(t0 + TIMEOUT / 2, &mut store, &mut pool).is_empty());
        assert_eq!(store.get(coord).unwrap().retry_count, 0);

        assert!(scheduler.service(t0 + TIMEOUT, &mut store, &mut pool).is_empty());
        assert_eq!(store.get(coord).unwrap().retry_count, 1);
        assert!(scheduler.service(t0 + TIMEOUT * 2, &mut store, &mut pool).is_empty());
        assert_eq!(store.get(coord).unwrap().retry_count, 2);

        let finished = scheduler.service(t0 + TIMEOUT * 3, &mut store, &mut pool);
        assert_eq!(finished.len(), 1);
        assert!(finished[0].degraded);
        assert!(finished[0].mesh.is_empty());
        assert_eq!(scheduler.retries(), 2);

        // One original request plus two retries, all on worker 0
        let counters = state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(w, c)| *w == 0 && *c == FakeCall::Counters)
            .count();
        assert_eq!(counters, 3);
    }

    #[test]
    fn test_mesh_failure_retries_same_counts() {
        let (state, mut store, mut pool) = setup(1);
        let mut scheduler = ReadbackScheduler::new(TIMEOUT, 1, 2);
        let t0 = Instant::now();
        staged(&mut store, &mut pool, &mut scheduler, ChunkCoord::new(0, 0, 0), t0);

        scheduler.service(t0, &mut store, &mut pool);
        state.lock().unwrap().mesh_mode = FakeResponse::Fail;
        assert!(scheduler.service(t0, &mut store, &mut pool).is_empty());

        let finished = scheduler.service(t0, &mut store, &mut pool);
        assert_eq!(finished.len(), 1);
        assert!(finished[0].degraded);
        assert_eq!(scheduler.active_mesh_transfers(), 0);

        let mesh_requests: Vec<_> = state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|(_, c)| match c {
                FakeCall::MeshData(v, i) => Some((*v, *i)),
                _ => None,
            })
            .collect();
        assert_eq!(mesh_requests, vec![(8, 12), (8, 12)]);
    }

    #[test]
    fn test_retries_release_stale_readbacks() {
        let (state, mut store, mut pool) = setup(1);
        state.lock().unwrap().counter_mode = FakeResponse::Never;
        let mut scheduler = ReadbackScheduler::new(TIMEOUT, 1, 2);
        let t0 = Instant::now();
        let coord = ChunkCoord::new(2, 0, 0);
        staged(&mut store, &mut pool, &mut scheduler, coord, t0);

        // Counters time out and are reissued into the same staging buffer
        assert!(scheduler.service(t0 + TIMEOUT, &mut store, &mut pool).is_empty());
        assert_eq!(store.get(coord).unwrap().retry_count, 1);
        assert_eq!(state.lock().unwrap().live_readbacks(), 1);

        state.lock().unwrap().counter_mode = FakeResponse::Immediate;
        state.lock().unwrap().mesh_mode = FakeResponse::Fail;
        let t1 = t0 + TIMEOUT;
        assert!(scheduler.service(t1, &mut store, &mut pool).is_empty());
        // Mesh failure is retried once
        assert!(scheduler.service(t1, &mut store, &mut pool).is_empty());
        assert_eq!(store.get(coord).unwrap().retry_count, 1);

        state.lock().unwrap().mesh_mode = FakeResponse::Immediate;
        let finished = scheduler.service(t1, &mut store, &mut pool);
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].degraded);
        assert_eq!(finished[0].mesh.vertices.len(), 8);

        let state = state.lock().unwrap();
        assert_eq!(state.overlapping_requests, 0);
        assert_eq!(state.live_readbacks(), 0);
    }

    #[test]
    fn test_mesh_transfer_cap_defers() {
        let (_state, mut store, mut pool) = setup(2);
        let mut scheduler = ReadbackScheduler::new(TIMEOUT, 3, 1);
        let t0 = Instant::now();
        let a = ChunkCoord::new(0, 0, 0);
        let b = ChunkCoord::new(1, 0, 0);
        staged(&mut store, &mut pool, &mut scheduler, a, t0);
        staged(&mut store, &mut pool, &mut scheduler, b, t0);

        scheduler.service(t0, &mut store, &mut pool);
        assert_eq!(scheduler.active_mesh_transfers(), 1);
        assert_eq!(store.get(a).unwrap().state(), ChunkState::Uploading);
        // Second chunk waits with its counts known but nothing requested
        let waiting = store.get(b).unwrap();
        assert_eq!(waiting.state(), ChunkState::MeshingGpu);
        assert!(!waiting.mesh_data_requested);

        // `a` finishes first and frees the slot `b` was waiting for
        let finished = scheduler.service(t0, &mut store, &mut pool);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].coord, a);
        assert_eq!(store.get(b).unwrap().state(), ChunkState::Uploading);
        assert_eq!(scheduler.active_mesh_transfers(), 1);

        let finished = scheduler.service(t0, &mut store, &mut pool);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].coord, b);
    }
}
