//! Scriptable in-memory mesh worker for exercising the pipeline without a GPU

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::render::mesh::{PackedVertex, VERTEX_STRIDE_BYTES};
use crate::voxel::chunk::ChunkCoord;

use super::readback::{Readback, ReadbackHandle, ReadbackPoll};
use super::worker::{GreedyStage, MeshParams, MeshWorker};

/// How readbacks resolve, read each time a readback is polled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeResponse {
    Immediate,
    Never,
    Fail,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FakeCall {
    Upload,
    Prepare(ChunkCoord),
    Dispatch(GreedyStage),
    Counters,
    MeshData(u32, u32),
    FaceTextures(usize),
    BlockFlags(Vec<u32>),
}

#[derive(Debug)]
pub struct FakeGpuState {
    pub counter_mode: FakeResponse,
    pub mesh_mode: FakeResponse,
    /// Reported (vertices, indices)
    pub counts: (u32, u32),
    pub calls: Vec<(usize, FakeCall)>,
    /// Undropped readbacks per (worker, stream)
    live: HashMap<(usize, FakeStream), u32>,
    /// Requests issued while the same worker's previous readback of that
    /// stream was still alive, i.e. a staging buffer reused under a map
    pub overlapping_requests: u32,
}

impl Default for FakeGpuState {
    fn default() -> Self {
        Self {
            counter_mode: FakeResponse::Immediate,
            mesh_mode: FakeResponse::Immediate,
            counts: (8, 12),
            calls: Vec::new(),
            live: HashMap::new(),
            overlapping_requests: 0,
        }
    }
}

pub type SharedFakeState = Arc<Mutex<FakeGpuState>>;

impl FakeGpuState {
    pub fn shared() -> SharedFakeState {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Readbacks issued and not yet dropped
    pub fn live_readbacks(&self) -> u32 {
        self.live.values().sum()
    }

    fn open(&mut self, worker: usize, stream: FakeStream) {
        let live = self.live.entry((worker, stream)).or_insert(0);
        if *live > 0 {
            self.overlapping_requests += 1;
        }
        *live += 1;
    }
}

#[derive(Default)]
pub struct FakeWorker {
    id: usize,
    state: SharedFakeState,
}

impl FakeWorker {
    pub fn new(id: usize, state: SharedFakeState) -> Self {
        Self { id, state }
    }

    /// `count` workers sharing one state
    pub fn pool(count: usize, state: &SharedFakeState) -> Vec<Self> {
        (0..count).map(|id| Self::new(id, Arc::clone(state))).collect()
    }

    fn record(&self, call: FakeCall) {
        self.state.lock().unwrap().calls.push((self.id, call));
    }

    fn readback(&self, payload: FakePayload) -> ReadbackHandle {
        self.state.lock().unwrap().open(self.id, payload.stream());
        Box::new(FakeReadback {
            state: Arc::clone(&self.state),
            worker: self.id,
            payload,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum FakeStream {
    Counters,
    Vertices,
    Indices,
}

enum FakePayload {
    Counters,
    Vertices(u32),
    Indices(u32),
}

impl FakePayload {
    fn stream(&self) -> FakeStream {
        match self {
            FakePayload::Counters => FakeStream::Counters,
            FakePayload::Vertices(_) => FakeStream::Vertices,
            FakePayload::Indices(_) => FakeStream::Indices,
        }
    }
}

struct FakeReadback {
    state: SharedFakeState,
    worker: usize,
    payload: FakePayload,
}

impl Drop for FakeReadback {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(live) = state.live.get_mut(&(self.worker, self.payload.stream())) {
                *live = live.saturating_sub(1);
            }
        }
    }
}

impl Readback for FakeReadback {
    fn poll(&mut self) -> ReadbackPoll {
        let state = self.state.lock().unwrap();
        let mode = match self.payload {
            FakePayload::Counters => state.counter_mode,
            _ => state.mesh_mode,
        };
        match mode {
            FakeResponse::Never => ReadbackPoll::Pending,
            FakeResponse::Fail => ReadbackPoll::Failed("injected failure".into()),
            FakeResponse::Immediate => {
                let bytes = match self.payload {
                    FakePayload::Counters => {
                        let mut b = state.counts.0.to_le_bytes().to_vec();
                        b.extend_from_slice(&state.counts.1.to_le_bytes());
                        b
                    }
                    FakePayload::Vertices(n) => {
                        let v = PackedVertex::default();
                        let mut b = Vec::with_capacity(n as usize * VERTEX_STRIDE_BYTES);
                        for _ in 0..n {
                            b.extend_from_slice(bytemuck::bytes_of(&v));
                        }
                        b
                    }
                    FakePayload::Indices(n) => (0..n).flat_map(|i| (i % 4).to_le_bytes()).collect(),
                };
                ReadbackPoll::Ready(bytes)
            }
        }
    }
}

impl MeshWorker for FakeWorker {
    fn upload(&mut self, _voxels: &[u8]) {
        self.record(FakeCall::Upload);
    }

    fn prepare_for_chunk(&mut self, coord: ChunkCoord, _params: &MeshParams) {
        self.record(FakeCall::Prepare(coord));
    }

    fn dispatch_greedy_stage(&mut self, stage: GreedyStage) {
        self.record(FakeCall::Dispatch(stage));
    }

    fn request_counters(&mut self) -> ReadbackHandle {
        self.record(FakeCall::Counters);
        self.readback(FakePayload::Counters)
    }

    fn request_mesh_data(&mut self, vertex_count: u32, index_count: u32) -> (ReadbackHandle, ReadbackHandle) {
        self.record(FakeCall::MeshData(vertex_count, index_count));
        (
            self.readback(FakePayload::Vertices(vertex_count)),
            self.readback(FakePayload::Indices(index_count)),
        )
    }

    fn set_face_textures(&mut self, table: &[u32]) {
        self.record(FakeCall::FaceTextures(table.len()));
    }

    fn set_block_flags(&mut self, flags: &[u32]) {
        self.record(FakeCall::BlockFlags(flags.to_vec()));
    }
}
