//! Background voxel generation tasks
//!
//! A task borrows the chunk's voxel volume by value and hands it back over a
//! channel when the fill finishes. The owning chunk polls without blocking
//! and may force completion (for example on disposal), in which case a job
//! that has not started yet runs inline on the caller.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::voxel::chunk::ChunkCoord;

use super::terrain_gen::TerrainGenerator;

type Job = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A queued job; whichever side takes it first runs it.
struct TaskCell {
    job: Mutex<Option<Job>>,
}

impl TaskCell {
    fn run(&self) -> bool {
        let job = lock(&self.job).take();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

enum Executor {
    Threaded(rayon::ThreadPool),
    /// Jobs wait until `run_deferred`; used for deterministic tests
    Deferred(Mutex<Vec<Arc<TaskCell>>>),
}

/// Runs terrain fills off the streaming thread.
pub struct GenerationPool {
    generator: Arc<TerrainGenerator>,
    executor: Executor,
}

impl GenerationPool {
    /// Thread-backed pool with `threads` workers
    pub fn new(threads: usize, seed: u32) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("chunk-gen-{}", i))
            .build()
            .map_err(|e| Error::Generation(format!("failed to build generation pool: {}", e)))?;
        log::info!("Generation pool: {} threads, seed {}", threads.max(1), seed);
        Ok(Self {
            generator: Arc::new(TerrainGenerator::new(seed)),
            executor: Executor::Threaded(pool),
        })
    }

    /// Pool that only runs jobs when `run_deferred` is called
    pub fn deferred(seed: u32) -> Self {
        Self {
            generator: Arc::new(TerrainGenerator::new(seed)),
            executor: Executor::Deferred(Mutex::new(Vec::new())),
        }
    }

    /// Queue a fill of `voxels` for `coord`.
    pub fn schedule(&self, coord: ChunkCoord, voxels: Box<[u8]>) -> GenerationTask {
        let (tx, rx) = mpsc::channel();
        let generator = Arc::clone(&self.generator);
        let job: Job = Box::new(move || {
            let mut voxels = voxels;
            generator.fill_chunk(coord, &mut voxels);
            // Receiver gone means the chunk was dropped; nothing to return to.
            let _ = tx.send(voxels);
        });
        let cell = Arc::new(TaskCell {
            job: Mutex::new(Some(job)),
        });

        match &self.executor {
            Executor::Threaded(pool) => {
                let cell = Arc::clone(&cell);
                pool.spawn(move || {
                    cell.run();
                });
            }
            Executor::Deferred(queue) => lock(queue).push(Arc::clone(&cell)),
        }

        GenerationTask {
            coord,
            cell,
            rx,
            result: None,
        }
    }

    /// Run every queued deferred job. Returns how many actually executed
    /// (jobs already forced by their owner are skipped).
    pub fn run_deferred(&self) -> usize {
        let Executor::Deferred(queue) = &self.executor else {
            return 0;
        };
        let cells = std::mem::take(&mut *lock(queue));
        cells.iter().filter(|cell| cell.run()).count()
    }

    /// Drop every queued deferred job without running it, as a crashed
    /// worker would. Their tasks complete with an error.
    #[cfg(test)]
    pub(crate) fn cancel_deferred(&self) -> usize {
        let Executor::Deferred(queue) = &self.executor else {
            return 0;
        };
        let cells = std::mem::take(&mut *lock(queue));
        cells.iter().filter(|cell| lock(&cell.job).take().is_some()).count()
    }
}

/// Handle to one in-flight generation job.
pub struct GenerationTask {
    coord: ChunkCoord,
    cell: Arc<TaskCell>,
    rx: Receiver<Box<[u8]>>,
    result: Option<Box<[u8]>>,
}

impl GenerationTask {
    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    /// Non-blocking completion check
    pub fn is_complete(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(voxels) => {
                self.result = Some(voxels);
                true
            }
            Err(TryRecvError::Empty) => false,
            // Sender dropped without a result; `complete` reports it.
            Err(TryRecvError::Disconnected) => true,
        }
    }

    /// Finish the task and take the volume back, running the job inline if
    /// no pool thread has picked it up yet.
    pub fn complete(mut self) -> Result<Box<[u8]>> {
        if let Some(voxels) = self.result.take() {
            return Ok(voxels);
        }
        self.cell.run();
        self.rx.recv().map_err(|_| {
            Error::Generation(format!("generation of {:?} ended without a volume", self.coord))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::chunk::VOXELS_PER_CHUNK;

    fn volume() -> Box<[u8]> {
        vec![0u8; VOXELS_PER_CHUNK].into_boxed_slice()
    }

    #[test]
    fn test_deferred_task_completes_after_run() {
        let pool = GenerationPool::deferred(5);
        let coord = ChunkCoord::new(1, 0, 1);
        let mut task = pool.schedule(coord, volume());

        assert!(!task.is_complete());
        assert_eq!(pool.run_deferred(), 1);
        assert!(task.is_complete());

        let voxels = task.complete().unwrap();
        assert_eq!(voxels, TerrainGenerator::new(5).generate(coord));
    }

    #[test]
    fn test_complete_runs_pending_job_inline() {
        let pool = GenerationPool::deferred(5);
        let task = pool.schedule(ChunkCoord::new(0, 0, 0), volume());

        let voxels = task.complete().unwrap();
        assert_eq!(voxels.len(), VOXELS_PER_CHUNK);
        assert_eq!(pool.run_deferred(), 0);
    }

    #[test]
    fn test_cancelled_job_reports_error() {
        let pool = GenerationPool::deferred(5);
        let mut task = pool.schedule(ChunkCoord::new(2, 0, 2), volume());

        assert_eq!(pool.cancel_deferred(), 1);
        assert!(task.is_complete());
        assert!(matches!(task.complete(), Err(Error::Generation(_))));
    }

    #[test]
    fn test_threaded_pool_generates() {
        let pool = GenerationPool::new(2, 11).unwrap();
        let tasks: Vec<_> = (0..4)
            .map(|i| pool.schedule(ChunkCoord::new(i, 0, -i), volume()))
            .collect();

        for task in tasks {
            let coord = task.coord();
            let voxels = task.complete().unwrap();
            assert_eq!(voxels, TerrainGenerator::new(11).generate(coord));
        }
    }
}
