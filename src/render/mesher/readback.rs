//! Asynchronous GPU to host transfers

use std::sync::mpsc::{self, Receiver, TryRecvError};

/// State of a pending readback
#[derive(Debug, PartialEq)]
pub enum ReadbackPoll {
    Pending,
    Ready(Vec<u8>),
    Failed(String),
}

/// A transfer the driver polls once per tick until it resolves.
pub trait Readback {
    /// Non-blocking. After `Ready` or `Failed` the handle is spent.
    fn poll(&mut self) -> ReadbackPoll;
}

pub type ReadbackHandle = Box<dyn Readback>;

/// Readback whose result is known up front (zero-sized requests, tests)
pub struct ResolvedReadback(Option<ReadbackPoll>);

impl ResolvedReadback {
    pub fn ready(bytes: Vec<u8>) -> Self {
        Self(Some(ReadbackPoll::Ready(bytes)))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self(Some(ReadbackPoll::Failed(reason.into())))
    }
}

impl Readback for ResolvedReadback {
    fn poll(&mut self) -> ReadbackPoll {
        self.0
            .take()
            .unwrap_or_else(|| ReadbackPoll::Failed("readback already consumed".into()))
    }
}

/// Smallest staging allocation; keeps early growth steps coarse.
const MIN_STAGING_BYTES: u64 = 256;

/// Capacity to allocate for a request of `requested` bytes on a staging
/// buffer currently holding `current` bytes, never above `limit` (the size of
/// the buffer being read). Returns `current` when the request fits.
pub fn staging_capacity_for(current: u64, requested: u64, limit: u64) -> u64 {
    if requested <= current {
        return current;
    }
    requested
        .next_power_of_two()
        .max(MIN_STAGING_BYTES)
        .min(limit)
        .max(requested)
}

/// Persistent MAP_READ buffer shared by every readback of one kind on one
/// worker. It grows to the largest request seen and is reused afterwards.
///
/// Only one handle per staging buffer may be alive: the previous handle must
/// be dropped before the next `read_from`, which releases any map it left
/// outstanding.
pub struct StagingBuffer {
    buffer: Option<wgpu::Buffer>,
    capacity: u64,
    label: String,
}

impl StagingBuffer {
    /// Empty staging buffer, allocated on first use
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            buffer: None,
            capacity: 0,
            label: label.into(),
        }
    }

    /// Staging buffer allocated up front
    pub fn with_capacity(device: &wgpu::Device, capacity: u64, label: impl Into<String>) -> Self {
        let mut staging = Self::new(label);
        staging.reserve(device, capacity, capacity);
        staging
    }

    /// Staging buffer able to hold `size` bytes, reallocated only on growth
    fn reserve(&mut self, device: &wgpu::Device, size: u64, limit: u64) -> wgpu::Buffer {
        let capacity = staging_capacity_for(self.capacity, size, limit);
        match &self.buffer {
            Some(buffer) if capacity == self.capacity => buffer.clone(),
            _ => {
                log::debug!("{}: staging {} -> {} bytes", self.label, self.capacity, capacity);
                let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&self.label),
                    size: capacity,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                self.capacity = capacity;
                self.buffer = Some(buffer.clone());
                buffer
            }
        }
    }

    /// Record and submit a copy of `source[..size]`, then map `..size` of the
    /// staging buffer. `size` must be a multiple of 4. The device must be
    /// polled (see `MeshWorker::maintain`) for the map callback to fire.
    pub fn read_from(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        source: &wgpu::Buffer,
        size: u64,
    ) -> ReadbackHandle {
        if size == 0 {
            return Box::new(ResolvedReadback::ready(Vec::new()));
        }
        let staging = self.reserve(device, size, source.size());

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_copy_encoder"),
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        queue.submit(Some(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging.slice(..size).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        Box::new(GpuReadback {
            staging,
            size,
            rx,
            done: false,
        })
    }
}

/// One mapped range of a `StagingBuffer`. Dropping it before it resolves
/// unmaps the buffer so the next copy into it is valid.
pub struct GpuReadback {
    staging: wgpu::Buffer,
    size: u64,
    rx: Receiver<Result<(), wgpu::BufferAsyncError>>,
    done: bool,
}

impl Readback for GpuReadback {
    fn poll(&mut self) -> ReadbackPoll {
        if self.done {
            return ReadbackPoll::Failed("readback already consumed".into());
        }
        match self.rx.try_recv() {
            Ok(Ok(())) => {
                self.done = true;
                let bytes = {
                    let data = self.staging.slice(..self.size).get_mapped_range();
                    data.to_vec()
                };
                self.staging.unmap();
                ReadbackPoll::Ready(bytes)
            }
            Ok(Err(e)) => {
                self.done = true;
                ReadbackPoll::Failed(e.to_string())
            }
            Err(TryRecvError::Empty) => ReadbackPoll::Pending,
            Err(TryRecvError::Disconnected) => {
                self.done = true;
                ReadbackPoll::Failed("map callback dropped".into())
            }
        }
    }
}

impl Drop for GpuReadback {
    fn drop(&mut self) {
        // Abandoned while the map was pending or mapped but unread
        if !self.done {
            self.staging.unmap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_readback_is_single_use() {
        let mut readback = ResolvedReadback::ready(vec![1, 2, 3]);
        assert_eq!(readback.poll(), ReadbackPoll::Ready(vec![1, 2, 3]));
        assert!(matches!(readback.poll(), ReadbackPoll::Failed(_)));
    }

    #[test]
    fn test_staging_capacity_grows_to_power_of_two() {
        let limit = u64::MAX;
        assert_eq!(staging_capacity_for(0, 8, limit), MIN_STAGING_BYTES);
        assert_eq!(staging_capacity_for(256, 200, limit), 256);
        assert_eq!(staging_capacity_for(256, 1000, limit), 1024);
        assert_eq!(staging_capacity_for(1024, 1024, limit), 1024);
        assert_eq!(staging_capacity_for(1024, 64 * 4096 + 64, limit), 512 * 1024);
    }

    #[test]
    fn test_staging_capacity_capped_by_source() {
        // Counters: 8 bytes requested from an 8 byte source
        assert_eq!(staging_capacity_for(0, 8, 8), 8);
        // Never below the request even if the source claims less
        assert_eq!(staging_capacity_for(0, 3000, 2048), 3000);
        assert_eq!(staging_capacity_for(0, 3000, 3500), 3500);
    }

    #[test]
    fn test_staging_reuse_keeps_capacity() {
        // A sequence of retries and smaller requests never reallocates
        let mut capacity = 0;
        let mut allocations = 0;
        for size in [4096u64, 4096, 4096, 1024, 64, 4096] {
            let next = staging_capacity_for(capacity, size, 1 << 20);
            if next != capacity {
                allocations += 1;
                capacity = next;
            }
        }
        assert_eq!(allocations, 1);
        assert_eq!(capacity, 4096);
    }

    #[test]
    fn test_failed_readback() {
        let mut readback = ResolvedReadback::failed("device lost");
        assert_eq!(readback.poll(), ReadbackPoll::Failed("device lost".into()));
    }
}
