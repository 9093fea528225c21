//! wgpu mesh worker: voxel upload, staged greedy dispatches, sized readbacks

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::render::mesh::VERTEX_STRIDE_BYTES;
use crate::voxel::block::{BLOCK_FLAG_SOLID, FACES_PER_BLOCK, MAX_BLOCK_TYPES};
use crate::voxel::chunk::{
    ChunkCoord, CHUNK_SIZE_XZ, CHUNK_SIZE_Y, MAX_INDICES_PER_CHUNK, MAX_VERTICES_PER_CHUNK,
    VOXELS_PER_CHUNK,
};

use super::readback::{ReadbackHandle, StagingBuffer};
use super::worker::{GreedyStage, MeshParams, MeshWorker};

/// Uniform block of the mesher shader
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct MesherParams {
    pub chunk_coord: [i32; 4],
    /// xyz = toward the sun, w = shadow step length
    pub sun_dir: [f32; 4],
    /// size_xz, size_y, atlas tiles per row, shadow steps
    pub dims: [u32; 4],
    /// vertex capacity, index capacity
    pub limits: [u32; 4],
}

impl MesherParams {
    pub fn new(coord: ChunkCoord, params: &MeshParams) -> Self {
        let sun = params.sun_direction.try_normalize().unwrap_or(glam::Vec3::Y);
        Self {
            chunk_coord: [coord.x, coord.y, coord.z, 0],
            sun_dir: [sun.x, sun.y, sun.z, params.shadow_step_length],
            dims: [CHUNK_SIZE_XZ, CHUNK_SIZE_Y, params.atlas_tiles_per_row.max(1), params.shadow_steps],
            limits: [MAX_VERTICES_PER_CHUNK, MAX_INDICES_PER_CHUNK, 0, 0],
        }
    }
}

/// vertex and index counters, two u32
const COUNTER_BYTES: u64 = 2 * std::mem::size_of::<u32>() as u64;

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Compute pipelines for the six greedy stages, shared by every worker
pub struct MesherPipelines {
    bind_group_layout: wgpu::BindGroupLayout,
    stages: Vec<wgpu::ComputePipeline>,
}

impl MesherPipelines {
    pub fn new(device: &wgpu::Device) -> Arc<Self> {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("voxel_mesher_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../../shaders/voxel_mesher.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxel_mesher_layout"),
            entries: &[
                // Binding 0: per-chunk params
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Binding 1: voxels (one u32 per voxel)
                storage_entry(1, true),
                // Binding 2: visible face mask
                storage_entry(2, false),
                // Binding 3: vertex/index counters
                storage_entry(3, false),
                // Binding 4: vertex stream
                storage_entry(4, false),
                // Binding 5: index stream
                storage_entry(5, false),
                // Binding 6: face tile table
                storage_entry(6, true),
                // Binding 7: per-block flags
                storage_entry(7, true),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("voxel_mesher_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let stages = GreedyStage::ALL
            .iter()
            .map(|stage| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(stage.entry_point()),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some(stage.entry_point()),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .collect();

        Arc::new(Self {
            bind_group_layout,
            stages,
        })
    }
}

/// One GPU mesh worker. Buffers are sized for the worst-case chunk and
/// reused for every chunk bound to this worker.
pub struct GpuMeshWorker {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Arc<MesherPipelines>,
    params_buffer: wgpu::Buffer,
    voxel_buffer: wgpu::Buffer,
    counter_buffer: wgpu::Buffer,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    face_texture_buffer: wgpu::Buffer,
    block_flags_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    /// Reused host staging for the u8 -> u32 voxel widening
    upload_staging: Vec<u32>,
    /// Map-read copies of the counters and mesh streams, reused across
    /// chunks and retries
    counter_staging: StagingBuffer,
    vertex_staging: StagingBuffer,
    index_staging: StagingBuffer,
    label: String,
}

impl GpuMeshWorker {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        pipelines: Arc<MesherPipelines>,
        id: usize,
    ) -> Result<Self> {
        let voxel_bytes = (VOXELS_PER_CHUNK * std::mem::size_of::<u32>()) as u64;
        let vertex_bytes = MAX_VERTICES_PER_CHUNK as u64 * VERTEX_STRIDE_BYTES as u64;
        let index_bytes = MAX_INDICES_PER_CHUNK as u64 * std::mem::size_of::<u32>() as u64;
        let face_texture_bytes = (MAX_BLOCK_TYPES * FACES_PER_BLOCK * std::mem::size_of::<u32>()) as u64;
        let block_flags_bytes = (MAX_BLOCK_TYPES * std::mem::size_of::<u32>()) as u64;
        let counter_bytes = COUNTER_BYTES;

        let limits = device.limits();
        let max_binding = limits.max_storage_buffer_binding_size as u64;
        if vertex_bytes > max_binding || vertex_bytes > limits.max_buffer_size {
            return Err(Error::Gpu(format!(
                "mesh worker needs a {}MB vertex buffer, device allows {}MB",
                vertex_bytes / 1024 / 1024,
                max_binding.min(limits.max_buffer_size) / 1024 / 1024
            )));
        }

        let label = format!("mesh_worker_{}", id);
        let storage = |name: &str, size: u64, extra: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{}_{}", label, name)),
                size,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{}_params", label)),
            size: std::mem::size_of::<MesherParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let voxel_buffer = storage("voxels", voxel_bytes, wgpu::BufferUsages::COPY_DST);
        let face_mask_buffer = storage("face_mask", voxel_bytes, wgpu::BufferUsages::empty());
        let counter_buffer = storage(
            "counters",
            counter_bytes,
            wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );
        let vertex_buffer = storage("vertices", vertex_bytes, wgpu::BufferUsages::COPY_SRC);
        let index_buffer = storage("indices", index_bytes, wgpu::BufferUsages::COPY_SRC);
        let face_texture_buffer = storage("face_textures", face_texture_bytes, wgpu::BufferUsages::COPY_DST);
        let block_flags_buffer = storage("block_flags", block_flags_bytes, wgpu::BufferUsages::COPY_DST);
        queue.write_buffer(
            &block_flags_buffer,
            0,
            bytemuck::cast_slice(&[BLOCK_FLAG_SOLID; MAX_BLOCK_TYPES]),
        );

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{}_bind_group", label)),
            layout: &pipelines.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: voxel_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: face_mask_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: counter_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: vertex_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: index_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: face_texture_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 7, resource: block_flags_buffer.as_entire_binding() },
            ],
        });

        log::debug!(
            "Created {}: {}MB vertices, {}MB indices",
            label,
            vertex_bytes / 1024 / 1024,
            index_bytes / 1024 / 1024
        );

        Ok(Self {
            device: device.clone(),
            queue: queue.clone(),
            pipelines,
            params_buffer,
            voxel_buffer,
            counter_buffer,
            vertex_buffer,
            index_buffer,
            face_texture_buffer,
            block_flags_buffer,
            bind_group,
            upload_staging: vec![0u32; VOXELS_PER_CHUNK],
            counter_staging: StagingBuffer::with_capacity(
                device,
                counter_bytes,
                format!("{}_counter_staging", label),
            ),
            vertex_staging: StagingBuffer::new(format!("{}_vertex_staging", label)),
            index_staging: StagingBuffer::new(format!("{}_index_staging", label)),
            label,
        })
    }
}

impl MeshWorker for GpuMeshWorker {
    fn upload(&mut self, voxels: &[u8]) {
        if self.upload_staging.len() != voxels.len() {
            self.upload_staging.resize(voxels.len(), 0);
        }
        for (dst, &src) in self.upload_staging.iter_mut().zip(voxels) {
            *dst = src as u32;
        }
        self.queue
            .write_buffer(&self.voxel_buffer, 0, bytemuck::cast_slice(&self.upload_staging));
    }

    fn prepare_for_chunk(&mut self, coord: ChunkCoord, params: &MeshParams) {
        let uniforms = MesherParams::new(coord, params);
        self.queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&uniforms));
        self.queue
            .write_buffer(&self.counter_buffer, 0, bytemuck::cast_slice(&[0u32, 0u32]));
    }

    fn dispatch_greedy_stage(&mut self, stage: GreedyStage) {
        let Some(pipeline) = self.pipelines.stages.get(stage.index() as usize) else {
            return;
        };
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("greedy_stage_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(stage.entry_point()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(stage.workgroups(), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        log::trace!("{}: dispatched {:?}", self.label, stage);
    }

    fn request_counters(&mut self) -> ReadbackHandle {
        self.counter_staging
            .read_from(&self.device, &self.queue, &self.counter_buffer, COUNTER_BYTES)
    }

    fn request_mesh_data(&mut self, vertex_count: u32, index_count: u32) -> (ReadbackHandle, ReadbackHandle) {
        let vertices = self.vertex_staging.read_from(
            &self.device,
            &self.queue,
            &self.vertex_buffer,
            vertex_count as u64 * VERTEX_STRIDE_BYTES as u64,
        );
        let indices = self.index_staging.read_from(
            &self.device,
            &self.queue,
            &self.index_buffer,
            index_count as u64 * std::mem::size_of::<u32>() as u64,
        );
        (vertices, indices)
    }

    fn set_face_textures(&mut self, table: &[u32]) {
        let len = table.len().min(MAX_BLOCK_TYPES * FACES_PER_BLOCK);
        if len > 0 {
            self.queue
                .write_buffer(&self.face_texture_buffer, 0, bytemuck::cast_slice(&table[..len]));
        }
    }

    fn set_block_flags(&mut self, flags: &[u32]) {
        let mut table = [BLOCK_FLAG_SOLID; MAX_BLOCK_TYPES];
        let len = flags.len().min(MAX_BLOCK_TYPES);
        table[..len].copy_from_slice(&flags[..len]);
        self.queue
            .write_buffer(&self.block_flags_buffer, 0, bytemuck::cast_slice(&table));
    }

    fn maintain(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }
}
