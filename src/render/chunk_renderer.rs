//! Offscreen chunk drawing with one shared material

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::render::mesh::ChunkMesh;
use crate::voxel::chunk::ChunkCoord;

pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Receiver of finalized chunk meshes
pub trait ChunkDrawSink {
    /// Material scalar, updated once per tick
    fn set_atlas_tiles_per_row(&mut self, tiles: u32);

    /// Draw `mesh` translated to `origin`. `revision` changes whenever the
    /// chunk at `coord` gets a new mesh.
    fn draw_chunk(&mut self, coord: ChunkCoord, revision: u64, origin: Vec3, mesh: &ChunkMesh);
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct MaterialUniform {
    view_proj: [[f32; 4]; 4],
    atlas: [f32; 4],
    sun_dir: [f32; 4],
}

/// Per-chunk GPU copy of a mesh
struct GpuChunkMesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
    revision: u64,
    bind_group: wgpu::BindGroup,
}

/// Cached buffers are reused only for the exact mesh they were built from
fn needs_upload(cached: Option<u64>, revision: u64) -> bool {
    cached != Some(revision)
}

/// Draw statistics for one frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub chunks: usize,
    pub triangles: u64,
    pub resident: usize,
}

pub struct ChunkRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    chunk_layout: wgpu::BindGroupLayout,
    material: MaterialUniform,
    material_buffer: wgpu::Buffer,
    material_bind_group: wgpu::BindGroup,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    meshes: HashMap<ChunkCoord, GpuChunkMesh>,
    /// Chunks drawn since `begin_frame`
    frame: Vec<ChunkCoord>,
}

fn uniform_layout_entry() -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl ChunkRenderer {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, width: u32, height: u32) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("voxel_chunk_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/voxel_chunk.wgsl").into()),
        });

        let material_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("chunk_material_layout"),
            entries: &[uniform_layout_entry()],
        });
        let chunk_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("chunk_origin_layout"),
            entries: &[uniform_layout_entry()],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("chunk_pipeline_layout"),
            bind_group_layouts: &[&material_layout, &chunk_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("chunk_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[ChunkMesh::vertex_layout()],
                compilation_options: Default::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: COLOR_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            multiview_mask: None,
            cache: None,
        });

        let material = MaterialUniform {
            view_proj: Mat4::IDENTITY.to_cols_array_2d(),
            atlas: [16.0, 0.0, 0.0, 0.0],
            sun_dir: [0.0, 1.0, 0.0, 0.0],
        };
        let material_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("chunk_material_buffer"),
            size: std::mem::size_of::<MaterialUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let material_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("chunk_material_bind_group"),
            layout: &material_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: material_buffer.as_entire_binding(),
            }],
        });

        let target = |label: &str, format: wgpu::TextureFormat| {
            device
                .create_texture(&wgpu::TextureDescriptor {
                    label: Some(label),
                    size: wgpu::Extent3d {
                        width: width.max(1),
                        height: height.max(1),
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                })
                .create_view(&wgpu::TextureViewDescriptor::default())
        };
        let color_view = target("chunk_color_target", COLOR_FORMAT);
        let depth_view = target("chunk_depth_target", DEPTH_FORMAT);

        Self {
            device: device.clone(),
            queue: queue.clone(),
            pipeline,
            chunk_layout,
            material,
            material_buffer,
            material_bind_group,
            color_view,
            depth_view,
            meshes: HashMap::new(),
            frame: Vec::new(),
        }
    }

    /// Start collecting draws for a frame.
    pub fn begin_frame(&mut self, view_proj: Mat4, sun_direction: Vec3) {
        self.frame.clear();
        self.material.view_proj = view_proj.to_cols_array_2d();
        let sun = sun_direction.try_normalize().unwrap_or(Vec3::Y);
        self.material.sun_dir = [sun.x, sun.y, sun.z, 0.0];
    }

    /// Encode and submit the frame, then free meshes that were not drawn.
    pub fn end_frame(&mut self) -> FrameStats {
        self.queue
            .write_buffer(&self.material_buffer, 0, bytemuck::bytes_of(&self.material));

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("chunk_frame_encoder"),
        });
        let mut stats = FrameStats::default();
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("chunk_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.53,
                            g: 0.71,
                            b: 0.92,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.material_bind_group, &[]);
            for coord in &self.frame {
                let Some(mesh) = self.meshes.get(coord) else {
                    continue;
                };
                pass.set_bind_group(1, &mesh.bind_group, &[]);
                pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..mesh.index_count, 0, 0..1);
                stats.chunks += 1;
                stats.triangles += mesh.index_count as u64 / 3;
            }
        }
        self.queue.submit(Some(encoder.finish()));

        let drawn = &self.frame;
        self.meshes.retain(|coord, _| drawn.contains(coord));
        stats.resident = self.meshes.len();
        stats
    }

    fn upload(&self, origin: Vec3, mesh: &ChunkMesh, revision: u64) -> GpuChunkMesh {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);

        let vertex_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("chunk_vertex_buffer"),
            size: vertex_bytes.len() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let index_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("chunk_index_buffer"),
            size: index_bytes.len() as u64,
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let origin_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("chunk_origin_buffer"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&vertex_buffer, 0, vertex_bytes);
        self.queue.write_buffer(&index_buffer, 0, index_bytes);
        self.queue
            .write_buffer(&origin_buffer, 0, bytemuck::cast_slice(&[origin.x, origin.y, origin.z, 0.0]));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("chunk_origin_bind_group"),
            layout: &self.chunk_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: origin_buffer.as_entire_binding(),
            }],
        });

        GpuChunkMesh {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            revision,
            bind_group,
        }
    }

    /// Offscreen color target
    pub fn color_view(&self) -> &wgpu::TextureView {
        &self.color_view
    }
}

impl ChunkDrawSink for ChunkRenderer {
    fn set_atlas_tiles_per_row(&mut self, tiles: u32) {
        self.material.atlas[0] = tiles.max(1) as f32;
    }

    fn draw_chunk(&mut self, coord: ChunkCoord, revision: u64, origin: Vec3, mesh: &ChunkMesh) {
        if mesh.is_empty() {
            return;
        }
        if needs_upload(self.meshes.get(&coord).map(|gpu| gpu.revision), revision) {
            let gpu = self.upload(origin, mesh, revision);
            self.meshes.insert(coord, gpu);
        }
        self.frame.push(coord);
    }
}

/// Perspective view-projection looking from `eye` at `target`
pub fn view_projection(eye: Vec3, target: Vec3, aspect: f32) -> Mat4 {
    let proj = Mat4::perspective_rh(60f32.to_radians(), aspect.max(0.01), 0.1, 2000.0);
    proj * Mat4::look_at_rh(eye, target, Vec3::Y)
}
