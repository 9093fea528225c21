use criterion::{criterion_group, criterion_main, Criterion, black_box};

use glam::IVec2;

use stratavox::generation::TerrainGenerator;
use stratavox::render::mesh::{ChunkMesh, VERTEX_STRIDE_BYTES};
use stratavox::streaming::SpiralIndexer;
use stratavox::voxel::block::BlockRegistry;
use stratavox::voxel::chunk::{ChunkCoord, VOXELS_PER_CHUNK};

fn bench_spiral_build_r8(c: &mut Criterion) {
    c.bench_function("spiral_build_r8", |b| {
        b.iter(|| {
            let mut spiral = SpiralIndexer::new();
            spiral.ensure(black_box(8));
            spiral
        });
    });
}

fn bench_spiral_build_r32(c: &mut Criterion) {
    c.bench_function("spiral_build_r32", |b| {
        b.iter(|| {
            let mut spiral = SpiralIndexer::new();
            spiral.ensure(black_box(32));
            spiral
        });
    });
}

fn bench_spiral_priority_lookup(c: &mut Criterion) {
    let mut spiral = SpiralIndexer::new();
    spiral.ensure(16);

    c.bench_function("spiral_priority_lookup", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for z in -20..=20 {
                for x in -20..=20 {
                    sum = sum.wrapping_add(spiral.priority_of(black_box(IVec2::new(x, z))));
                }
            }
            sum
        });
    });
}

fn bench_terrain_fill_chunk(c: &mut Criterion) {
    let generator = TerrainGenerator::new(1337);
    let mut voxels = vec![0u8; VOXELS_PER_CHUNK];

    c.bench_function("terrain_fill_chunk", |b| {
        b.iter(|| {
            generator.fill_chunk(black_box(ChunkCoord::new(3, 0, -7)), &mut voxels);
        });
    });
}

fn bench_face_texture_table(c: &mut Criterion) {
    let registry = BlockRegistry::default();

    c.bench_function("face_texture_table", |b| {
        b.iter(|| black_box(&registry).face_texture_indices());
    });
}

fn bench_mesh_from_readback(c: &mut Criterion) {
    let quads = 4096usize;
    let vertex_bytes = vec![0u8; quads * 4 * VERTEX_STRIDE_BYTES];
    let index_bytes: Vec<u8> = (0..quads as u32 * 6)
        .flat_map(|i| i.to_le_bytes())
        .collect();

    c.bench_function("mesh_from_readback_4k_quads", |b| {
        b.iter(|| ChunkMesh::from_readback(black_box(&vertex_bytes), black_box(&index_bytes)));
    });
}

criterion_group!(
    benches,
    bench_spiral_build_r8,
    bench_spiral_build_r32,
    bench_spiral_priority_lookup,
    bench_terrain_fill_chunk,
    bench_face_texture_table,
    bench_mesh_from_readback,
);
criterion_main!(benches);
