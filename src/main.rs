//! Stratavox - headless streaming runner
//!
//! Flies a streaming anchor across the terrain, meshing chunks on the GPU and
//! drawing them offscreen.
//!
//! Usage: cargo run --release -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>   Streaming config JSON (default: built-in defaults)
//!   --blocks <PATH>   Block registry JSON (default: built-in blocks)
//!   --ticks <N>       Ticks to run (default: 600)
//!   --workers <N>     Override the mesh worker count
//!   --speed <M>       Anchor speed in voxels per tick (default: 2.0)
//!   --stats-json      Print final stats as JSON

use std::time::{Duration, Instant};

use glam::Vec3;

use stratavox::core::config::StreamingConfig;
use stratavox::core::logging;
use stratavox::render::chunk_renderer::{self, ChunkRenderer};
use stratavox::render::context::GpuContext;
use stratavox::streaming::{StreamingSubsystem, ViewAnchors};
use stratavox::voxel::block::BlockRegistry;
use stratavox::voxel::chunk::CHUNK_SIZE_Y;

const FRAME_WIDTH: u32 = 1280;
const FRAME_HEIGHT: u32 = 720;
const TICK_INTERVAL: Duration = Duration::from_millis(16);
const STATS_EVERY: u64 = 60;

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let ticks = parse_u64_arg(&args, "--ticks").unwrap_or(600);
    let speed = parse_f32_arg(&args, "--speed").unwrap_or(2.0);
    let stats_json = args.iter().any(|a| a == "--stats-json");

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => match StreamingConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => StreamingConfig::default(),
    };
    if let Some(workers) = parse_usize_arg(&args, "--workers") {
        config.worker_count = workers;
    }
    let sun = config.sun_direction();

    let gpu = match pollster::block_on(GpuContext::new_headless()) {
        Ok(gpu) => gpu,
        Err(e) => {
            log::error!("No GPU available: {}", e);
            std::process::exit(1);
        }
    };

    let mut streaming = StreamingSubsystem::start_gpu(&gpu, config);
    if let Some(path) = parse_str_arg(&args, "--blocks") {
        match BlockRegistry::load(&path) {
            Ok(registry) => {
                if let Some(driver) = streaming.driver_mut() {
                    driver.refresh_block_data(&registry);
                }
            }
            Err(e) => log::warn!("Ignoring block registry {}: {}", path, e),
        }
    }

    let mut renderer = ChunkRenderer::new(&gpu.device, &gpu.queue, FRAME_WIDTH, FRAME_HEIGHT);
    let aspect = FRAME_WIDTH as f32 / FRAME_HEIGHT as f32;
    let eye_height = CHUNK_SIZE_Y as f32 + 24.0;
    let started = Instant::now();

    for tick in 0..ticks {
        let tick_start = Instant::now();
        let anchor = Vec3::new(tick as f32 * speed, 0.0, 0.0);

        streaming.tick(&ViewAnchors::at(anchor), tick_start);

        let eye = anchor + Vec3::new(-48.0, eye_height, -48.0);
        let target = anchor + Vec3::new(32.0, CHUNK_SIZE_Y as f32 * 0.5, 32.0);
        renderer.begin_frame(chunk_renderer::view_projection(eye, target, aspect), sun);
        streaming.render(&mut renderer);
        let frame = renderer.end_frame();

        if tick % STATS_EVERY == 0 {
            log::info!(
                "tick {}: {} | drawn {} chunks, {} tris",
                tick,
                streaming.stats(),
                frame.chunks,
                frame.triangles
            );
        }

        if let Some(rest) = TICK_INTERVAL.checked_sub(tick_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    let stats = streaming.stats();
    log::info!("Finished {} ticks in {:.1?}: {}", ticks, started.elapsed(), stats);
    if stats_json {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to serialize stats: {}", e),
        }
    }
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
