mod common;

use common::{CPU_BASE, GPU_BASE, copy_config, linear_surface, rect};
use nxemu::engines::Fermi2D;
use nxemu::engines::fermi_2d::Rect;
use nxemu::memory::PageType;
use nxemu::texture_cache::format::{PixelFormat, SurfaceTarget, SurfaceType};
use nxemu::texture_cache::surface_params::SurfaceParams;
use nxemu::trace::{self, TraceRunner};
use nxemu::{EmulationConfig, FramebufferConfig, GpuAccuracy, RasterizerInterface, TraceError};
use oxidinx_hw::mmio::fermi_2d::{operation, registers, surface};
use oxidinx_hw::specs::{framebuffer_format, render_target_format};

const SRC_SIZE: u32 = 64;
const DST_SIZE: u32 = 32;
const DST_OFFSET: u64 = 0x10_0000;

fn pattern(width: u32, height: u32) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| {
            let (x, y) = (i % width, i / width);
            [x as u8, y as u8, (x ^ y) as u8, 0xFF]
        })
        .collect()
}

fn program_surface(call: &mut dyn FnMut(u32, u32), base: u32, width: u32, height: u32, gpu_addr: u64) {
    call(base + surface::FORMAT, render_target_format::A8B8G8R8_UNORM);
    call(base + surface::LINEAR, 1);
    call(base + surface::DEPTH, 1);
    call(base + surface::PITCH, width * 4);
    call(base + surface::WIDTH, width);
    call(base + surface::HEIGHT, height);
    call(base + surface::ADDRESS_HIGH, (gpu_addr >> 32) as u32);
    call(base + surface::ADDRESS_LOW, gpu_addr as u32);
}

/// One-to-one corner-origin blit of a `width` x `height` destination rectangle.
fn program_blit(call: &mut dyn FnMut(u32, u32), width: u32, height: u32) {
    call(registers::OPERATION, operation::SRC_COPY);
    call(registers::BLIT_CONTROL, 1);
    call(registers::BLIT_DST_X, 0);
    call(registers::BLIT_DST_Y, 0);
    call(registers::BLIT_DST_WIDTH, width);
    call(registers::BLIT_DST_HEIGHT, height);
    call(registers::BLIT_DU_DX, 0);
    call(registers::BLIT_DU_DX + 1, 1);
    call(registers::BLIT_DV_DY, 0);
    call(registers::BLIT_DV_DY + 1, 1);
    call(registers::BLIT_SRC_X, 0);
    call(registers::BLIT_SRC_X + 1, 0);
    call(registers::BLIT_SRC_Y, 0);
    call(registers::BLIT_SRC_Y + 1, 0);
}

#[test]
fn blit_clips_to_smaller_destination() {
    let mut fermi = Fermi2D::new();
    {
        let mut call = |method, value| fermi.call_method(method, value, false);
        program_surface(&mut call, registers::SRC, SRC_SIZE, SRC_SIZE, GPU_BASE);
        program_surface(&mut call, registers::DST, DST_SIZE, DST_SIZE, GPU_BASE + DST_OFFSET);
    }
    let mut call = |method, value| fermi.call_method(method, value, false);
    program_blit(&mut call, SRC_SIZE, SRC_SIZE);

    let config = fermi.surface_copy_config();
    let expected = Rect {
        left: 0,
        top: 0,
        right: DST_SIZE,
        bottom: DST_SIZE,
    };
    assert_eq!(config.src_rect, expected);
    assert_eq!(config.dst_rect, expected);
}

#[test]
fn blit_and_flip_present_the_copied_pixels() {
    let (gpu, backend) = common::gpu(EmulationConfig::default());
    let pixels = pattern(SRC_SIZE, SRC_SIZE);
    gpu.memory().write_block(CPU_BASE, &pixels);

    let mut call = |method, value| gpu.call_method(method, value, false);
    program_surface(&mut call, registers::SRC, SRC_SIZE, SRC_SIZE, GPU_BASE);
    program_surface(&mut call, registers::DST, DST_SIZE, DST_SIZE, GPU_BASE + DST_OFFSET);
    program_blit(&mut call, SRC_SIZE, SRC_SIZE);
    assert_eq!(gpu.fermi_reg(registers::BLIT_DST_WIDTH), SRC_SIZE);

    let dst_cpu = CPU_BASE + DST_OFFSET;
    assert_eq!(gpu.memory().page_type(dst_cpu), PageType::RasterizerCachedMemory);

    let row = (DST_SIZE * 4) as usize;
    let expected: Vec<u8> = pixels
        .chunks((SRC_SIZE * 4) as usize)
        .take(DST_SIZE as usize)
        .flat_map(|line| line[..row].to_vec())
        .collect();

    gpu.flip(&FramebufferConfig {
        address: dst_cpu,
        width: DST_SIZE,
        height: DST_SIZE,
        stride: DST_SIZE,
        pixel_format: framebuffer_format::A8B8G8R8_UNORM,
        ..Default::default()
    });
    let stats = backend.stats();
    assert_eq!(stats.blits, 1);
    assert_eq!(stats.presents, 1);
    assert_eq!(stats.render_pass_violations, 0);
    assert_eq!(backend.last_presented(), Some(expected.clone()));

    // Reading the destination back flushes the blit result into guest memory
    let mut guest = vec![0u8; expected.len()];
    gpu.memory().read_block(dst_cpu, &mut guest);
    assert_eq!(guest, expected);
}

#[test]
fn semaphores_land_after_finish() {
    let (gpu, _backend) = common::gpu(EmulationConfig {
        use_asynchronous_gpu_emulation: true,
        ..Default::default()
    });
    let src = linear_surface(16, 16, GPU_BASE);
    let dst = linear_surface(16, 16, GPU_BASE + 0x1_0000);
    gpu.rasterizer()
        .accelerate_surface_copy(&src, &dst, &copy_config(rect(16, 16), rect(16, 16)));

    gpu.signal_semaphore(GPU_BASE + 0x8_0000, 0x77);
    gpu.signal_sync_point(9);
    gpu.finish();
    assert_eq!(gpu.memory_manager().read::<u32>(GPU_BASE + 0x8_0000), 0x77);
    assert_eq!(gpu.syncpoint_value(9), 1);
    assert_eq!(gpu.rasterizer().pending_fences(), 0);
}

// ================================================================================================
// Texture cache through the GPU
// ================================================================================================

fn rgba8(width: u32, height: u32, is_tiled: bool) -> SurfaceParams {
    SurfaceParams {
        is_tiled,
        srgb_conversion: false,
        is_layered: false,
        block_width: 0,
        block_height: 0,
        block_depth: 0,
        tile_width_spacing: 1,
        width,
        height,
        depth: 1,
        pitch: if is_tiled { 0 } else { width * 4 },
        num_levels: 1,
        emulated_levels: 1,
        pixel_format: PixelFormat::A8B8G8R8Unorm,
        surface_type: SurfaceType::ColorTexture,
        target: SurfaceTarget::Texture2D,
    }
}

#[test]
fn identical_request_hits_the_same_surface() {
    let (gpu, backend) = common::gpu(EmulationConfig::default());
    let cache = gpu.rasterizer().texture_cache();
    let params = rgba8(64, 64, true);

    let first = cache.get_surface(GPU_BASE, &params, true).unwrap();
    let images = backend.stats().uploads;
    let second = cache.get_surface(GPU_BASE, &params, true).unwrap();
    assert_eq!(first, second);
    assert_eq!(cache.arena_len(), 1);
    assert_eq!(backend.stats().uploads, images);
}

#[test]
fn incompatible_overlaps_collapse_to_one_surface() {
    let (gpu, _backend) = common::gpu(EmulationConfig::default());
    let cache = gpu.rasterizer().texture_cache();

    let tiled = cache.get_surface(GPU_BASE, &rgba8(64, 64, true), false).unwrap();
    let linear = cache
        .get_surface(GPU_BASE + 0x1000, &rgba8(64, 16, false), false)
        .unwrap();

    let mut candidate = rgba8(64, 64, true);
    candidate.pixel_format = PixelFormat::R16G16B16A16Float;
    let view = cache.get_surface(GPU_BASE, &candidate, false).unwrap();

    assert!(!cache.view_is_current(&tiled));
    assert!(!cache.view_is_current(&linear));
    assert!(cache.view_is_current(&view));
    assert_eq!(cache.surfaces_in_region(CPU_BASE, 0x10_0000), vec![view.surface]);
    assert_eq!(cache.registered_count(), 1);
}

#[test]
fn reloading_over_cached_pages_keeps_guest_data() {
    let (gpu, _backend) = common::gpu(EmulationConfig {
        accuracy: GpuAccuracy::Extreme,
        ..Default::default()
    });
    let cache = gpu.rasterizer().texture_cache();
    let pixels = pattern(32, 32);
    gpu.memory().write_block(CPU_BASE, &pixels);

    let first = cache.get_surface(GPU_BASE, &rgba8(32, 32, false), true).unwrap();
    assert_eq!(gpu.memory().page_type(CPU_BASE), PageType::RasterizerCachedMemory);

    // A tiled surface over the same cached pages flushes the old one and reloads under the cache lock
    let second = cache.get_surface(GPU_BASE, &rgba8(32, 32, true), true).unwrap();
    assert!(!cache.view_is_current(&first));
    assert!(cache.view_is_current(&second));

    let mut guest = vec![0u8; pixels.len()];
    gpu.memory().read_block(CPU_BASE, &mut guest);
    assert_eq!(guest, pixels);
}

#[test]
fn cpu_writes_invalidate_cached_surfaces() {
    let (gpu, _backend) = common::gpu(EmulationConfig::default());
    let cache = gpu.rasterizer().texture_cache();
    let view = cache.get_surface(GPU_BASE, &rgba8(32, 32, false), true).unwrap();
    assert_eq!(gpu.memory().page_type(CPU_BASE), PageType::RasterizerCachedMemory);

    gpu.memory().write32(CPU_BASE + 0x40, 0x1234_5678);
    assert!(!cache.view_is_current(&view));
    assert_eq!(gpu.memory().page_type(CPU_BASE), PageType::Memory);
    assert_eq!(gpu.memory().read32(CPU_BASE + 0x40), 0x1234_5678);
}

// ================================================================================================
// Trace replay
// ================================================================================================

const TRACE: &str = "
# 1 MB of guest memory visible to the GPU
map_cpu 0x100000 0x100000 0x80000000
map_gpu 0x100000 0x100000000 0x100000

write32 0x100000 0xdeadbeef
read32 0x100000
expect32 0x100000 0xdeadbeef
fill 0x101000 0x10 0xab
expect32 0x10100c 0xabababab

# Clear a tiled render target to red and read it back
rt 0 0x100010000 16 16 0xd5 1
clear 0xff0000ff
draw
finish
expect32 0x110000 0xff0000ff

semaphore 0x100080000 0x42
syncpoint 3
flush
tick_frame
expect32 0x180000 0x42
";

#[test]
fn trace_replays_to_completion() {
    let (gpu, backend) = common::gpu(EmulationConfig::default());
    let directives = trace::parse(TRACE).unwrap();
    let mut runner = TraceRunner::new(gpu);
    runner.run(&directives).unwrap();

    let stats = runner.stats();
    assert_eq!(stats.directives, directives.len());
    assert_eq!(stats.expectations, 4);
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.draws, 1);
    assert_eq!(runner.gpu().syncpoint_value(3), 1);
    assert_eq!(backend.stats().clears, 1);
    assert_eq!(backend.stats().render_pass_violations, 0);
}

#[test]
fn trace_reports_failures_with_line_numbers() {
    let (gpu, _backend) = common::gpu(EmulationConfig::default());
    let mut runner = TraceRunner::new(gpu);

    let directives = trace::parse("write32 0x100000 1\nexpect32 0x100000 2\n").unwrap();
    match runner.run(&directives) {
        Err(TraceError::Mismatch {
            line,
            expected,
            actual,
            ..
        }) => {
            assert_eq!((line, expected, actual), (2, 2, 1));
        }
        other => panic!("expected a mismatch, got {other:?}"),
    }

    // Semaphores need a mapped GPU address
    let directives = trace::parse("semaphore 0x900000000 1").unwrap();
    assert!(matches!(runner.run(&directives), Err(TraceError::Parse { line: 1, .. })));
}
