mod common;

use common::{CPU_BASE, GPU_BASE, copy_config, linear_surface, rect};
use nxemu::backend::{GraphicsBackend, RenderPassKey};
use nxemu::engines::maxwell_3d::{ClearBuffers, RenderTargetConfig};
use nxemu::master_semaphore::MasterSemaphore;
use nxemu::resource_pool::ResourcePool;
use nxemu::scheduler::Scheduler;
use nxemu::texture_cache::format::PixelFormat;
use nxemu::{EmulationConfig, FramebufferConfig, RasterizerInterface, SoftwareBackend};
use oxidinx_hw::specs::{framebuffer_format, render_target_format};
use proptest::prelude::*;
use std::sync::Arc;

fn key(width: u32) -> RenderPassKey {
    let mut key = RenderPassKey {
        width,
        height: width,
        ..Default::default()
    };
    key.color_formats[0] = Some(PixelFormat::A8B8G8R8Unorm);
    key
}

#[test]
fn ticks_advance_with_each_flush() {
    let backend = Arc::new(SoftwareBackend::new());
    let semaphore = Arc::new(MasterSemaphore::new(backend.clone(), &EmulationConfig::default()));
    let scheduler = Scheduler::new(backend.clone(), semaphore);

    let first = scheduler.current_tick();
    assert!(!scheduler.is_free(first));
    scheduler.flush();
    let second = scheduler.current_tick();
    assert_eq!(second, first + 1);

    scheduler.wait(first);
    assert!(scheduler.is_free(first));
    // Waiting on the open tick submits it
    scheduler.wait(second);
    assert!(scheduler.is_free(second));
    assert_eq!(backend.stats().submissions, 2);
}

#[test]
fn recorded_work_runs_in_order() {
    let backend = Arc::new(SoftwareBackend::new());
    let semaphore = Arc::new(MasterSemaphore::new(backend.clone(), &EmulationConfig::default()));
    let scheduler = Scheduler::new(backend.clone(), semaphore);
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for i in 0..64u32 {
        let order = order.clone();
        scheduler.record(move |_: &SoftwareBackend, _| order.lock().push(i));
        if i % 10 == 0 {
            scheduler.dispatch_work();
        }
    }
    scheduler.finish();
    assert_eq!(*order.lock(), (0..64).collect::<Vec<_>>());
}

// ================================================================================================
// Properties
// ================================================================================================

#[derive(Debug, Clone)]
enum PoolOp {
    Commit,
    Submit,
    Refresh,
}

#[derive(Debug, Clone)]
enum SchedulerOp {
    Draw(u32),
    Dispatch,
    SetEvent,
    Pipeline(u64),
    DispatchWork,
    Flush,
    Finish,
}

#[derive(Debug, Clone)]
enum GpuOp {
    Draw,
    Clear,
    Blit,
    CpuWrite(u64),
    Semaphore(u32),
    Flush,
    Flip,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_pool_never_reuses_busy_slots(
        ops in proptest::collection::vec(
            prop_oneof![
                3 => Just(PoolOp::Commit),
                2 => Just(PoolOp::Submit),
                1 => Just(PoolOp::Refresh),
            ],
            1..128,
        ),
        grow_step in 1usize..6,
    ) {
        let backend = Arc::new(SoftwareBackend::new());
        let semaphore = Arc::new(MasterSemaphore::new(backend.clone(), &EmulationConfig::default()));
        let mut pool = ResourcePool::new(semaphore.clone(), grow_step);
        let cmdbuf = backend.allocate_command_buffers(1)[0];

        for op in ops {
            match op {
                PoolOp::Commit => {
                    let before: Vec<u64> = (0..pool.capacity()).map(|i| pool.tick_of(i)).collect();
                    let index = pool.commit_resource(|_| {});
                    if let Some(&tagged) = before.get(index) {
                        prop_assert!(
                            semaphore.is_free(tagged),
                            "slot {} reused at tick {} while tick {} is outstanding",
                            index,
                            semaphore.known_gpu_tick(),
                            tagged
                        );
                    }
                    prop_assert_eq!(pool.tick_of(index), semaphore.current_tick());
                }
                PoolOp::Submit => {
                    let tick = semaphore.next_tick();
                    backend.submit(cmdbuf, 0, tick).unwrap();
                }
                PoolOp::Refresh => semaphore.refresh(),
            }
            prop_assert!(semaphore.known_gpu_tick() < semaphore.current_tick());
        }
    }

    #[test]
    fn prop_scheduler_keeps_render_pass_discipline(
        ops in proptest::collection::vec(
            prop_oneof![
                4 => (1u32..4).prop_map(|w| SchedulerOp::Draw(w * 16)),
                1 => Just(SchedulerOp::Dispatch),
                1 => Just(SchedulerOp::SetEvent),
                1 => (0u64..3).prop_map(SchedulerOp::Pipeline),
                1 => Just(SchedulerOp::DispatchWork),
                1 => Just(SchedulerOp::Flush),
                1 => Just(SchedulerOp::Finish),
            ],
            1..96,
        ),
    ) {
        let backend = Arc::new(SoftwareBackend::new());
        let semaphore = Arc::new(MasterSemaphore::new(backend.clone(), &EmulationConfig::default()));
        let scheduler = Scheduler::new(backend.clone(), semaphore);

        for op in ops {
            match op {
                SchedulerOp::Draw(width) => {
                    scheduler.request_renderpass(key(width));
                    prop_assert!(scheduler.is_in_render_pass());
                    scheduler.record(|backend: &SoftwareBackend, cmdbuf| backend.cmd_draw(cmdbuf, 3, 1));
                }
                SchedulerOp::Dispatch => {
                    scheduler.request_outside_render_pass_operation_context();
                    prop_assert!(!scheduler.is_in_render_pass());
                    scheduler.record(|backend: &SoftwareBackend, cmdbuf| backend.cmd_dispatch(cmdbuf, 0));
                }
                SchedulerOp::SetEvent => {
                    let event = scheduler.backend().create_event();
                    scheduler.request_outside_render_pass_operation_context();
                    scheduler.record(move |backend: &SoftwareBackend, cmdbuf| {
                        backend.cmd_set_event(cmdbuf, &event)
                    });
                }
                SchedulerOp::Pipeline(pipeline) => scheduler.bind_graphics_pipeline(pipeline),
                SchedulerOp::DispatchWork => scheduler.dispatch_work(),
                SchedulerOp::Flush => scheduler.flush(),
                SchedulerOp::Finish => scheduler.finish(),
            }
        }
        scheduler.finish();
        prop_assert_eq!(backend.stats().render_pass_violations, 0);
        prop_assert!(!backend.is_in_render_pass());
    }

    #[test]
    fn prop_gpu_work_keeps_render_pass_discipline(
        ops in proptest::collection::vec(
            prop_oneof![
                3 => Just(GpuOp::Draw),
                2 => Just(GpuOp::Clear),
                2 => Just(GpuOp::Blit),
                1 => (0u64..0x8000).prop_map(|offset| GpuOp::CpuWrite(offset & !3)),
                1 => any::<u32>().prop_map(GpuOp::Semaphore),
                1 => Just(GpuOp::Flush),
                1 => Just(GpuOp::Flip),
            ],
            1..48,
        ),
        async_gpu in any::<bool>(),
    ) {
        let (gpu, backend) = common::gpu(EmulationConfig {
            use_asynchronous_gpu_emulation: async_gpu,
            ..Default::default()
        });
        gpu.maxwell3d().set_render_target_count(1);
        gpu.maxwell3d().set_render_target(
            0,
            RenderTargetConfig {
                address: GPU_BASE,
                width: 32,
                height: 32,
                format: render_target_format::A8B8G8R8_UNORM,
                is_tiled: true,
                layers: 1,
                ..Default::default()
            },
        );
        gpu.maxwell3d().regs().clear_buffers = ClearBuffers {
            color_mask: 0xF,
            ..Default::default()
        };
        let semaphore_addr = GPU_BASE + 0x1F_0000;
        let mut last_semaphore = None;

        for op in ops {
            match op {
                GpuOp::Draw => gpu.rasterizer().draw(false, false),
                GpuOp::Clear => gpu.rasterizer().clear(),
                GpuOp::Blit => {
                    let src = linear_surface(16, 16, GPU_BASE + 0x10_0000);
                    let dst = linear_surface(16, 16, GPU_BASE + 0x11_0000);
                    gpu.rasterizer()
                        .accelerate_surface_copy(&src, &dst, &copy_config(rect(16, 16), rect(16, 16)));
                }
                GpuOp::CpuWrite(offset) => gpu.memory().write32(CPU_BASE + offset, 0xAAAA_5555),
                GpuOp::Semaphore(value) => {
                    gpu.signal_semaphore(semaphore_addr, value);
                    last_semaphore = Some(value);
                }
                GpuOp::Flush => gpu.flush_commands(),
                GpuOp::Flip => gpu.flip(&FramebufferConfig {
                    address: CPU_BASE,
                    width: 32,
                    height: 32,
                    stride: 32,
                    pixel_format: framebuffer_format::A8B8G8R8_UNORM,
                    ..Default::default()
                }),
            }
        }
        gpu.finish();
        prop_assert_eq!(backend.stats().render_pass_violations, 0);
        prop_assert!(!backend.is_in_render_pass());
        prop_assert_eq!(gpu.rasterizer().pending_fences(), 0);
        if let Some(value) = last_semaphore {
            prop_assert_eq!(gpu.memory_manager().read::<u32>(semaphore_addr), value);
        }
    }
}
