//! The emulated GPU: engines, address space, syncpoints and the renderer behind them.

use crate::backend::GraphicsBackend;
use crate::config::EmulationConfig;
use crate::engines::{Fermi2D, Maxwell3D};
use crate::gpu_memory::{GpuMemoryConfig, MemoryManager};
use crate::master_semaphore::MasterSemaphore;
use crate::memory::Memory;
use crate::rasterizer::{FramebufferConfig, Rasterizer, RasterizerInterface};
use crate::scheduler::Scheduler;
use oxidinx_hw::specs::syncpoints::MAX_SYNCPOINTS;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// ================================================================================================
// Syncpoints
// ================================================================================================

/// Host1x syncpoint counters
pub struct Syncpoints {
    values: Mutex<[u32; MAX_SYNCPOINTS]>,
    changed: Condvar,
}

impl Syncpoints {
    pub fn new() -> Self {
        Self {
            values: Mutex::new([0; MAX_SYNCPOINTS]),
            changed: Condvar::new(),
        }
    }

    /// Panics when `id` is not a hardware syncpoint.
    pub fn increment(&self, id: u32) {
        let mut values = self.values.lock();
        let value = &mut values[Self::index(id)];
        *value = value.wrapping_add(1);
        trace!("Syncpoint {} -> {}", id, *value);
        self.changed.notify_all();
    }

    pub fn value(&self, id: u32) -> u32 {
        self.values.lock()[Self::index(id)]
    }

    /// Block until syncpoint `id` reaches `threshold`, returning false on timeout.
    pub fn wait_fence(&self, id: u32, threshold: u32, timeout: Duration) -> bool {
        let index = Self::index(id);
        let mut values = self.values.lock();
        // Wrapping compare: counters are free running
        let reached = |values: &[u32; MAX_SYNCPOINTS]| {
            values[index].wrapping_sub(threshold) as i32 >= 0
        };
        if reached(&*values) {
            return true;
        }
        let result = self
            .changed
            .wait_while_for(&mut values, |values| !reached(values), timeout);
        !result.timed_out() || reached(&*values)
    }

    fn index(id: u32) -> usize {
        assert!(
            (id as usize) < MAX_SYNCPOINTS,
            "Invalid syncpoint {id}"
        );
        id as usize
    }
}

impl Default for Syncpoints {
    fn default() -> Self {
        Self::new()
    }
}

// ================================================================================================
// GPU
// ================================================================================================

pub struct Gpu<B: GraphicsBackend> {
    config: EmulationConfig,
    backend: Arc<B>,
    memory: Arc<Memory>,
    memory_manager: Arc<MemoryManager>,
    maxwell3d: Arc<Maxwell3D>,
    fermi_2d: Mutex<Fermi2D>,
    syncpoints: Arc<Syncpoints>,
    scheduler: Arc<Scheduler<B>>,
    rasterizer: Arc<Rasterizer<B>>,
}

impl<B: GraphicsBackend> Gpu<B> {
    /// Build the GPU on top of `memory` and connect the renderer to it.
    pub fn new(
        config: EmulationConfig,
        backend: Arc<B>,
        memory: Arc<Memory>,
        gpu_memory_config: GpuMemoryConfig,
    ) -> Self {
        let memory_manager = Arc::new(MemoryManager::new(memory.clone(), gpu_memory_config));
        let master_semaphore = Arc::new(MasterSemaphore::new(backend.clone(), &config));
        let scheduler = Arc::new(Scheduler::new(backend.clone(), master_semaphore));
        let maxwell3d = Arc::new(Maxwell3D::new());
        let syncpoints = Arc::new(Syncpoints::new());
        let rasterizer = Rasterizer::new(
            config.clone(),
            scheduler.clone(),
            memory_manager.clone(),
            maxwell3d.clone(),
            syncpoints.clone(),
        );

        let weak: Weak<dyn RasterizerInterface> = Arc::downgrade(&rasterizer) as _;
        memory.bind_rasterizer(weak.clone());
        memory_manager.bind_rasterizer(weak);
        let mut fermi_2d = Fermi2D::new();
        fermi_2d.bind_rasterizer(rasterizer.clone());

        info!(
            "GPU ready (accuracy {:?}, async {})",
            config.accuracy, config.use_asynchronous_gpu_emulation
        );
        Self {
            config,
            backend,
            memory,
            memory_manager,
            maxwell3d,
            fermi_2d: Mutex::new(fermi_2d),
            syncpoints,
            scheduler,
            rasterizer,
        }
    }

    pub fn config(&self) -> &EmulationConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    pub fn maxwell3d(&self) -> &Arc<Maxwell3D> {
        &self.maxwell3d
    }

    pub fn rasterizer(&self) -> &Arc<Rasterizer<B>> {
        &self.rasterizer
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<B>> {
        &self.scheduler
    }

    pub fn syncpoints(&self) -> &Arc<Syncpoints> {
        &self.syncpoints
    }

    // --------------------------------------------------------------------------------------------
    // Command submission
    // --------------------------------------------------------------------------------------------

    /// Write one 2D engine register.
    pub fn call_method(&self, method: u32, value: u32, is_last_call: bool) {
        self.fermi_2d.lock().call_method(method, value, is_last_call);
    }

    pub fn call_multi_method(&self, method: u32, values: &[u32], methods_pending: u32) {
        self.fermi_2d
            .lock()
            .call_multi_method(method, values, methods_pending);
    }

    /// Read back one 2D engine register
    pub fn fermi_reg(&self, method: u32) -> u32 {
        self.fermi_2d.lock().reg(method)
    }

    /// End of a guest command list: release whatever the host has caught up with.
    pub fn on_command_list_end(&self) {
        self.rasterizer.release_fences();
        RasterizerInterface::flush_commands(self.rasterizer.as_ref());
    }

    pub fn flush_commands(&self) {
        RasterizerInterface::flush_commands(self.rasterizer.as_ref());
    }

    /// Submit everything and wait for the host to finish it.
    pub fn finish(&self) {
        self.scheduler.finish();
        self.rasterizer.release_fences();
    }

    pub fn tick_frame(&self) {
        self.rasterizer.tick_frame();
    }

    // --------------------------------------------------------------------------------------------
    // Syncpoints and semaphores
    // --------------------------------------------------------------------------------------------

    pub fn increment_sync_point(&self, id: u32) {
        self.syncpoints.increment(id);
    }

    pub fn syncpoint_value(&self, id: u32) -> u32 {
        self.syncpoints.value(id)
    }

    /// Release syncpoint `id` once all work recorded so far completes.
    pub fn signal_sync_point(&self, id: u32) {
        self.rasterizer.signal_sync_point(id);
    }

    /// Write `value` to `gpu_addr` once all work recorded so far completes.
    pub fn signal_semaphore(&self, gpu_addr: u64, value: u32) {
        self.rasterizer.signal_semaphore(gpu_addr, value);
    }

    // --------------------------------------------------------------------------------------------
    // Presentation
    // --------------------------------------------------------------------------------------------

    /// Present a guest framebuffer, preferring a cached render target over guest memory.
    pub fn swap_buffers(&self, framebuffer: &FramebufferConfig) {
        let framebuffer_addr = framebuffer.address + framebuffer.offset as u64;
        debug!(
            "Swap buffers at {:#x} ({}x{})",
            framebuffer_addr, framebuffer.width, framebuffer.height
        );
        if self
            .rasterizer
            .accelerate_display(framebuffer, framebuffer_addr, framebuffer.stride)
        {
            self.rasterizer.present();
        } else if self.memory.is_valid_virtual_address(framebuffer_addr) {
            self.rasterizer.present_from_guest(framebuffer, framebuffer_addr);
        } else {
            warn!("Framebuffer {:#x} is not mapped, nothing to present", framebuffer_addr);
        }
        self.tick_frame();
    }

    /// Alias used by the display service.
    pub fn flip(&self, framebuffer: &FramebufferConfig) {
        self.swap_buffers(framebuffer);
    }
}
