//! Deferred guest semaphore and syncpoint releases.
//!
//! With asynchronous GPU emulation a guest-visible signal must not become
//! visible before the host has executed the work recorded ahead of it. Each
//! signal is queued as a [`Fence`] behind a host event and released in order
//! once that event fires. Fences that have no pending flush are stubbed and
//! release as soon as they reach the front of the queue.

use crate::backend::GraphicsBackend;
use crate::gpu::Syncpoints;
use crate::gpu_memory::MemoryManager;
use crate::scheduler::Scheduler;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// The texture cache and command stream operations a fence depends on
pub trait FenceHost {
    fn flush_commands(&self);
    fn sync_guest_host(&self);
    fn has_uncommitted_flushes(&self) -> bool;
    fn should_wait_async_flushes(&self) -> bool;
    fn commit_async_flushes(&self);
    fn pop_async_flushes(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Write `payload` to this GPU address
    Semaphore(u64),
    /// Increment syncpoint `payload`
    SyncPoint,
}

pub struct Fence<B: GraphicsBackend> {
    kind: FenceKind,
    payload: u32,
    stubbed: bool,
    event: Option<B::Event>,
    tick: u64,
}

impl<B: GraphicsBackend> Fence<B> {
    pub fn kind(&self) -> FenceKind {
        self.kind
    }

    pub fn payload(&self) -> u32 {
        self.payload
    }

    pub fn is_stubbed(&self) -> bool {
        self.stubbed
    }
}

pub struct FenceManager<B: GraphicsBackend> {
    fences: VecDeque<Fence<B>>,
    scheduler: Arc<Scheduler<B>>,
    memory_manager: Arc<MemoryManager>,
    syncpoints: Arc<Syncpoints>,
}

impl<B: GraphicsBackend> FenceManager<B> {
    pub fn new(
        scheduler: Arc<Scheduler<B>>,
        memory_manager: Arc<MemoryManager>,
        syncpoints: Arc<Syncpoints>,
    ) -> Self {
        Self {
            fences: VecDeque::new(),
            scheduler,
            memory_manager,
            syncpoints,
        }
    }

    pub fn signal_semaphore(&mut self, host: &dyn FenceHost, addr: u64, value: u32) {
        self.signal(host, FenceKind::Semaphore(addr), value);
    }

    pub fn signal_sync_point(&mut self, host: &dyn FenceHost, id: u32) {
        self.signal(host, FenceKind::SyncPoint, id);
    }

    fn signal(&mut self, host: &dyn FenceHost, kind: FenceKind, payload: u32) {
        self.try_release_pending_fences(host);
        let should_flush = host.has_uncommitted_flushes();
        host.commit_async_flushes();
        let fence = self.create_fence(kind, payload, !should_flush);
        self.fences.push_back(fence);
        if should_flush {
            host.flush_commands();
        }
        host.sync_guest_host();
    }

    fn create_fence(&self, kind: FenceKind, payload: u32, stubbed: bool) -> Fence<B> {
        let mut fence = Fence {
            kind,
            payload,
            stubbed,
            event: None,
            tick: 0,
        };
        if !stubbed {
            let event = self.scheduler.backend().create_event();
            fence.tick = self.scheduler.current_tick();
            self.scheduler.request_outside_render_pass_operation_context();
            let signaled = event.clone();
            self.scheduler
                .record(move |backend: &B, cmdbuf| backend.cmd_set_event(cmdbuf, &signaled));
            fence.event = Some(event);
        }
        trace!("Queued {:?} fence (stubbed={})", kind, stubbed);
        fence
    }

    /// Release every fence at the front of the queue the host has passed.
    pub fn try_release_pending_fences(&mut self, host: &dyn FenceHost) {
        while let Some(front) = self.fences.front() {
            if self.should_wait(host) && !self.is_signaled(front) {
                return;
            }
            self.pop_async_flushes(host);
            if let Some(fence) = self.fences.pop_front() {
                self.release(&fence);
            }
        }
    }

    /// Block until every queued fence has released.
    pub fn wait_pending_fences(&mut self, host: &dyn FenceHost) {
        while let Some(front) = self.fences.front() {
            if self.should_wait(host) {
                self.wait_fence(front);
            }
            self.pop_async_flushes(host);
            if let Some(fence) = self.fences.pop_front() {
                self.release(&fence);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.fences.len()
    }

    pub fn fences(&self) -> impl Iterator<Item = &Fence<B>> {
        self.fences.iter()
    }

    fn is_signaled(&self, fence: &Fence<B>) -> bool {
        if fence.stubbed {
            return true;
        }
        let Some(event) = &fence.event else {
            return true;
        };
        self.scheduler.is_free(fence.tick) && self.scheduler.backend().event_is_set(event)
    }

    fn wait_fence(&self, fence: &Fence<B>) {
        if !fence.stubbed {
            self.scheduler.wait(fence.tick);
        }
    }

    fn release(&self, fence: &Fence<B>) {
        match fence.kind {
            FenceKind::Semaphore(addr) => {
                trace!("Releasing semaphore {:#x} = {:#x}", addr, fence.payload);
                self.memory_manager.write::<u32>(addr, fence.payload);
            }
            FenceKind::SyncPoint => {
                self.syncpoints.increment(fence.payload);
            }
        }
    }

    fn should_wait(&self, host: &dyn FenceHost) -> bool {
        host.should_wait_async_flushes()
    }

    fn pop_async_flushes(&self, host: &dyn FenceHost) {
        host.pop_async_flushes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::config::EmulationConfig;
    use crate::gpu_memory::GpuMemoryConfig;
    use crate::master_semaphore::MasterSemaphore;
    use crate::memory::{DeviceMemory, Memory};
    use oxidinx_hw::memory_map::dram;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const GPU_BASE: u64 = 0x1_0000_0000;
    const CPU_BASE: u64 = 0x10_0000;

    #[derive(Default)]
    struct MockHost {
        uncommitted: AtomicBool,
        wait_flushes: AtomicBool,
        flushes: AtomicU32,
        syncs: AtomicU32,
        pops: AtomicU32,
    }

    impl FenceHost for MockHost {
        fn flush_commands(&self) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
        fn sync_guest_host(&self) {
            self.syncs.fetch_add(1, Ordering::Relaxed);
        }
        fn has_uncommitted_flushes(&self) -> bool {
            self.uncommitted.load(Ordering::Relaxed)
        }
        fn should_wait_async_flushes(&self) -> bool {
            self.wait_flushes.load(Ordering::Relaxed)
        }
        fn commit_async_flushes(&self) {
            if self.uncommitted.swap(false, Ordering::Relaxed) {
                self.wait_flushes.store(true, Ordering::Relaxed);
            }
        }
        fn pop_async_flushes(&self) {
            self.pops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn manager() -> (
        FenceManager<SoftwareBackend>,
        Arc<MemoryManager>,
        Arc<Syncpoints>,
        Arc<Scheduler<SoftwareBackend>>,
    ) {
        let device = Arc::new(DeviceMemory::new(0x10_0000));
        let memory = Arc::new(Memory::new(device, 32));
        memory.map_memory_region(CPU_BASE, 0x10_0000, dram::BASE).unwrap();
        let config = GpuMemoryConfig {
            address_space_bits: 36,
            ..GpuMemoryConfig::default()
        };
        let memory_manager = Arc::new(MemoryManager::new(memory, config));
        memory_manager.map(CPU_BASE, GPU_BASE, 0x10_0000).unwrap();

        let backend = Arc::new(SoftwareBackend::new());
        let semaphore = Arc::new(MasterSemaphore::new(backend.clone(), &EmulationConfig::default()));
        let scheduler = Arc::new(Scheduler::new(backend, semaphore));
        let syncpoints = Arc::new(Syncpoints::new());
        let manager = FenceManager::new(scheduler.clone(), memory_manager.clone(), syncpoints.clone());
        (manager, memory_manager, syncpoints, scheduler)
    }

    #[test]
    fn test_stubbed_fences_release_in_order() {
        let (mut manager, memory_manager, syncpoints, _scheduler) = manager();
        let host = MockHost::default();

        manager.signal_semaphore(&host, GPU_BASE + 0x40, 0xCAFE);
        assert_eq!(manager.pending(), 1);
        assert_eq!(memory_manager.read::<u32>(GPU_BASE + 0x40), 0);

        // Signalling again releases what came before
        manager.signal_sync_point(&host, 3);
        assert_eq!(manager.pending(), 1);
        assert!(manager.fences().all(Fence::is_stubbed));
        assert_eq!(memory_manager.read::<u32>(GPU_BASE + 0x40), 0xCAFE);
        assert_eq!(syncpoints.value(3), 0);
        assert_eq!(host.flushes.load(Ordering::Relaxed), 0);
        assert_eq!(host.syncs.load(Ordering::Relaxed), 2);

        manager.try_release_pending_fences(&host);
        assert_eq!(manager.pending(), 0);
        assert_eq!(syncpoints.value(3), 1);
    }

    #[test]
    fn test_pending_flush_creates_real_fence() {
        let (mut manager, memory_manager, _syncpoints, scheduler) = manager();
        let host = MockHost::default();
        host.uncommitted.store(true, Ordering::Relaxed);

        manager.signal_semaphore(&host, GPU_BASE, 7);
        assert_eq!(manager.pending(), 1);
        assert!(!manager.fences().next().unwrap().is_stubbed());
        assert_eq!(host.flushes.load(Ordering::Relaxed), 1);

        // Nothing submitted the event yet
        manager.try_release_pending_fences(&host);
        assert_eq!(manager.pending(), 1);
        assert_eq!(memory_manager.read::<u32>(GPU_BASE), 0);

        scheduler.flush();
        manager.wait_pending_fences(&host);
        assert_eq!(manager.pending(), 0);
        assert_eq!(memory_manager.read::<u32>(GPU_BASE), 7);
        assert!(host.pops.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_wait_submits_unflushed_work() {
        let (mut manager, _memory_manager, syncpoints, _scheduler) = manager();
        let host = MockHost::default();
        host.uncommitted.store(true, Ordering::Relaxed);
        manager.signal_sync_point(&host, 0);

        // The mock host never flushes; waiting has to submit the tick itself
        manager.wait_pending_fences(&host);
        assert_eq!(syncpoints.value(0), 1);
    }
}
