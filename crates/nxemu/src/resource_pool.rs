//! Rings of reusable host resources guarded by completion ticks.

use crate::backend::GraphicsBackend;
use crate::master_semaphore::MasterSemaphore;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Command buffers added each time the command pool runs dry
pub const COMMAND_BUFFER_POOL_SIZE: usize = 0x1000;

/// Slot bookkeeping shared by every pool.
///
/// Each slot remembers the tick of the submission that last used it; a slot
/// is handed out again only once the master semaphore reports that tick
/// complete. When every slot is busy the pool grows instead of blocking.
pub struct ResourcePool<B: GraphicsBackend> {
    master_semaphore: Arc<MasterSemaphore<B>>,
    grow_step: usize,
    hint_iterator: usize,
    ticks: Vec<u64>,
}

impl<B: GraphicsBackend> ResourcePool<B> {
    pub fn new(master_semaphore: Arc<MasterSemaphore<B>>, grow_step: usize) -> Self {
        assert!(grow_step > 0, "resource pools must grow by at least one slot");
        Self {
            master_semaphore,
            grow_step,
            hint_iterator: 0,
            ticks: Vec::new(),
        }
    }

    /// Claim a free slot for the current tick.
    ///
    /// `allocate` is called with the range of new slots whenever the pool grows.
    pub fn commit_resource(&mut self, allocate: impl FnOnce(Range<usize>)) -> usize {
        self.master_semaphore.refresh();

        let found = match self.search(self.hint_iterator, self.ticks.len()) {
            Some(index) => index,
            None => match self.search(0, self.hint_iterator) {
                Some(index) => index,
                None => {
                    let index = self.manage_overflow(allocate);
                    self.ticks[index] = self.master_semaphore.current_tick();
                    index
                }
            },
        };
        self.hint_iterator = (found + 1) % self.ticks.len();
        found
    }

    pub fn capacity(&self) -> usize {
        self.ticks.len()
    }

    /// Tick the slot was last committed at
    pub fn tick_of(&self, index: usize) -> u64 {
        self.ticks[index]
    }

    fn search(&mut self, begin: usize, end: usize) -> Option<usize> {
        let index = (begin..end).find(|&i| self.master_semaphore.is_free(self.ticks[i]))?;
        self.ticks[index] = self.master_semaphore.current_tick();
        Some(index)
    }

    /// Grow the pool, returning the first new slot.
    fn manage_overflow(&mut self, allocate: impl FnOnce(Range<usize>)) -> usize {
        let old_capacity = self.ticks.len();
        let new_capacity = old_capacity + self.grow_step;
        debug!("Growing resource pool to {} slots", new_capacity);
        self.ticks.resize(new_capacity, 0);
        allocate(old_capacity..new_capacity);
        old_capacity
    }
}

/// Command buffers for the scheduler, one per submission in flight
pub struct CommandPool<B: GraphicsBackend> {
    pool: ResourcePool<B>,
    backend: Arc<B>,
    command_buffers: Vec<B::CommandBuffer>,
}

impl<B: GraphicsBackend> CommandPool<B> {
    pub fn new(master_semaphore: Arc<MasterSemaphore<B>>, backend: Arc<B>) -> Self {
        Self {
            pool: ResourcePool::new(master_semaphore, COMMAND_BUFFER_POOL_SIZE),
            backend,
            command_buffers: Vec::new(),
        }
    }

    /// A command buffer no in-flight submission is using
    pub fn commit(&mut self) -> B::CommandBuffer {
        let backend = &self.backend;
        let command_buffers = &mut self.command_buffers;
        let index = self.pool.commit_resource(|range| {
            command_buffers.extend(backend.allocate_command_buffers(range.len()));
        });
        self.command_buffers[index]
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::config::EmulationConfig;

    fn semaphore() -> (Arc<SoftwareBackend>, Arc<MasterSemaphore<SoftwareBackend>>) {
        let backend = Arc::new(SoftwareBackend::new());
        let semaphore = Arc::new(MasterSemaphore::new(
            backend.clone(),
            &EmulationConfig::default(),
        ));
        (backend, semaphore)
    }

    #[test]
    fn test_busy_slots_force_growth() {
        let (_backend, semaphore) = semaphore();
        let mut pool = ResourcePool::new(semaphore, 2);
        let mut grown = Vec::new();

        assert_eq!(pool.commit_resource(|range| grown.push(range)), 0);
        // Slot 0 now waits on tick 1, which never completes here
        assert_eq!(pool.commit_resource(|range| grown.push(range)), 1);
        assert_eq!(pool.commit_resource(|range| grown.push(range)), 2);
        assert_eq!(grown, vec![0..2, 2..4]);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_completed_slots_are_reused() {
        let (backend, semaphore) = semaphore();
        let mut pool = ResourcePool::new(semaphore.clone(), 2);
        assert_eq!(pool.commit_resource(|_| {}), 0);
        assert_eq!(pool.commit_resource(|_| {}), 1);

        let cmdbuf = backend.allocate_command_buffers(1)[0];
        backend.submit(cmdbuf, 0, semaphore.next_tick()).unwrap();

        // The hint wrapped to 0; both slots were tagged with the completed tick
        assert_eq!(pool.commit_resource(|_| panic!("pool should not grow")), 0);
        assert_eq!(pool.tick_of(0), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_command_pool_allocates_in_chunks() {
        let (backend, semaphore) = semaphore();
        let mut pool = CommandPool::new(semaphore, backend);
        let first = pool.commit();
        let second = pool.commit();
        assert_ne!(first, second);
        assert_eq!(pool.capacity(), COMMAND_BUFFER_POOL_SIZE);
    }
}
