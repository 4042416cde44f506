//! Timeline tracking for submitted GPU work.
//!
//! Every submission is tagged with a tick. `current_tick` is the tick the next
//! submission will signal; `known_gpu_tick` caches the last completed tick read
//! back from the host, so most "is this resource free" checks never reach the
//! backend.

use crate::backend::GraphicsBackend;
use crate::config::EmulationConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Timeout of each poll made by the debug waiter thread
const DEBUG_WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Timeout of one blocking wait before it is logged and retried
const WAIT_SLICE: Duration = Duration::from_secs(1);

pub struct MasterSemaphore<B: GraphicsBackend> {
    backend: Arc<B>,
    gpu_tick: AtomicU64,
    current_tick: AtomicU64,
    shutdown: Arc<AtomicBool>,
    debug_thread: Option<JoinHandle<()>>,
}

impl<B: GraphicsBackend> MasterSemaphore<B> {
    pub fn new(backend: Arc<B>, config: &EmulationConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let debug_thread = if config.renderer_debug {
            spawn_debug_waiter(backend.clone(), shutdown.clone())
        } else {
            None
        };
        Self {
            backend,
            gpu_tick: AtomicU64::new(0),
            current_tick: AtomicU64::new(1),
            shutdown,
            debug_thread,
        }
    }

    /// Tick the next submission will signal
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Relaxed)
    }

    /// Last tick known to be complete, as of the last refresh
    pub fn known_gpu_tick(&self) -> u64 {
        self.gpu_tick.load(Ordering::Relaxed)
    }

    pub fn is_free(&self, tick: u64) -> bool {
        self.known_gpu_tick() >= tick
    }

    /// Advance the current tick, returning the tick that was current.
    pub fn next_tick(&self) -> u64 {
        self.current_tick.fetch_add(1, Ordering::Relaxed)
    }

    pub fn refresh(&self) {
        self.gpu_tick
            .fetch_max(self.backend.timeline_counter(), Ordering::Relaxed);
    }

    /// Block until `tick` has completed on the host.
    pub fn wait(&self, tick: u64) {
        if self.is_free(tick) {
            return;
        }
        self.refresh();
        if self.is_free(tick) {
            return;
        }
        trace!("Waiting for tick {}", tick);
        while !self.backend.wait_timeline(tick, WAIT_SLICE) {
            debug!(
                "Still waiting for tick {} (host at {})",
                tick,
                self.backend.timeline_counter()
            );
        }
        self.refresh();
    }
}

impl<B: GraphicsBackend> Drop for MasterSemaphore<B> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.debug_thread.take() {
            if thread.join().is_err() {
                error!("Semaphore debug thread panicked");
            }
        }
    }
}

/// Waits on every timeline value in turn so graphics debuggers observe each one.
fn spawn_debug_waiter<B: GraphicsBackend>(
    backend: Arc<B>,
    shutdown: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("nxemu:semaphore-debug".into())
        .spawn(move || {
            let mut counter = 0;
            while !shutdown.load(Ordering::Acquire) {
                if backend.wait_timeline(counter, DEBUG_WAIT_TIMEOUT) {
                    counter += 1;
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!("Failed to spawn semaphore debug thread: {}", err);
            None
        }
    }
}
