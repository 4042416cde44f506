//! Command recording and submission.
//!
//! Work is recorded as closures into fixed-budget chunks. A full chunk is
//! handed to a single worker thread that replays it into the current host
//! command buffer, so recording never waits on execution. `flush` seals the
//! command buffer and submits it tagged with the next tick; `finish` also
//! waits for that tick to complete.
//!
//! Chunks execute strictly in the order they were dispatched.

use crate::backend::{GraphicsBackend, RenderPassKey};
use crate::master_semaphore::MasterSemaphore;
use crate::resource_pool::CommandPool;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, error_span, instrument, trace};

/// Byte budget of one command chunk
pub const CHUNK_SIZE: usize = 0x8000;

/// Bookkeeping charged per recorded command on top of its captures
const COMMAND_HEADER_SIZE: usize = 2 * size_of::<usize>();

type Command<B> = Box<dyn FnOnce(&B, <B as GraphicsBackend>::CommandBuffer) + Send>;

// ================================================================================================
// Command chunks
// ================================================================================================

struct CommandChunk<B: GraphicsBackend> {
    commands: Vec<Command<B>>,
    command_offset: usize,
}

impl<B: GraphicsBackend> CommandChunk<B> {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            command_offset: 0,
        }
    }

    /// Append `command`, handing it back if the chunk has no room left.
    fn record<F>(&mut self, command: F) -> Result<(), F>
    where
        F: FnOnce(&B, B::CommandBuffer) + Send + 'static,
    {
        let size = COMMAND_HEADER_SIZE + size_of::<F>();
        if self.command_offset + size > CHUNK_SIZE {
            return Err(command);
        }
        self.command_offset += size;
        self.commands.push(Box::new(command));
        Ok(())
    }

    fn execute_all(&mut self, backend: &B, cmdbuf: B::CommandBuffer) {
        for command in self.commands.drain(..) {
            command(backend, cmdbuf);
        }
        self.command_offset = 0;
    }

    fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// ================================================================================================
// Worker
// ================================================================================================

struct WorkQueue<B: GraphicsBackend> {
    chunks: VecDeque<Box<CommandChunk<B>>>,
    /// The worker is replaying a chunk it already popped
    busy: bool,
    quit: bool,
    /// A recorded command panicked and the worker is gone
    panicked: bool,
    /// Command buffer chunks are replayed into
    cmdbuf: B::CommandBuffer,
}

struct WorkerShared<B: GraphicsBackend> {
    queue: Mutex<WorkQueue<B>>,
    work_cv: Condvar,
    idle_cv: Condvar,
    reserve: Mutex<Vec<Box<CommandChunk<B>>>>,
}

/// Releases waiters if the worker unwinds out of a recorded command.
struct PanicGuard<'a, B: GraphicsBackend> {
    shared: &'a WorkerShared<B>,
}

impl<B: GraphicsBackend> Drop for PanicGuard<'_, B> {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut queue = self.shared.queue.lock();
            queue.busy = false;
            queue.panicked = true;
            self.shared.idle_cv.notify_all();
        }
    }
}

fn worker_thread<B: GraphicsBackend>(backend: Arc<B>, shared: Arc<WorkerShared<B>>) {
    let span = error_span!("scheduler_worker");
    let _enter = span.enter();
    debug!("Scheduler worker started");
    let _guard = PanicGuard { shared: &shared };

    let mut queue = shared.queue.lock();
    loop {
        shared
            .work_cv
            .wait_while(&mut queue, |queue| queue.chunks.is_empty() && !queue.quit);
        if queue.quit {
            break;
        }
        let Some(mut chunk) = queue.chunks.pop_front() else {
            continue;
        };
        queue.busy = true;
        let cmdbuf = queue.cmdbuf;

        drop(queue);
        trace!("Executing {} recorded commands", chunk.commands.len());
        chunk.execute_all(&backend, cmdbuf);
        shared.reserve.lock().push(chunk);
        queue = shared.queue.lock();

        queue.busy = false;
        if queue.chunks.is_empty() {
            shared.idle_cv.notify_all();
        }
    }
    debug!("Scheduler worker stopped");
}

// ================================================================================================
// Scheduler
// ================================================================================================

#[derive(Debug, Default)]
struct RenderState {
    renderpass: Option<RenderPassKey>,
    graphics_pipeline: Option<u64>,
}

struct SchedulerState<B: GraphicsBackend> {
    chunk: Box<CommandChunk<B>>,
    command_pool: CommandPool<B>,
    render: RenderState,
}

pub struct Scheduler<B: GraphicsBackend> {
    backend: Arc<B>,
    master_semaphore: Arc<MasterSemaphore<B>>,
    state: Mutex<SchedulerState<B>>,
    shared: Arc<WorkerShared<B>>,
    worker: Option<JoinHandle<()>>,
}

impl<B: GraphicsBackend> Scheduler<B> {
    /// Open the first command buffer and start the worker.
    ///
    /// Panics if the worker thread cannot be spawned.
    pub fn new(backend: Arc<B>, master_semaphore: Arc<MasterSemaphore<B>>) -> Self {
        let mut command_pool = CommandPool::new(master_semaphore.clone(), backend.clone());
        let cmdbuf = command_pool.commit();
        backend.begin_command_buffer(cmdbuf);

        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(WorkQueue {
                chunks: VecDeque::new(),
                busy: false,
                quit: false,
                panicked: false,
                cmdbuf,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            reserve: Mutex::new(Vec::new()),
        });
        let worker = {
            let backend = backend.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name("nxemu:scheduler".into())
                .spawn(move || worker_thread(backend, shared))
                .unwrap_or_else(|err| panic!("Failed to spawn scheduler worker: {err}"))
        };

        Self {
            backend,
            master_semaphore,
            state: Mutex::new(SchedulerState {
                chunk: Box::new(CommandChunk::new()),
                command_pool,
                render: RenderState::default(),
            }),
            shared,
            worker: Some(worker),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn master_semaphore(&self) -> &Arc<MasterSemaphore<B>> {
        &self.master_semaphore
    }

    /// Record `command` for execution on the worker.
    pub fn record<F>(&self, command: F)
    where
        F: FnOnce(&B, B::CommandBuffer) + Send + 'static,
    {
        let mut state = self.state.lock();
        self.record_locked(&mut state, command);
    }

    fn record_locked<F>(&self, state: &mut SchedulerState<B>, command: F)
    where
        F: FnOnce(&B, B::CommandBuffer) + Send + 'static,
    {
        const {
            assert!(
                COMMAND_HEADER_SIZE + size_of::<F>() <= CHUNK_SIZE,
                "recorded command does not fit in a command chunk"
            )
        };
        let Err(command) = state.chunk.record(command) else {
            return;
        };
        self.dispatch_work_locked(state);
        if state.chunk.record(command).is_err() {
            unreachable!("a fresh chunk always fits one command");
        }
    }

    /// Hand the current chunk to the worker.
    pub fn dispatch_work(&self) {
        let mut state = self.state.lock();
        self.dispatch_work_locked(&mut state);
    }

    fn dispatch_work_locked(&self, state: &mut SchedulerState<B>) {
        if state.chunk.is_empty() {
            return;
        }
        let fresh = self.acquire_new_chunk();
        let chunk = std::mem::replace(&mut state.chunk, fresh);
        self.shared.queue.lock().chunks.push_back(chunk);
        self.shared.work_cv.notify_all();
    }

    fn acquire_new_chunk(&self) -> Box<CommandChunk<B>> {
        self.shared
            .reserve
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(CommandChunk::new()))
    }

    /// Block until the worker has replayed everything recorded so far.
    pub fn wait_worker(&self) {
        let mut state = self.state.lock();
        self.wait_worker_locked(&mut state);
    }

    fn wait_worker_locked(&self, state: &mut SchedulerState<B>) {
        self.dispatch_work_locked(state);
        let mut queue = self.shared.queue.lock();
        self.shared.idle_cv.wait_while(&mut queue, |queue| {
            (!queue.chunks.is_empty() || queue.busy) && !queue.panicked
        });
        if queue.panicked {
            panic!("Scheduler worker panicked while executing recorded commands");
        }
    }

    /// Submit everything recorded so far without waiting for it.
    #[instrument(level = "trace", skip(self))]
    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.submit_execution(&mut state);
        self.allocate_new_context(&mut state);
    }

    /// Submit everything recorded so far and wait for the host to finish it.
    #[instrument(level = "trace", skip(self))]
    pub fn finish(&self) {
        let mut state = self.state.lock();
        let presubmit_tick = self.current_tick();
        self.submit_execution(&mut state);
        self.master_semaphore.wait(presubmit_tick);
        self.allocate_new_context(&mut state);
    }

    pub fn current_tick(&self) -> u64 {
        self.master_semaphore.current_tick()
    }

    pub fn is_free(&self, tick: u64) -> bool {
        self.master_semaphore.is_free(tick)
    }

    /// Block until `tick` completes, submitting first if it has not been yet.
    pub fn wait(&self, tick: u64) {
        if tick >= self.current_tick() {
            self.flush();
        }
        self.master_semaphore.wait(tick);
    }

    // --------------------------------------------------------------------------------------------
    // Render pass and pipeline state
    // --------------------------------------------------------------------------------------------

    /// Make sure a render pass with `key` is open, ending any other.
    pub fn request_renderpass(&self, key: RenderPassKey) {
        let mut state = self.state.lock();
        if state.render.renderpass == Some(key) {
            return;
        }
        self.end_render_pass(&mut state);
        state.render.renderpass = Some(key);
        self.record_locked(&mut state, move |backend: &B, cmdbuf| {
            backend.cmd_begin_render_pass(cmdbuf, &key)
        });
    }

    /// Make sure no render pass is open.
    pub fn request_outside_render_pass_operation_context(&self) {
        let mut state = self.state.lock();
        self.end_render_pass(&mut state);
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.state.lock().render.renderpass.is_some()
    }

    pub fn bind_graphics_pipeline(&self, pipeline: u64) {
        let mut state = self.state.lock();
        if state.render.graphics_pipeline == Some(pipeline) {
            return;
        }
        state.render.graphics_pipeline = Some(pipeline);
        self.record_locked(&mut state, move |backend: &B, cmdbuf| {
            backend.cmd_bind_pipeline(cmdbuf, pipeline)
        });
    }

    /// Forget cached bindings; the next command buffer starts from scratch.
    pub fn invalidate_state(&self) {
        self.state.lock().render.graphics_pipeline = None;
    }

    fn end_render_pass(&self, state: &mut SchedulerState<B>) {
        if state.render.renderpass.take().is_none() {
            return;
        }
        self.record_locked(state, |backend: &B, cmdbuf| backend.cmd_end_render_pass(cmdbuf));
    }

    // --------------------------------------------------------------------------------------------
    // Submission
    // --------------------------------------------------------------------------------------------

    fn submit_execution(&self, state: &mut SchedulerState<B>) {
        self.end_render_pass(state);
        state.render.graphics_pipeline = None;
        self.wait_worker_locked(state);

        let cmdbuf = self.shared.queue.lock().cmdbuf;
        self.backend.end_command_buffer(cmdbuf);

        let signal_value = self.master_semaphore.next_tick();
        let wait_value = signal_value - 1;
        trace!("Submitting tick {}", signal_value);
        if let Err(err) = self.backend.submit(cmdbuf, wait_value, signal_value) {
            error!("Queue submission of tick {} failed: {}", signal_value, err);
            panic!("Graphics queue submission failed: {err}");
        }
    }

    fn allocate_new_context(&self, state: &mut SchedulerState<B>) {
        let cmdbuf = state.command_pool.commit();
        self.backend.begin_command_buffer(cmdbuf);
        self.shared.queue.lock().cmdbuf = cmdbuf;
    }
}

impl<B: GraphicsBackend> Drop for Scheduler<B> {
    fn drop(&mut self) {
        self.shared.queue.lock().quit = true;
        self.shared.work_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Scheduler worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::config::EmulationConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler() -> (Arc<SoftwareBackend>, Scheduler<SoftwareBackend>) {
        let backend = Arc::new(SoftwareBackend::new());
        let semaphore = Arc::new(MasterSemaphore::new(
            backend.clone(),
            &EmulationConfig::default(),
        ));
        (backend.clone(), Scheduler::new(backend, semaphore))
    }

    #[test]
    fn test_commands_run_in_order() {
        let (_backend, scheduler) = scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5000 {
            let log = log.clone();
            scheduler.record(move |_: &SoftwareBackend, _| log.lock().push(i));
        }
        scheduler.wait_worker();
        let log = log.lock();
        assert_eq!(log.len(), 5000);
        assert!(log.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_full_chunk_is_dispatched() {
        let (_backend, scheduler) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let per_chunk = CHUNK_SIZE / (COMMAND_HEADER_SIZE + size_of::<Arc<AtomicUsize>>());
        for _ in 0..per_chunk + 1 {
            let counter = counter.clone();
            scheduler.record(move |_: &SoftwareBackend, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // The first chunk went to the worker without an explicit dispatch
        let mut queue = scheduler.shared.queue.lock();
        scheduler
            .shared
            .idle_cv
            .wait_while(&mut queue, |queue| !queue.chunks.is_empty() || queue.busy);
        drop(queue);
        assert_eq!(counter.load(Ordering::SeqCst), per_chunk);
    }

    #[test]
    fn test_finish_completes_tick() {
        let (backend, scheduler) = scheduler();
        let tick = scheduler.current_tick();
        scheduler.finish();
        assert!(scheduler.is_free(tick));
        assert_eq!(scheduler.current_tick(), tick + 1);
        assert_eq!(backend.stats().submissions, 1);
    }

    #[test]
    fn test_render_pass_closed_before_submit() {
        let (backend, scheduler) = scheduler();
        let key = RenderPassKey {
            width: 16,
            height: 16,
            ..Default::default()
        };
        scheduler.request_renderpass(key);
        scheduler.request_renderpass(key);
        assert!(scheduler.is_in_render_pass());
        scheduler.record(|backend: &SoftwareBackend, cmdbuf| backend.cmd_draw(cmdbuf, 3, 1));
        scheduler.finish();

        assert!(!scheduler.is_in_render_pass());
        let stats = backend.stats();
        assert_eq!(stats.render_passes, 1);
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.render_pass_violations, 0);
    }

    #[test]
    fn test_pipeline_binds_are_deduplicated() {
        let (backend, scheduler) = scheduler();
        scheduler.bind_graphics_pipeline(1);
        scheduler.bind_graphics_pipeline(1);
        scheduler.bind_graphics_pipeline(2);
        scheduler.invalidate_state();
        scheduler.bind_graphics_pipeline(2);
        scheduler.wait_worker();
        assert_eq!(backend.stats().pipeline_binds, 3);
    }

    #[test]
    fn test_worker_panic_reaches_the_caller() {
        let (_backend, scheduler) = scheduler();
        let (sender, receiver) = std::sync::mpsc::channel();
        thread::spawn(move || {
            scheduler.record(|_: &SoftwareBackend, _| panic!("device lost"));
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| scheduler.finish()));
            let _ = sender.send(result.is_err());
        });
        let panicked = receiver
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("finish blocked after the worker died");
        assert!(panicked);
    }

    #[test]
    #[should_panic(expected = "Graphics queue submission failed")]
    fn test_device_loss_is_fatal() {
        let (backend, scheduler) = scheduler();
        backend.set_device_lost();
        scheduler.flush();
    }
}
