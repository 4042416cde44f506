//! Entry point from the GPU engines and the memory core into the host renderer.

use crate::backend::{GraphicsBackend, RenderPassKey};
use crate::config::EmulationConfig;
use crate::engines::fermi_2d;
use crate::engines::maxwell_3d::Maxwell3D;
use crate::fence_manager::{FenceHost, FenceManager};
use crate::gpu::Syncpoints;
use crate::gpu_memory::MemoryManager;
use crate::memory::{PAGE_BITS, PAGE_SIZE};
use crate::scheduler::Scheduler;
use crate::texture_cache::TextureCache;
use crate::texture_cache::format::{PixelFormat, SurfaceTarget};
use crate::texture_cache::surface_params::SurfaceParams;
use oxidinx_hw::specs::render_targets::NUM_COLOR;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Draws between scheduler flushes
const DRAWS_TO_DISPATCH: u32 = 4096;

/// Callbacks the engines and the memory core make into the renderer.
///
/// Addresses passed to the region methods are CPU virtual addresses.
pub trait RasterizerInterface: Send + Sync {
    fn draw(&self, is_indexed: bool, is_instanced: bool);

    /// Clear the attachments selected by the 3D engine's clear registers.
    fn clear(&self);

    fn dispatch_compute(&self, code_addr: u64);

    /// Write `value` to the GPU address `addr` once preceding work completes.
    fn signal_semaphore(&self, addr: u64, value: u32);

    /// Increment syncpoint `value` once preceding work completes.
    fn signal_sync_point(&self, value: u32);

    fn release_fences(&self);

    fn flush_all(&self);

    /// Write host-modified data in the range back to guest memory.
    fn flush_region(&self, addr: u64, size: u64);

    fn must_flush_region(&self, addr: u64, size: u64) -> bool;

    /// Drop cached copies of the range; the guest rewrote it.
    fn invalidate_region(&self, addr: u64, size: u64);

    /// Note a CPU write; invalidation is deferred to [`Self::sync_guest_host`].
    fn on_cpu_write(&self, addr: u64, size: u64);

    fn sync_guest_host(&self);

    fn flush_and_invalidate_region(&self, addr: u64, size: u64);

    fn wait_for_idle(&self);

    fn flush_commands(&self);

    fn tick_frame(&self);

    /// Run a 2D engine blit on the host, returning whether it was handled.
    fn accelerate_surface_copy(
        &self,
        _src: &fermi_2d::Surface,
        _dst: &fermi_2d::Surface,
        _config: &fermi_2d::Config,
    ) -> bool {
        false
    }

    /// Present a framebuffer that is already a host surface.
    fn accelerate_display(
        &self,
        _config: &FramebufferConfig,
        _framebuffer_addr: u64,
        _pixel_stride: u32,
    ) -> bool {
        false
    }

    /// Adjust the number of cached surfaces covering each page in the range.
    fn update_pages_cached_count(&self, _addr: u64, _size: u64, _delta: i32) {}
}

/// A guest framebuffer handed to the display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferConfig {
    /// CPU virtual address of the buffer
    pub address: u64,
    pub offset: u32,
    pub width: u32,
    pub height: u32,
    /// Row length in pixels
    pub stride: u32,
    /// Display format code, see `oxidinx_hw::specs::framebuffer_format`
    pub pixel_format: u32,
}

/// The image the next present shows
struct ScreenInfo<B: GraphicsBackend> {
    image: Option<B::Image>,
    width: u32,
    height: u32,
    is_srgb: bool,
}

pub struct Rasterizer<B: GraphicsBackend> {
    config: EmulationConfig,
    backend: Arc<B>,
    scheduler: Arc<Scheduler<B>>,
    memory_manager: Arc<MemoryManager>,
    maxwell3d: Arc<Maxwell3D>,
    texture_cache: TextureCache<B>,
    fence_manager: Mutex<FenceManager<B>>,
    /// Cached surfaces per CPU page
    cached_pages: Mutex<BTreeMap<u64, i32>>,
    draw_counter: AtomicU32,
    screen_info: Mutex<ScreenInfo<B>>,
}

impl<B: GraphicsBackend> Rasterizer<B> {
    pub fn new(
        config: EmulationConfig,
        scheduler: Arc<Scheduler<B>>,
        memory_manager: Arc<MemoryManager>,
        maxwell3d: Arc<Maxwell3D>,
        syncpoints: Arc<Syncpoints>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let rasterizer: Weak<dyn RasterizerInterface> = weak.clone();
            let texture_cache = TextureCache::new(
                config.clone(),
                scheduler.clone(),
                memory_manager.clone(),
                maxwell3d.clone(),
                rasterizer,
            );
            let fence_manager =
                FenceManager::new(scheduler.clone(), memory_manager.clone(), syncpoints);
            Self {
                backend: scheduler.backend().clone(),
                config,
                scheduler,
                memory_manager,
                maxwell3d,
                texture_cache,
                fence_manager: Mutex::new(fence_manager),
                cached_pages: Mutex::new(BTreeMap::new()),
                draw_counter: AtomicU32::new(0),
                screen_info: Mutex::new(ScreenInfo {
                    image: None,
                    width: 0,
                    height: 0,
                    is_srgb: false,
                }),
            }
        })
    }

    pub fn texture_cache(&self) -> &TextureCache<B> {
        &self.texture_cache
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<B>> {
        &self.scheduler
    }

    /// Pending guest fences
    pub fn pending_fences(&self) -> usize {
        self.fence_manager.lock().pending()
    }

    /// Pages currently marked as cached
    pub fn cached_page_count(&self) -> usize {
        self.cached_pages.lock().len()
    }

    /// Dimensions of the image the next present shows
    pub fn screen_size(&self) -> Option<(u32, u32)> {
        let screen = self.screen_info.lock();
        screen.image.as_ref().map(|_| (screen.width, screen.height))
    }

    pub fn screen_is_srgb(&self) -> bool {
        self.screen_info.lock().is_srgb
    }

    /// Finish outstanding work and show the screen image.
    pub fn present(&self) {
        let image = self.screen_info.lock().image.clone();
        let Some(image) = image else {
            warn!("Present requested with no screen image");
            return;
        };
        self.scheduler.finish();
        self.backend.present(&image);
    }

    /// Upload a framebuffer straight from guest memory and show it.
    pub fn present_from_guest(&self, config: &FramebufferConfig, framebuffer_addr: u64) {
        let pixel_format = PixelFormat::from_framebuffer_format(config.pixel_format);
        let bpp = pixel_format.bytes_per_pixel();
        let params = SurfaceParams {
            is_tiled: false,
            srgb_conversion: false,
            is_layered: false,
            block_width: 0,
            block_height: 0,
            block_depth: 0,
            tile_width_spacing: 0,
            width: config.width,
            height: config.height,
            depth: 1,
            pitch: config.stride * bpp,
            num_levels: 1,
            emulated_levels: 1,
            pixel_format,
            surface_type: pixel_format.surface_type(),
            target: SurfaceTarget::Texture2D,
        };
        let row_size = (config.width * bpp) as usize;
        let mut guest = vec![0u8; params.pitch as usize * config.height as usize];
        self.memory_manager.memory().read_block(framebuffer_addr, &mut guest);
        let mut host = Vec::with_capacity(row_size * config.height as usize);
        for row in guest.chunks(params.pitch.max(1) as usize) {
            host.extend_from_slice(&row[..row_size.min(row.len())]);
        }

        let image = self.backend.create_image(&params);
        self.scheduler.request_outside_render_pass_operation_context();
        let target = image.clone();
        self.scheduler
            .record(move |backend: &B, cmdbuf| backend.cmd_upload_image(cmdbuf, &target, &host));
        *self.screen_info.lock() = ScreenInfo {
            image: Some(image),
            width: config.width,
            height: config.height,
            is_srgb: false,
        };
        self.present();
    }

    // --------------------------------------------------------------------------------------------
    // Draw state
    // --------------------------------------------------------------------------------------------

    fn flush_work(&self) {
        let counter = self.draw_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if counter & 7 != 7 {
            return;
        }
        if counter < DRAWS_TO_DISPATCH {
            // Let the worker start on what we have
            self.scheduler.dispatch_work();
            return;
        }
        self.scheduler.flush();
        self.draw_counter.store(0, Ordering::Relaxed);
    }

    /// Resolve the bound render targets and build the render pass they form.
    fn update_attachments(&self, preserve_contents: bool) -> Attachments<B> {
        let rt_count = (self.maxwell3d.regs().rt_count as usize).min(NUM_COLOR);
        let mut attachments = Attachments {
            key: RenderPassKey::default(),
            color: Vec::with_capacity(rt_count),
            depth: None,
        };
        let mut extent = (u32::MAX, u32::MAX);
        for index in 0..rt_count {
            let Some(view) = self.texture_cache.get_color_buffer_surface(index, preserve_contents)
            else {
                continue;
            };
            let Some(image) = self.texture_cache.view_image(&view) else {
                continue;
            };
            let params = self
                .texture_cache
                .with_surface(view.surface, |surface| *surface.params());
            if let Some(params) = params {
                attachments.key.color_formats[index] = Some(params.pixel_format);
                extent = (extent.0.min(params.width), extent.1.min(params.height));
            }
            attachments.color.push((index, image, view.params));
        }
        if let Some(view) = self.texture_cache.get_depth_buffer_surface(preserve_contents) {
            if let Some(image) = self.texture_cache.view_image(&view) {
                let params = self
                    .texture_cache
                    .with_surface(view.surface, |surface| *surface.params());
                if let Some(params) = params {
                    attachments.key.depth_format = Some(params.pixel_format);
                    extent = (extent.0.min(params.width), extent.1.min(params.height));
                }
                attachments.depth = Some((image, view.params));
            }
        }
        if extent.0 != u32::MAX {
            attachments.key.width = extent.0;
            attachments.key.height = extent.1;
        }
        attachments
    }

    fn setup_textures(&self) {
        let textures = self.maxwell3d.regs().textures.clone();
        for bound in &textures {
            let view = self.texture_cache.get_texture_surface(&bound.tic, &bound.entry);
            trace!("Sampling surface {} from {:#x}", view.surface.index(), bound.tic.address);
        }
    }

    fn mark_attachments_in_use(&self, attachments: &Attachments<B>) {
        for &(index, _, _) in &attachments.color {
            self.texture_cache.mark_color_buffer_in_use(index);
        }
        if attachments.depth.is_some() {
            self.texture_cache.mark_depth_buffer_in_use();
        }
    }
}

struct Attachments<B: GraphicsBackend> {
    key: RenderPassKey,
    color: Vec<(usize, B::Image, crate::texture_cache::view::ViewParams)>,
    depth: Option<(B::Image, crate::texture_cache::view::ViewParams)>,
}

fn pipeline_id(key: &RenderPassKey, is_indexed: bool) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    is_indexed.hash(&mut hasher);
    hasher.finish()
}

impl<B: GraphicsBackend> RasterizerInterface for Rasterizer<B> {
    fn draw(&self, is_indexed: bool, is_instanced: bool) {
        self.flush_work();

        self.texture_cache.guard_render_targets(true);
        let attachments = self.update_attachments(true);
        self.scheduler
            .bind_graphics_pipeline(pipeline_id(&attachments.key, is_indexed));

        self.texture_cache.guard_samplers(true);
        self.setup_textures();
        self.texture_cache.guard_samplers(false);
        if self.texture_cache.texture_barrier() {
            debug!("Draw samples one of its own render targets");
        }

        let (vertex_count, instance_count) = {
            let regs = self.maxwell3d.regs();
            let count = if is_indexed { regs.index_count } else { regs.vertex_count };
            let instances = if is_instanced { regs.instance_count.max(1) } else { 1 };
            (count, instances)
        };
        self.scheduler.request_renderpass(attachments.key);
        self.scheduler.record(move |backend: &B, cmdbuf| {
            backend.cmd_draw(cmdbuf, vertex_count, instance_count)
        });
        self.mark_attachments_in_use(&attachments);
        self.texture_cache.guard_render_targets(false);
    }

    fn clear(&self) {
        let (clear_buffers, color, depth) = {
            let regs = self.maxwell3d.regs();
            (regs.clear_buffers, regs.clear_color, regs.clear_depth)
        };
        let use_color = clear_buffers.color_mask != 0;
        if !use_color && !clear_buffers.depth && !clear_buffers.stencil {
            return;
        }

        let attachments = self.update_attachments(true);
        self.scheduler.request_renderpass(attachments.key);
        if use_color {
            let target = attachments
                .color
                .iter()
                .find(|(index, _, _)| *index == clear_buffers.rt as usize);
            if let Some((_, image, view)) = target {
                let (image, view) = (image.clone(), *view);
                self.scheduler.record(move |backend: &B, cmdbuf| {
                    backend.cmd_clear_image(cmdbuf, &image, &view, color)
                });
                self.texture_cache
                    .mark_color_buffer_in_use(clear_buffers.rt as usize);
            }
        }
        if clear_buffers.depth || clear_buffers.stencil {
            if let Some((image, view)) = attachments.depth.clone() {
                self.scheduler.record(move |backend: &B, cmdbuf| {
                    backend.cmd_clear_image(cmdbuf, &image, &view, [depth, 0.0, 0.0, 0.0])
                });
                self.texture_cache.mark_depth_buffer_in_use();
            }
        }
    }

    fn dispatch_compute(&self, code_addr: u64) {
        self.flush_work();
        self.setup_textures();
        self.scheduler.request_outside_render_pass_operation_context();
        self.scheduler
            .record(move |backend: &B, cmdbuf| backend.cmd_dispatch(cmdbuf, code_addr));
    }

    fn signal_semaphore(&self, addr: u64, value: u32) {
        if !self.config.use_asynchronous_gpu_emulation {
            self.memory_manager.write::<u32>(addr, value);
            return;
        }
        self.fence_manager.lock().signal_semaphore(self, addr, value);
    }

    fn signal_sync_point(&self, value: u32) {
        let mut fence_manager = self.fence_manager.lock();
        if !self.config.use_asynchronous_gpu_emulation {
            fence_manager.signal_sync_point(self, value);
            fence_manager.wait_pending_fences(self);
            return;
        }
        fence_manager.signal_sync_point(self, value);
    }

    fn release_fences(&self) {
        if !self.config.use_asynchronous_gpu_emulation {
            return;
        }
        self.fence_manager.lock().wait_pending_fences(self);
    }

    fn flush_all(&self) {}

    fn flush_region(&self, addr: u64, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        self.texture_cache.flush_region(addr, size);
    }

    fn must_flush_region(&self, addr: u64, size: u64) -> bool {
        if !self.config.is_gpu_level_high() {
            return false;
        }
        self.texture_cache.must_flush_region(addr, size)
    }

    fn invalidate_region(&self, addr: u64, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        self.texture_cache.invalidate_region(addr, size);
    }

    fn on_cpu_write(&self, addr: u64, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        self.texture_cache.on_cpu_write(addr, size);
    }

    fn sync_guest_host(&self) {
        self.texture_cache.sync_guest_host();
    }

    fn flush_and_invalidate_region(&self, addr: u64, size: u64) {
        if self.config.is_gpu_level_extreme() {
            self.flush_region(addr, size);
        }
        self.invalidate_region(addr, size);
    }

    fn wait_for_idle(&self) {
        let event = self.backend.create_event();
        self.scheduler.request_outside_render_pass_operation_context();
        self.scheduler
            .record(move |backend: &B, cmdbuf| backend.cmd_set_event(cmdbuf, &event));
    }

    fn flush_commands(&self) {
        if self.draw_counter.load(Ordering::Relaxed) > 0 {
            self.draw_counter.store(0, Ordering::Relaxed);
            self.scheduler.flush();
        }
    }

    fn tick_frame(&self) {
        self.draw_counter.store(0, Ordering::Relaxed);
    }

    fn accelerate_surface_copy(
        &self,
        src: &fermi_2d::Surface,
        dst: &fermi_2d::Surface,
        config: &fermi_2d::Config,
    ) -> bool {
        self.texture_cache.do_fermi_copy(src, dst, config);
        true
    }

    fn accelerate_display(
        &self,
        config: &FramebufferConfig,
        framebuffer_addr: u64,
        pixel_stride: u32,
    ) -> bool {
        if framebuffer_addr == 0 {
            return false;
        }
        let Some(surface) = self.texture_cache.try_find_framebuffer_surface(framebuffer_addr) else {
            return false;
        };
        let params = surface.params;
        if params.width != config.width || params.height != config.height {
            warn!(
                "Framebuffer {}x{} (stride {}) is displayed from a {}x{} surface",
                config.width, config.height, pixel_stride, params.width, params.height
            );
        }
        *self.screen_info.lock() = ScreenInfo {
            image: Some(surface.image),
            width: params.width,
            height: params.height,
            is_srgb: params.srgb_conversion,
        };
        true
    }

    fn update_pages_cached_count(&self, addr: u64, size: u64, delta: i32) {
        if size == 0 {
            return;
        }
        let page_start = addr >> PAGE_BITS;
        let page_end = (addr + size).div_ceil(PAGE_SIZE);
        let memory = self.memory_manager.memory();

        let mut cached_pages = self.cached_pages.lock();
        // Runs of pages that crossed between zero and one
        let mut run: Option<(u64, u64)> = None;
        let flush_run = |run: &mut Option<(u64, u64)>| {
            if let Some((start, end)) = run.take() {
                memory.rasterizer_mark_region_cached(
                    start << PAGE_BITS,
                    (end - start) << PAGE_BITS,
                    delta > 0,
                );
            }
        };
        for page in page_start..page_end {
            let count = cached_pages.entry(page).or_insert(0);
            *count += delta;
            let transitioned = if delta > 0 { *count == 1 } else { *count == 0 };
            if *count < 0 {
                error!("Negative cached count on page {:#x}", page << PAGE_BITS);
                *count = 0;
            }
            if *count == 0 {
                cached_pages.remove(&page);
            }

            if transitioned {
                run = match run {
                    Some((start, end)) if end == page => Some((start, page + 1)),
                    other => {
                        let mut previous = other;
                        flush_run(&mut previous);
                        Some((page, page + 1))
                    }
                };
            } else {
                flush_run(&mut run);
            }
        }
        flush_run(&mut run);
    }
}

impl<B: GraphicsBackend> FenceHost for Rasterizer<B> {
    fn flush_commands(&self) {
        RasterizerInterface::flush_commands(self);
    }

    fn sync_guest_host(&self) {
        self.texture_cache.sync_guest_host();
    }

    fn has_uncommitted_flushes(&self) -> bool {
        self.texture_cache.has_uncommitted_flushes()
    }

    fn should_wait_async_flushes(&self) -> bool {
        self.texture_cache.should_wait_async_flushes()
    }

    fn commit_async_flushes(&self) {
        self.texture_cache.commit_async_flushes();
    }

    fn pop_async_flushes(&self) {
        self.texture_cache.pop_async_flushes();
    }
}
