//! Guest surfaces resolved to host images.
//!
//! Every texture, render target and blit operand the guest references is
//! looked up here by address and [`SurfaceParams`]. A request either hits an
//! existing surface (possibly through a layer or mip view), is reconstructed
//! from the surfaces it overlaps, or recycles them into a fresh surface. The
//! cache always hands back a usable [`View`]; resolution failures fall back to
//! the slower recycle path instead of surfacing as errors.
//!
//! Surfaces live in an arena and are never freed. Unregistered surfaces go to
//! a reserve keyed by their parameters and are reused by later requests.
//!
//! Lock order: the cache lock is taken before the 3D engine registers and
//! before the rasterizer's page counts. Nothing holding the scheduler lock
//! takes the cache lock.

pub mod copy_params;
pub mod format;
pub mod surface;
pub mod surface_params;
pub mod swizzle;
pub mod tic;
pub mod view;

use self::copy_params::CopyParams;
use self::format::SurfaceTarget;
use self::surface::{Surface, SurfaceId};
use self::surface_params::{MatchStructureResult, MatchTopologyResult, SurfaceParams};
use self::tic::{ImageEntry, SamplerEntry, TicEntry, is_type_compatible};
use self::view::{View, ViewParams};
use crate::backend::GraphicsBackend;
use crate::config::EmulationConfig;
use crate::engines::fermi_2d;
use crate::engines::maxwell_3d::{DirtyFlags, Maxwell3D};
use crate::gpu_memory::MemoryManager;
use crate::rasterizer::RasterizerInterface;
use crate::scheduler::Scheduler;
use oxidinx_hw::specs::render_target_format;
use oxidinx_hw::specs::render_targets::NUM_COLOR;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Render target index of the depth buffer
pub const DEPTH_RT: u32 = 8;

/// Render target index of a surface not bound as a render target
pub const NO_RT: u32 = 0xFFFF_FFFF;

/// log2 of the bucket size of the CPU address registry (1 MiB)
const REGISTRY_PAGE_BITS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecycleStrategy {
    /// Drop the overlaps; their contents are superseded
    Ignore,
    /// Write the overlaps back to guest memory before dropping them
    Flush,
}

/// What the cache already knows about one side of a blit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deduction {
    Failed,
    Incomplete,
    Complete(SurfaceId),
}

#[derive(Debug, Clone, Copy, Default)]
struct RenderInfo {
    target: Option<SurfaceId>,
    view: Option<View>,
}

/// A registered surface starting exactly at a framebuffer address
#[derive(Clone)]
pub struct FramebufferSurface<I> {
    pub view: View,
    pub image: I,
    pub params: SurfaceParams,
}

// ================================================================================================
// Cache state
// ================================================================================================

struct CacheState<B: GraphicsBackend> {
    surfaces: Vec<Surface<B>>,
    /// Exact CPU address hits
    l1_cache: HashMap<u64, SurfaceId>,
    /// Registered surfaces by 1 MiB CPU page
    registry: HashMap<u64, Vec<SurfaceId>>,
    surface_reserve: HashMap<SurfaceParams, Vec<SurfaceId>>,
    /// Placeholder surfaces by target
    invalid_cache: HashMap<SurfaceTarget, SurfaceId>,

    render_targets: [RenderInfo; NUM_COLOR],
    depth_buffer: RenderInfo,

    sampled_textures: Vec<SurfaceId>,
    marked_for_unregister: Vec<SurfaceId>,

    uncommitted_flushes: Option<Vec<SurfaceId>>,
    committed_flushes: VecDeque<Option<Vec<SurfaceId>>>,

    guard_render_targets: bool,
    guard_samplers: bool,
    ticks: u64,
}

/// Registry buckets touched by `[start, end)`
fn registry_pages(start: u64, end: u64) -> RangeInclusive<u64> {
    (start >> REGISTRY_PAGE_BITS)..=(end.max(start + 1) - 1) >> REGISTRY_PAGE_BITS
}

impl<B: GraphicsBackend> CacheState<B> {
    fn new() -> Self {
        Self {
            surfaces: Vec::new(),
            l1_cache: HashMap::new(),
            registry: HashMap::new(),
            surface_reserve: HashMap::new(),
            invalid_cache: HashMap::new(),
            render_targets: [RenderInfo::default(); NUM_COLOR],
            depth_buffer: RenderInfo::default(),
            sampled_textures: Vec::new(),
            marked_for_unregister: Vec::new(),
            uncommitted_flushes: None,
            committed_flushes: VecDeque::new(),
            guard_render_targets: false,
            guard_samplers: false,
            ticks: 0,
        }
    }

    fn get(&self, id: SurfaceId) -> &Surface<B> {
        &self.surfaces[id.index()]
    }

    fn get_mut(&mut self, id: SurfaceId) -> &mut Surface<B> {
        &mut self.surfaces[id.index()]
    }

    fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    fn view(&self, id: SurfaceId, params: ViewParams) -> View {
        View {
            surface: id,
            generation: self.get(id).generation(),
            params,
        }
    }

    fn main_view(&self, id: SurfaceId) -> View {
        self.view(id, self.get(id).main_view())
    }

    fn register_inner_cache(&mut self, id: SurfaceId) {
        let (start, end) = {
            let surface = self.get(id);
            (surface.cpu_addr(), surface.cpu_addr_end())
        };
        self.l1_cache.insert(start, id);
        for page in registry_pages(start, end) {
            self.registry.entry(page).or_default().push(id);
        }
    }

    fn unregister_inner_cache(&mut self, id: SurfaceId) {
        let (start, end) = {
            let surface = self.get(id);
            (surface.cpu_addr(), surface.cpu_addr_end())
        };
        if self.l1_cache.get(&start) == Some(&id) {
            self.l1_cache.remove(&start);
        }
        for page in registry_pages(start, end) {
            if let Some(list) = self.registry.get_mut(&page) {
                list.retain(|&other| other != id);
                if list.is_empty() {
                    self.registry.remove(&page);
                }
            }
        }
    }

    /// Registered surfaces intersecting `[cpu_addr, cpu_addr + size)`, each once.
    fn surfaces_in_region(&mut self, cpu_addr: u64, size: u64) -> Vec<SurfaceId> {
        if size == 0 {
            return Vec::new();
        }
        let cpu_addr_end = cpu_addr + size;
        let mut result = Vec::new();
        for page in registry_pages(cpu_addr, cpu_addr_end) {
            let Some(list) = self.registry.get(&page) else {
                continue;
            };
            for &id in list {
                let surface = &mut self.surfaces[id.index()];
                if surface.is_picked() || !surface.overlaps(cpu_addr, cpu_addr_end) {
                    continue;
                }
                surface.mark_as_picked(true);
                result.push(id);
            }
        }
        for &id in &result {
            self.get_mut(id).mark_as_picked(false);
        }
        result
    }

    fn reserve_surface(&mut self, id: SurfaceId) {
        let params = *self.get(id).params();
        let list = self.surface_reserve.entry(params).or_default();
        if !list.contains(&id) {
            list.push(id);
        }
    }

    fn try_get_reserved_surface(&self, params: &SurfaceParams) -> Option<SurfaceId> {
        self.surface_reserve
            .get(params)?
            .iter()
            .copied()
            .find(|&id| !self.get(id).is_registered())
    }

    fn set_empty_color_buffer(&mut self, index: usize) {
        let Some(target) = self.render_targets[index].target.take() else {
            return;
        };
        self.get_mut(target).mark_as_render_target(false, NO_RT);
        self.render_targets[index].view = None;
    }

    fn set_empty_depth_buffer(&mut self) {
        let Some(target) = self.depth_buffer.target.take() else {
            return;
        };
        self.get_mut(target).mark_as_render_target(false, NO_RT);
        self.depth_buffer.view = None;
    }

    fn async_flush_surface(&mut self, id: SurfaceId) {
        self.uncommitted_flushes.get_or_insert_with(Vec::new).push(id);
    }
}

// ================================================================================================
// Texture cache
// ================================================================================================

pub struct TextureCache<B: GraphicsBackend> {
    config: EmulationConfig,
    backend: Arc<B>,
    scheduler: Arc<Scheduler<B>>,
    memory_manager: Arc<MemoryManager>,
    maxwell3d: Arc<Maxwell3D>,
    rasterizer: Weak<dyn RasterizerInterface>,
    /// Not reentrant. Surface loads and flushes run under this lock and must
    /// only touch guest memory through the `_unsafe` block accessors, which
    /// never call back into the rasterizer or this cache.
    state: Mutex<CacheState<B>>,
}

impl<B: GraphicsBackend> TextureCache<B> {
    pub fn new(
        config: EmulationConfig,
        scheduler: Arc<Scheduler<B>>,
        memory_manager: Arc<MemoryManager>,
        maxwell3d: Arc<Maxwell3D>,
        rasterizer: Weak<dyn RasterizerInterface>,
    ) -> Self {
        Self {
            config,
            backend: scheduler.backend().clone(),
            scheduler,
            memory_manager,
            maxwell3d,
            rasterizer,
            state: Mutex::new(CacheState::new()),
        }
    }

    fn with_rasterizer(&self, f: impl FnOnce(&dyn RasterizerInterface)) {
        if let Some(rasterizer) = self.rasterizer.upgrade() {
            f(rasterizer.as_ref());
        }
    }

    // --------------------------------------------------------------------------------------------
    // Lookup entry points
    // --------------------------------------------------------------------------------------------

    /// Resolve a surface by GPU address, or `None` when the address is unmapped.
    pub fn get_surface(
        &self,
        gpu_addr: u64,
        params: &SurfaceParams,
        preserve_contents: bool,
    ) -> Option<View> {
        let cpu_addr = self.memory_manager.gpu_to_cpu_address(gpu_addr)?;
        let mut guard = self.state.lock();
        let (_, view) =
            self.get_surface_locked(&mut guard, gpu_addr, cpu_addr, params, preserve_contents, false);
        Some(view)
    }

    /// View for a texture sampled through `entry`.
    pub fn get_texture_surface(&self, tic: &TicEntry, entry: &SamplerEntry) -> View {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let target = SurfaceParams::expected_target(entry);
        let gpu_addr = tic.address;
        if gpu_addr == 0 {
            return self.get_null_surface(st, target);
        }
        let Some(cpu_addr) = self.memory_manager.gpu_to_cpu_address(gpu_addr) else {
            return self.get_null_surface(st, target);
        };
        if !is_type_compatible(tic.texture_type, entry) {
            return self.get_null_surface(st, target);
        }
        let params = SurfaceParams::create_for_texture(tic, entry);
        let (id, view) = self.get_surface_locked(st, gpu_addr, cpu_addr, &params, true, false);
        if st.guard_samplers {
            st.sampled_textures.push(id);
        }
        view
    }

    /// View for a texture bound as a shader image.
    pub fn get_image_surface(&self, tic: &TicEntry, entry: &ImageEntry) -> View {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let target = SurfaceParams::expected_image_target(entry);
        let gpu_addr = tic.address;
        if gpu_addr == 0 {
            return self.get_null_surface(st, target);
        }
        let Some(cpu_addr) = self.memory_manager.gpu_to_cpu_address(gpu_addr) else {
            return self.get_null_surface(st, target);
        };
        let params = SurfaceParams::create_for_image(tic, entry);
        let (id, view) = self.get_surface_locked(st, gpu_addr, cpu_addr, &params, true, false);
        if st.guard_samplers {
            st.sampled_textures.push(id);
        }
        view
    }

    /// Whether a texture sampled since the last barrier is also a render target.
    pub fn texture_barrier(&self) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let any_rt = st
            .sampled_textures
            .iter()
            .any(|&id| st.surfaces[id.index()].is_render_target());
        st.sampled_textures.clear();
        any_rt
    }

    pub fn get_depth_buffer_surface(&self, preserve_contents: bool) -> Option<View> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !self.maxwell3d.test_and_clear(DirtyFlags::ZETA_BUFFER) {
            return st.depth_buffer.view;
        }

        let resolved = {
            let regs = self.maxwell3d.regs();
            (regs.zeta_enable && regs.zeta.address != 0)
                .then(|| (regs.zeta.address, SurfaceParams::create_for_depth_buffer(&regs)))
        };
        let Some((gpu_addr, params)) = resolved else {
            st.set_empty_depth_buffer();
            return None;
        };
        let Some(cpu_addr) = self.memory_manager.gpu_to_cpu_address(gpu_addr) else {
            st.set_empty_depth_buffer();
            return None;
        };

        let (id, view) =
            self.get_surface_locked(st, gpu_addr, cpu_addr, &params, preserve_contents, true);
        if let Some(previous) = st.depth_buffer.target {
            st.get_mut(previous).mark_as_render_target(false, NO_RT);
        }
        st.depth_buffer = RenderInfo {
            target: Some(id),
            view: Some(view),
        };
        st.get_mut(id).mark_as_render_target(true, DEPTH_RT);
        Some(view)
    }

    pub fn get_color_buffer_surface(&self, index: usize, preserve_contents: bool) -> Option<View> {
        assert!(index < NUM_COLOR, "render target index {index} out of range");
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !self.maxwell3d.test_and_clear(DirtyFlags::color_buffer(index)) {
            return st.render_targets[index].view;
        }

        let resolved = {
            let regs = self.maxwell3d.regs();
            let config = &regs.rt[index];
            let enabled = (index as u32) < regs.rt_count
                && config.address != 0
                && config.format != render_target_format::NONE;
            enabled.then(|| (config.address, SurfaceParams::create_for_framebuffer(&regs, index)))
        };
        let Some((gpu_addr, params)) = resolved else {
            st.set_empty_color_buffer(index);
            return None;
        };
        let Some(cpu_addr) = self.memory_manager.gpu_to_cpu_address(gpu_addr) else {
            st.set_empty_color_buffer(index);
            return None;
        };

        let (id, view) =
            self.get_surface_locked(st, gpu_addr, cpu_addr, &params, preserve_contents, true);
        if let Some(previous) = st.render_targets[index].target {
            let surface = st.get_mut(previous);
            surface.mark_as_render_target(false, NO_RT);
            if !surface.params().is_tiled && self.config.use_asynchronous_gpu_emulation {
                st.async_flush_surface(previous);
            }
        }
        st.render_targets[index] = RenderInfo {
            target: Some(id),
            view: Some(view),
        };
        st.get_mut(id).mark_as_render_target(true, index as u32);
        Some(view)
    }

    pub fn mark_color_buffer_in_use(&self, index: usize) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(target) = st.render_targets[index].target {
            let tick = st.tick();
            st.get_mut(target).mark_as_modified(true, tick);
        }
    }

    pub fn mark_depth_buffer_in_use(&self) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(target) = st.depth_buffer.target {
            let tick = st.tick();
            st.get_mut(target).mark_as_modified(true, tick);
        }
    }

    pub fn set_empty_color_buffer(&self, index: usize) {
        self.state.lock().set_empty_color_buffer(index);
    }

    pub fn set_empty_depth_buffer(&self) {
        self.state.lock().set_empty_depth_buffer();
    }

    /// Scaled copy between two 2D engine surfaces.
    pub fn do_fermi_copy(
        &self,
        src_config: &fermi_2d::Surface,
        dst_config: &fermi_2d::Surface,
        copy_config: &fermi_2d::Config,
    ) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut src_params = SurfaceParams::create_for_fermi_copy_surface(src_config);
        let mut dst_params = SurfaceParams::create_for_fermi_copy_surface(dst_config);
        let src_gpu_addr = src_config.address();
        let dst_gpu_addr = dst_config.address();
        self.deduce_best_blit(st, &mut src_params, &mut dst_params, src_gpu_addr, dst_gpu_addr);

        let dst_cpu_addr = self.memory_manager.gpu_to_cpu_address(dst_gpu_addr);
        let src_cpu_addr = self.memory_manager.gpu_to_cpu_address(src_gpu_addr);
        let (Some(dst_cpu_addr), Some(src_cpu_addr)) = (dst_cpu_addr, src_cpu_addr) else {
            warn!(
                "Surface copy {:#x} -> {:#x} touches unmapped memory, skipping",
                src_gpu_addr, dst_gpu_addr
            );
            return;
        };

        let (dst_surface, dst_view) =
            self.get_surface_locked(st, dst_gpu_addr, dst_cpu_addr, &dst_params, true, false);
        let (_, src_view) =
            self.get_surface_locked(st, src_gpu_addr, src_cpu_addr, &src_params, true, false);
        self.image_blit(st, &src_view, &dst_view, copy_config);
        let tick = st.tick();
        st.get_mut(dst_surface).mark_as_modified(true, tick);
    }

    pub fn try_find_framebuffer_surface(&self, cpu_addr: u64) -> Option<FramebufferSurface<B::Image>> {
        if cpu_addr == 0 {
            return None;
        }
        let guard = self.state.lock();
        let id = guard
            .registry
            .get(&(cpu_addr >> REGISTRY_PAGE_BITS))?
            .iter()
            .copied()
            .find(|&id| guard.get(id).cpu_addr() == cpu_addr)?;
        let surface = guard.get(id);
        Some(FramebufferSurface {
            view: guard.main_view(id),
            image: surface.image().clone(),
            params: *surface.params(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Coherency
    // --------------------------------------------------------------------------------------------

    /// Drop every surface overlapping a CPU range the guest rewrote.
    pub fn invalidate_region(&self, addr: u64, size: u64) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        for id in st.surfaces_in_region(addr, size) {
            self.unregister(st, id);
        }
    }

    /// Defer invalidation of surfaces under a CPU write until [`Self::sync_guest_host`].
    pub fn on_cpu_write(&self, addr: u64, size: u64) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        for id in st.surfaces_in_region(addr, size) {
            if !st.get(id).is_memory_marked() {
                continue;
            }
            self.unmark_memory(st, id);
            st.get_mut(id).mark_as_sync_pending(true);
            st.marked_for_unregister.push(id);
        }
    }

    pub fn sync_guest_host(&self) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        for id in std::mem::take(&mut st.marked_for_unregister) {
            if st.get(id).is_registered() {
                st.get_mut(id).mark_as_sync_pending(false);
                self.unregister(st, id);
            }
        }
    }

    /// Write modified surfaces in a CPU range back to guest memory, oldest first.
    ///
    /// The cache lock is released around each download.
    pub fn flush_region(&self, addr: u64, size: u64) {
        let mut guard = self.state.lock();
        let mut surfaces = guard.surfaces_in_region(addr, size);
        if surfaces.is_empty() {
            return;
        }
        surfaces.sort_by_key(|&id| guard.get(id).modification_tick());
        for id in surfaces {
            let surface = guard.get(id);
            if !surface.is_modified() {
                continue;
            }
            let generation = surface.generation();
            let detached = surface.detach();
            MutexGuard::unlocked(&mut guard, || {
                let staging = detached.download_texture(&self.scheduler);
                detached.flush_buffer(&self.memory_manager, &staging);
            });
            // Unregistered while unlocked; its contents already went out.
            if guard.get(id).generation() == generation {
                let tick = guard.tick();
                guard.get_mut(id).mark_as_modified(false, tick);
            }
        }
    }

    pub fn must_flush_region(&self, addr: u64, size: u64) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.surfaces_in_region(addr, size)
            .into_iter()
            .any(|id| st.get(id).is_modified())
    }

    /// While set, bound 3D render target slices survive unregistration.
    pub fn guard_render_targets(&self, new_guard: bool) {
        self.state.lock().guard_render_targets = new_guard;
    }

    /// While set, sampled surfaces are remembered for [`Self::texture_barrier`].
    pub fn guard_samplers(&self, new_guard: bool) {
        self.state.lock().guard_samplers = new_guard;
    }

    // --------------------------------------------------------------------------------------------
    // Asynchronous flushes
    // --------------------------------------------------------------------------------------------

    pub fn commit_async_flushes(&self) {
        let mut guard = self.state.lock();
        let flushes = guard.uncommitted_flushes.take();
        guard.committed_flushes.push_back(flushes);
    }

    pub fn has_uncommitted_flushes(&self) -> bool {
        self.state.lock().uncommitted_flushes.is_some()
    }

    pub fn should_wait_async_flushes(&self) -> bool {
        matches!(self.state.lock().committed_flushes.front(), Some(Some(_)))
    }

    pub fn pop_async_flushes(&self) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(flushes) = st.committed_flushes.pop_front() else {
            return;
        };
        for id in flushes.unwrap_or_default() {
            self.flush_surface(st, id);
        }
    }

    /// Advance the modification clock.
    pub fn tick(&self) -> u64 {
        self.state.lock().tick()
    }

    // --------------------------------------------------------------------------------------------
    // Inspection
    // --------------------------------------------------------------------------------------------

    /// Whether `view`'s surface is still registered as it was when the view was taken.
    pub fn view_is_current(&self, view: &View) -> bool {
        let guard = self.state.lock();
        guard.surfaces.get(view.surface.index()).is_some_and(|surface| {
            surface.generation() == view.generation
                && (surface.is_registered() || surface.gpu_addr() == 0)
        })
    }

    pub fn view_image(&self, view: &View) -> Option<B::Image> {
        let guard = self.state.lock();
        guard
            .surfaces
            .get(view.surface.index())
            .map(|surface| surface.image().clone())
    }

    pub fn with_surface<R>(&self, id: SurfaceId, f: impl FnOnce(&Surface<B>) -> R) -> Option<R> {
        self.state.lock().surfaces.get(id.index()).map(f)
    }

    pub fn registered_count(&self) -> usize {
        self.state
            .lock()
            .surfaces
            .iter()
            .filter(|surface| surface.is_registered())
            .count()
    }

    /// Surfaces ever created, registered or not
    pub fn arena_len(&self) -> usize {
        self.state.lock().surfaces.len()
    }

    pub fn surfaces_in_region(&self, cpu_addr: u64, size: u64) -> Vec<SurfaceId> {
        self.state.lock().surfaces_in_region(cpu_addr, size)
    }

    // ============================================================================================
    // Resolution, with the cache lock held
    // ============================================================================================

    fn get_surface_locked(
        &self,
        st: &mut CacheState<B>,
        gpu_addr: u64,
        cpu_addr: u64,
        params: &SurfaceParams,
        preserve_contents: bool,
        is_render: bool,
    ) -> (SurfaceId, View) {
        // Exact address hit
        if let Some(&current) = st.l1_cache.get(&cpu_addr) {
            let surface = st.get(current);
            let topological_result = surface.matches_topology(params);
            if topological_result != MatchTopologyResult::FullMatch {
                return self.recycle_surface(
                    st,
                    vec![current],
                    params,
                    gpu_addr,
                    preserve_contents,
                    topological_result,
                );
            }
            let struct_result = surface.matches_structure(params);
            if struct_result != MatchStructureResult::None {
                let not_3d = params.target != SurfaceTarget::Texture3D
                    && surface.params().target != SurfaceTarget::Texture3D;
                if not_3d || surface.match_target(params.target) {
                    return if struct_result == MatchStructureResult::FullMatch {
                        self.manage_structural_match(st, current, params, is_render)
                    } else {
                        self.rebuild_surface(st, current, params, is_render)
                    };
                }
            }
        }

        let candidate_size = params.guest_size_in_bytes();
        let overlaps = st.surfaces_in_region(cpu_addr, candidate_size as u64);
        if overlaps.is_empty() {
            return self.initialize_surface(st, gpu_addr, params, preserve_contents);
        }

        let untopological = overlaps
            .iter()
            .map(|&id| st.get(id).matches_topology(params))
            .find(|&result| result != MatchTopologyResult::FullMatch);
        if let Some(result) = untopological {
            return self.recycle_surface(st, overlaps, params, gpu_addr, preserve_contents, result);
        }

        if params.block_depth > 0 {
            let managed =
                self.manage_3d_surfaces(st, &overlaps, params, gpu_addr, cpu_addr, preserve_contents);
            if let Some(result) = managed {
                return result;
            }
        }

        if let [current] = overlaps[..] {
            let surface = st.get(current);
            // Outside the overlap: the candidate may be a super-surface of it
            if !surface.is_inside(gpu_addr, gpu_addr + candidate_size as u64) {
                if let Some(result) = self.try_reconstruct_surface(st, &overlaps, params, gpu_addr) {
                    return result;
                }
                return self.recycle_surface(
                    st,
                    overlaps,
                    params,
                    gpu_addr,
                    preserve_contents,
                    MatchTopologyResult::FullMatch,
                );
            }

            if let Some(view_params) = surface.emplace_view(params, gpu_addr, candidate_size) {
                if surface.match_format(params.pixel_format) {
                    return (current, st.view(current, view_params));
                }
                // Same memory under another format: rebuild, then view again
                let mut new_params = *surface.params();
                new_params.width = SurfaceParams::convert_width(
                    new_params.width,
                    new_params.pixel_format,
                    params.pixel_format,
                );
                new_params.height = SurfaceParams::convert_height(
                    new_params.height,
                    new_params.pixel_format,
                    params.pixel_format,
                );
                new_params.pixel_format = params.pixel_format;
                let (rebuilt, _) = self.rebuild_surface(st, current, &new_params, is_render);
                if let Some(view_params) = st.get(rebuilt).emplace_view(params, gpu_addr, candidate_size)
                {
                    return (rebuilt, st.view(rebuilt, view_params));
                }
                return self.recycle_surface(
                    st,
                    vec![rebuilt],
                    params,
                    gpu_addr,
                    preserve_contents,
                    MatchTopologyResult::FullMatch,
                );
            }
        } else if let Some(result) = self.try_reconstruct_surface(st, &overlaps, params, gpu_addr) {
            return result;
        }

        self.recycle_surface(
            st,
            overlaps,
            params,
            gpu_addr,
            preserve_contents,
            MatchTopologyResult::FullMatch,
        )
    }

    fn manage_structural_match(
        &self,
        st: &mut CacheState<B>,
        current: SurfaceId,
        params: &SurfaceParams,
        is_render: bool,
    ) -> (SurfaceId, View) {
        let surface = st.get(current);
        let format = surface.params().pixel_format;
        let reuse = format == params.pixel_format
            || (!is_render && format.sibling() == Some(params.pixel_format));
        if !reuse {
            return self.rebuild_surface(st, current, params, is_render);
        }
        if surface.match_target(params.target) {
            (current, st.main_view(current))
        } else {
            let overview = surface.emplace_overview(params);
            (current, st.view(current, overview))
        }
    }

    /// Move `current`'s contents into a new surface shaped like `params`.
    fn rebuild_surface(
        &self,
        st: &mut CacheState<B>,
        current: SurfaceId,
        params: &SurfaceParams,
        is_render: bool,
    ) -> (SurfaceId, View) {
        let (gpu_addr, cr_params, was_modified) = {
            let surface = st.get(current);
            (surface.gpu_addr(), *surface.params(), surface.is_modified())
        };
        debug!(
            "Rebuilding {} surface at {:#x} as {:?}",
            cr_params.target_name(),
            gpu_addr,
            params.pixel_format
        );
        let new_surface = if cr_params.pixel_format != params.pixel_format
            && !is_render
            && cr_params.pixel_format.sibling() == Some(params.pixel_format)
        {
            let mut new_params = *params;
            new_params.pixel_format = cr_params.pixel_format;
            new_params.surface_type = cr_params.surface_type;
            self.get_uncached_surface(st, gpu_addr, &new_params)
        } else {
            self.get_uncached_surface(st, gpu_addr, params)
        };

        let final_params = *st.get(new_surface).params();
        if cr_params.surface_type != final_params.surface_type {
            if self.config.is_gpu_level_extreme() {
                self.buffer_copy(st, current, new_surface);
            }
        } else {
            for brick in st.get(current).break_down(&final_params) {
                self.try_copy_image(st, current, new_surface, &brick);
            }
        }
        self.unregister(st, current);
        self.register(st, new_surface);
        let tick = st.tick();
        st.get_mut(new_surface).mark_as_modified(was_modified, tick);
        (new_surface, st.main_view(new_surface))
    }

    fn recycle_surface(
        &self,
        st: &mut CacheState<B>,
        mut overlaps: Vec<SurfaceId>,
        params: &SurfaceParams,
        gpu_addr: u64,
        preserve_contents: bool,
        untopological: MatchTopologyResult,
    ) -> (SurfaceId, View) {
        let do_load = preserve_contents && self.config.is_gpu_level_extreme();
        for &id in &overlaps {
            self.unregister(st, id);
        }
        let strategy = self.pick_strategy(st, &overlaps, params, untopological);
        debug!(
            "Recycling {} surface(s) for {:#x} ({:?})",
            overlaps.len(),
            gpu_addr,
            strategy
        );
        match strategy {
            RecycleStrategy::Ignore => self.initialize_surface(st, gpu_addr, params, do_load),
            RecycleStrategy::Flush => {
                overlaps.sort_by_key(|&id| st.get(id).modification_tick());
                for &id in &overlaps {
                    self.flush_surface(st, id);
                }
                self.initialize_surface(st, gpu_addr, params, preserve_contents)
            }
        }
    }

    fn pick_strategy(
        &self,
        st: &CacheState<B>,
        overlaps: &[SurfaceId],
        params: &SurfaceParams,
        untopological: MatchTopologyResult,
    ) -> RecycleStrategy {
        if self.config.is_gpu_level_extreme() {
            return RecycleStrategy::Flush;
        }
        let is_3d = |p: &SurfaceParams| p.target == SurfaceTarget::Texture3D;
        if is_3d(params) || overlaps.iter().any(|&id| is_3d(st.get(id).params())) {
            return RecycleStrategy::Flush;
        }
        match untopological {
            MatchTopologyResult::CompressUnmatch => RecycleStrategy::Flush,
            MatchTopologyResult::FullMatch if !params.is_tiled => RecycleStrategy::Flush,
            _ => RecycleStrategy::Ignore,
        }
    }

    /// Build the candidate out of overlaps that are its layers or mip levels.
    fn try_reconstruct_surface(
        &self,
        st: &mut CacheState<B>,
        overlaps: &[SurfaceId],
        params: &SurfaceParams,
        gpu_addr: u64,
    ) -> Option<(SurfaceId, View)> {
        if params.target == SurfaceTarget::Texture3D {
            return None;
        }
        let new_surface = self.get_uncached_surface(st, gpu_addr, params);

        if !overlaps.iter().any(|&id| st.get(id).is_modified()) {
            self.load_surface(st, new_surface);
            for &id in overlaps {
                self.unregister(st, id);
            }
            self.register(st, new_surface);
            return Some((new_surface, st.main_view(new_surface)));
        }

        let block_width = params.default_block_width();
        let block_height = params.default_block_height();
        let mut passed_tests = 0;
        for &id in overlaps {
            let (src_params, src_gpu_addr, src_mip_size) = {
                let surface = st.get(id);
                (*surface.params(), surface.gpu_addr(), surface.mipmap_size(0))
            };
            let target = st.get(new_surface);
            let Some((base_layer, base_mipmap)) = target.layer_mipmap(src_gpu_addr) else {
                continue;
            };
            if target.mipmap_size(base_mipmap) != src_mip_size {
                continue;
            }
            passed_tests += 1;

            for mipmap in base_mipmap..(base_mipmap + src_params.num_levels).min(params.num_levels) {
                let src_level = mipmap - base_mipmap;
                let width = SurfaceParams::intersect_width(&src_params, params, src_level, mipmap);
                let height = SurfaceParams::intersect_height(&src_params, params, src_level, mipmap);
                if width < block_width || height < block_height {
                    // Levels smaller than a compressed block cannot be copied
                    break;
                }
                let copy = CopyParams::new(
                    (0, 0, 0),
                    (0, 0, base_layer),
                    src_level,
                    mipmap,
                    width,
                    height,
                    src_params.depth,
                );
                self.try_copy_image(st, id, new_surface, &copy);
            }
        }

        let all_or_nothing = self.config.is_gpu_level_extreme();
        if passed_tests == 0 || (all_or_nothing && passed_tests != overlaps.len()) {
            trace!(
                "Reconstruction at {:#x} matched {} of {} overlaps",
                gpu_addr,
                passed_tests,
                overlaps.len()
            );
            st.reserve_surface(new_surface);
            return None;
        }

        for &id in overlaps {
            self.unregister(st, id);
        }
        let tick = st.tick();
        st.get_mut(new_surface).mark_as_modified(true, tick);
        self.register(st, new_surface);
        Some((new_surface, st.main_view(new_surface)))
    }

    /// 3D textures and the 2D slices they are written through.
    fn manage_3d_surfaces(
        &self,
        st: &mut CacheState<B>,
        overlaps: &[SurfaceId],
        params: &SurfaceParams,
        gpu_addr: u64,
        cpu_addr: u64,
        preserve_contents: bool,
    ) -> Option<(SurfaceId, View)> {
        if params.target != SurfaceTarget::Texture3D {
            for &id in overlaps {
                let surface = st.get(id);
                if !surface.match_target(params.target) {
                    if overlaps.len() == 1 && surface.cpu_addr() == cpu_addr {
                        if self.config.is_gpu_level_extreme() {
                            return None;
                        }
                        self.unregister(st, id);
                        return Some(self.initialize_surface(st, gpu_addr, params, preserve_contents));
                    }
                    return None;
                }
                if surface.cpu_addr() == cpu_addr
                    && surface.matches_structure(params) == MatchStructureResult::FullMatch
                {
                    return Some((id, st.main_view(id)));
                }
            }
            return Some(self.initialize_surface(st, gpu_addr, params, preserve_contents));
        }

        if params.num_levels > 1 {
            // TODO: 3D textures with mipmaps
            return None;
        }

        if let [id] = overlaps[..] {
            let surface = st.get(id);
            let overlap_params = surface.params();
            if overlap_params.num_levels == 1 && cpu_addr >= surface.cpu_addr() {
                let offset = (cpu_addr - surface.cpu_addr()) as u32;
                let (_, _, slice) = params.block_offset_xyz(offset);
                if slice < overlap_params.depth {
                    let view = surface.emplace_3d_view(slice, params.depth, 0, 1);
                    return Some((id, st.view(id, view)));
                }
            }
        }

        let new_surface = self.get_uncached_surface(st, gpu_addr, params);
        let mut modified = false;
        for &id in overlaps {
            let surface = st.get(id);
            let src_params = surface.params();
            if src_params.target != SurfaceTarget::Texture2D
                || src_params.height != params.height
                || src_params.block_depth != params.block_depth
                || src_params.block_height != params.block_height
                || surface.cpu_addr() < cpu_addr
            {
                st.reserve_surface(new_surface);
                return None;
            }
            modified |= surface.is_modified();
            let offset = (surface.cpu_addr() - cpu_addr) as u32;
            let (_, _, slice) = params.block_offset_xyz(offset);
            let copy = CopyParams::new((0, 0, 0), (0, 0, slice), 0, 0, params.width, params.height, 1);
            self.try_copy_image(st, id, new_surface, &copy);
        }
        for &id in overlaps {
            self.unregister(st, id);
        }
        let tick = st.tick();
        st.get_mut(new_surface).mark_as_modified(modified, tick);
        self.register(st, new_surface);
        Some((new_surface, st.main_view(new_surface)))
    }

    fn deduce_surface(&self, st: &mut CacheState<B>, gpu_addr: u64, params: &SurfaceParams) -> Deduction {
        let Some(cpu_addr) = self.memory_manager.gpu_to_cpu_address(gpu_addr) else {
            return Deduction::Failed;
        };
        if let Some(&current) = st.l1_cache.get(&cpu_addr) {
            let surface = st.get(current);
            if surface.matches_topology(params) != MatchTopologyResult::FullMatch {
                return Deduction::Failed;
            }
            if surface.matches_structure(params) != MatchStructureResult::None
                && surface.match_target(params.target)
            {
                return Deduction::Complete(current);
            }
        }
        match st.surfaces_in_region(cpu_addr, params.guest_size_in_bytes() as u64)[..] {
            [] => Deduction::Incomplete,
            [only] => Deduction::Complete(only),
            _ => Deduction::Failed,
        }
    }

    /// Give both blit operands a depth format when either side is a known depth surface.
    fn deduce_best_blit(
        &self,
        st: &mut CacheState<B>,
        src_params: &mut SurfaceParams,
        dst_params: &mut SurfaceParams,
        src_gpu_addr: u64,
        dst_gpu_addr: u64,
    ) {
        let deduced_src = self.deduce_surface(st, src_gpu_addr, src_params);
        let deduced_dst = self.deduce_surface(st, dst_gpu_addr, dst_params);
        let is_depth = |id: SurfaceId| st.get(id).params().is_pixel_format_zeta();
        let (src_from, dst_from) = match (deduced_src, deduced_dst) {
            (Deduction::Complete(src), Deduction::Complete(dst)) if is_depth(src) && is_depth(dst) => {
                (src, dst)
            }
            (Deduction::Incomplete, Deduction::Complete(dst)) if is_depth(dst) => (dst, dst),
            (Deduction::Complete(src), Deduction::Incomplete) if is_depth(src) => (src, src),
            _ => return,
        };
        let inherit_format = |to: &mut SurfaceParams, from: SurfaceId| {
            let params = st.get(from).params();
            to.pixel_format = params.pixel_format;
            to.surface_type = params.surface_type;
        };
        inherit_format(src_params, src_from);
        inherit_format(dst_params, dst_from);
    }

    // --------------------------------------------------------------------------------------------
    // Surface lifecycle
    // --------------------------------------------------------------------------------------------

    fn initialize_surface(
        &self,
        st: &mut CacheState<B>,
        gpu_addr: u64,
        params: &SurfaceParams,
        preserve_contents: bool,
    ) -> (SurfaceId, View) {
        let id = self.get_uncached_surface(st, gpu_addr, params);
        self.register(st, id);
        if preserve_contents {
            self.load_surface(st, id);
        }
        (id, st.main_view(id))
    }

    /// An unregistered surface for `params`, reusing the reserve when possible.
    fn get_uncached_surface(
        &self,
        st: &mut CacheState<B>,
        gpu_addr: u64,
        params: &SurfaceParams,
    ) -> SurfaceId {
        if let Some(id) = st.try_get_reserved_surface(params) {
            let tick = st.tick();
            let surface = st.get_mut(id);
            surface.set_gpu_addr(gpu_addr);
            surface.mark_as_render_target(false, NO_RT);
            surface.mark_as_modified(false, tick);
            return id;
        }
        self.create_surface(st, gpu_addr, params)
    }

    fn create_surface(&self, st: &mut CacheState<B>, gpu_addr: u64, params: &SurfaceParams) -> SurfaceId {
        let image = self.backend.create_image(params);
        let id = SurfaceId(st.surfaces.len() as u32);
        trace!(
            "Creating {} surface {} at {:#x} ({}x{}x{} {:?})",
            params.target_name(),
            id.index(),
            gpu_addr,
            params.width,
            params.height,
            params.depth,
            params.pixel_format
        );
        st.surfaces.push(Surface::new(gpu_addr, *params, image));
        id
    }

    fn get_null_surface(&self, st: &mut CacheState<B>, target: SurfaceTarget) -> View {
        if let Some(&id) = st.invalid_cache.get(&target) {
            return st.main_view(id);
        }
        let params = SurfaceParams::null_surface(target);
        let id = self.create_surface(st, 0, &params);
        let surface = st.get(id);
        surface.upload_texture(&self.scheduler, vec![0; surface.host_size_in_bytes()]);
        let tick = st.tick();
        st.get_mut(id).mark_as_modified(false, tick);
        st.invalid_cache.insert(target, id);
        st.main_view(id)
    }

    fn load_surface(&self, st: &mut CacheState<B>, id: SurfaceId) {
        let surface = st.get(id);
        let host = surface.load_buffer(&self.memory_manager);
        surface.upload_texture(&self.scheduler, host);
        let tick = st.tick();
        st.get_mut(id).mark_as_modified(false, tick);
    }

    fn flush_surface(&self, st: &mut CacheState<B>, id: SurfaceId) {
        let surface = st.get(id);
        if !surface.is_modified() {
            return;
        }
        let staging = surface.download_texture(&self.scheduler);
        surface.flush_buffer(&self.memory_manager, &staging);
        let tick = st.tick();
        st.get_mut(id).mark_as_modified(false, tick);
    }

    fn register(&self, st: &mut CacheState<B>, id: SurfaceId) {
        let (gpu_addr, size) = {
            let surface = st.get(id);
            (surface.gpu_addr(), surface.size_in_bytes() as u64)
        };
        let Some(cpu_addr) = self.memory_manager.gpu_to_cpu_address(gpu_addr) else {
            error!("Failed to register surface with unmapped GPU address {:#x}", gpu_addr);
            st.reserve_surface(id);
            return;
        };
        let surface = st.get_mut(id);
        surface.mark_as_registered(cpu_addr);
        surface.mark_as_memory_marked(true);
        st.register_inner_cache(id);
        self.with_rasterizer(|rasterizer| rasterizer.update_pages_cached_count(cpu_addr, size, 1));
    }

    fn unmark_memory(&self, st: &mut CacheState<B>, id: SurfaceId) {
        let surface = st.get_mut(id);
        if !surface.is_memory_marked() {
            return;
        }
        surface.mark_as_memory_marked(false);
        let (cpu_addr, size) = (surface.cpu_addr(), surface.size_in_bytes() as u64);
        self.with_rasterizer(|rasterizer| rasterizer.update_pages_cached_count(cpu_addr, size, -1));
    }

    fn unregister(&self, st: &mut CacheState<B>, id: SurfaceId) {
        let surface = st.get(id);
        if st.guard_render_targets && surface.is_protected() {
            return;
        }
        if !st.guard_render_targets && surface.is_render_target() {
            self.manage_render_target_unregister(surface.render_target());
        }
        self.unmark_memory(st, id);
        if st.get(id).is_sync_pending() {
            st.marked_for_unregister.retain(|&marked| marked != id);
            st.get_mut(id).mark_as_sync_pending(false);
        }
        st.unregister_inner_cache(id);
        st.get_mut(id).mark_as_unregistered();
        st.reserve_surface(id);
    }

    /// Force the render target a dropped surface was bound to to be resolved again.
    fn manage_render_target_unregister(&self, index: u32) {
        let flags = match index {
            DEPTH_RT => DirtyFlags::ZETA_BUFFER,
            index if (index as usize) < NUM_COLOR => DirtyFlags::color_buffer(index as usize),
            _ => DirtyFlags::empty(),
        };
        self.maxwell3d.mark_dirty(flags | DirtyFlags::RENDER_TARGETS);
    }

    // --------------------------------------------------------------------------------------------
    // Image transfers
    // --------------------------------------------------------------------------------------------

    fn try_copy_image(&self, st: &CacheState<B>, src: SurfaceId, dst: SurfaceId, copy: &CopyParams) {
        let (src_surface, dst_surface) = (st.get(src), st.get(dst));
        let src_format = src_surface.params().pixel_format;
        let dst_format = dst_surface.params().pixel_format;
        if !dst_format.is_copy_compatible(src_format) {
            error!("Illegal copy between formats {:?} and {:?}", dst_format, src_format);
            return;
        }
        self.scheduler.request_outside_render_pass_operation_context();
        let (src_image, dst_image, copy) = (src_surface.image().clone(), dst_surface.image().clone(), *copy);
        self.scheduler.record(move |backend: &B, cmdbuf| {
            backend.cmd_copy_image(cmdbuf, &src_image, &dst_image, &copy)
        });
    }

    fn image_blit(&self, st: &CacheState<B>, src: &View, dst: &View, config: &fermi_2d::Config) {
        let src_image = st.get(src.surface).image().clone();
        let dst_image = st.get(dst.surface).image().clone();
        let (src_view, dst_view, config) = (src.params, dst.params, *config);
        self.scheduler.request_outside_render_pass_operation_context();
        self.scheduler.record(move |backend: &B, cmdbuf| {
            backend.cmd_blit_image(cmdbuf, &src_image, &src_view, &dst_image, &dst_view, &config)
        });
    }

    fn buffer_copy(&self, st: &CacheState<B>, src: SurfaceId, dst: SurfaceId) {
        warn!(
            "Buffer copy between {:?} and {:?} surfaces is not implemented",
            st.get(src).params().surface_type,
            st.get(dst).params().surface_type
        );
    }
}
