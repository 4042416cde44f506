//! A cached guest surface and its host image.

use super::copy_params::CopyParams;
use super::format::{PixelFormat, SurfaceTarget};
use super::surface_params::{MatchStructureResult, MatchTopologyResult, SurfaceParams};
use super::swizzle::BlockLinearLayout;
use super::view::ViewParams;
use crate::backend::{GraphicsBackend, StagingBuffer};
use crate::gpu_memory::MemoryManager;
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Stable index of a surface in the cache arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub(crate) u32);

impl SurfaceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub struct Surface<B: GraphicsBackend> {
    params: SurfaceParams,
    gpu_addr: u64,
    cpu_addr: u64,
    image: B::Image,
    layer_size: usize,
    guest_memory_size: usize,
    host_memory_size: usize,
    mipmap_sizes: Vec<usize>,
    mipmap_offsets: Vec<usize>,
    main_view: ViewParams,

    is_target: bool,
    index: u32,
    is_registered: bool,
    is_picked: bool,
    is_memory_marked: bool,
    is_sync_pending: bool,
    is_modified: bool,
    modification_tick: u64,
    /// Bumped on every unregistration; views taken earlier become stale
    generation: u32,
}

impl<B: GraphicsBackend> Surface<B> {
    pub fn new(gpu_addr: u64, params: SurfaceParams, image: B::Image) -> Self {
        let mut mipmap_sizes = Vec::with_capacity(params.num_levels as usize);
        let mut mipmap_offsets = Vec::with_capacity(params.num_levels as usize);
        let mut offset = 0;
        for level in 0..params.num_levels {
            let size = params.guest_mipmap_size(level);
            mipmap_sizes.push(size);
            mipmap_offsets.push(offset);
            offset += size;
        }
        let mut layer_size = offset;
        let guest_memory_size = if params.is_layered {
            if params.is_tiled {
                layer_size =
                    SurfaceParams::align_layered(layer_size, params.block_height, params.block_depth);
            }
            layer_size * params.depth as usize
        } else {
            layer_size
        };
        let main_layers = if params.is_layered || params.target == SurfaceTarget::Texture3D {
            params.depth
        } else {
            1
        };

        Self {
            params,
            gpu_addr,
            cpu_addr: 0,
            image,
            layer_size,
            guest_memory_size,
            host_memory_size: params.host_size_in_bytes(),
            mipmap_sizes,
            mipmap_offsets,
            main_view: ViewParams::new(params.target, 0, main_layers, 0, params.num_levels),
            is_target: false,
            index: 0,
            is_registered: false,
            is_picked: false,
            is_memory_marked: false,
            is_sync_pending: false,
            is_modified: false,
            modification_tick: 0,
            generation: 0,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn params(&self) -> &SurfaceParams {
        &self.params
    }

    pub fn image(&self) -> &B::Image {
        &self.image
    }

    pub fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    pub fn cpu_addr(&self) -> u64 {
        self.cpu_addr
    }

    pub fn cpu_addr_end(&self) -> u64 {
        self.cpu_addr + self.guest_memory_size as u64
    }

    pub fn size_in_bytes(&self) -> usize {
        self.guest_memory_size
    }

    pub fn host_size_in_bytes(&self) -> usize {
        self.host_memory_size
    }

    pub fn mipmap_size(&self, level: u32) -> usize {
        self.mipmap_sizes[level as usize]
    }

    pub fn main_view(&self) -> ViewParams {
        self.main_view
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_linear(&self) -> bool {
        !self.params.is_tiled
    }

    pub fn match_format(&self, pixel_format: PixelFormat) -> bool {
        self.params.pixel_format == pixel_format
    }

    pub fn match_target(&self, target: SurfaceTarget) -> bool {
        self.params.target == target
    }

    /// Rebind a reserved surface to a new guest address.
    pub(crate) fn set_gpu_addr(&mut self, gpu_addr: u64) {
        self.gpu_addr = gpu_addr;
    }

    /// Fresh bookkeeping over the same image, for transfers made without the cache lock.
    pub(crate) fn detach(&self) -> Self {
        let mut surface = Self::new(self.gpu_addr, self.params, self.image.clone());
        surface.cpu_addr = self.cpu_addr;
        surface
    }

    // --------------------------------------------------------------------------------------------
    // Cache state
    // --------------------------------------------------------------------------------------------

    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    pub(crate) fn mark_as_registered(&mut self, cpu_addr: u64) {
        self.cpu_addr = cpu_addr;
        self.is_registered = true;
    }

    pub(crate) fn mark_as_unregistered(&mut self) {
        self.is_registered = false;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn is_picked(&self) -> bool {
        self.is_picked
    }

    pub fn mark_as_picked(&mut self, picked: bool) {
        self.is_picked = picked;
    }

    pub fn is_memory_marked(&self) -> bool {
        self.is_memory_marked
    }

    pub fn mark_as_memory_marked(&mut self, marked: bool) {
        self.is_memory_marked = marked;
    }

    pub fn is_sync_pending(&self) -> bool {
        self.is_sync_pending
    }

    pub fn mark_as_sync_pending(&mut self, pending: bool) {
        self.is_sync_pending = pending;
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    pub fn modification_tick(&self) -> u64 {
        self.modification_tick
    }

    /// Render targets always count as modified.
    pub fn mark_as_modified(&mut self, modified: bool, tick: u64) {
        self.is_modified = modified || self.is_target;
        self.modification_tick = tick;
    }

    pub fn is_render_target(&self) -> bool {
        self.is_target
    }

    /// Render target slot the surface is bound to, if any
    pub fn render_target(&self) -> u32 {
        self.index
    }

    pub fn mark_as_render_target(&mut self, is_target: bool, index: u32) {
        self.is_target = is_target;
        self.index = index;
    }

    /// Bound 3D slices must outlive the 2D surfaces that alias them.
    pub fn is_protected(&self) -> bool {
        self.is_target && self.params.block_depth > 0
    }

    // --------------------------------------------------------------------------------------------
    // Geometry
    // --------------------------------------------------------------------------------------------

    /// Whether `[other_start, other_end)` in GPU space lies within this surface.
    pub fn is_inside(&self, other_start: u64, other_end: u64) -> bool {
        let gpu_addr_end = self.gpu_addr + self.guest_memory_size as u64;
        self.gpu_addr <= other_start && other_end <= gpu_addr_end
    }

    /// Whether `[start, end)` in CPU space intersects this surface.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        !(self.cpu_addr >= end || start >= self.cpu_addr_end())
    }

    pub fn matches_topology(&self, rhs: &SurfaceParams) -> MatchTopologyResult {
        let params = &self.params;
        if (params.bytes_per_pixel(), params.is_tiled, params.is_buffer())
            != (rhs.bytes_per_pixel(), rhs.is_tiled, rhs.is_buffer())
        {
            return MatchTopologyResult::None;
        }
        if params.is_compressed() == rhs.is_compressed() {
            MatchTopologyResult::FullMatch
        } else {
            MatchTopologyResult::CompressUnmatch
        }
    }

    pub fn matches_structure(&self, rhs: &SurfaceParams) -> MatchStructureResult {
        let params = &self.params;
        if params.is_buffer() {
            let lhs_width = params.width * params.bytes_per_pixel();
            let rhs_width = rhs.width * rhs.bytes_per_pixel();
            return if lhs_width == rhs_width {
                MatchStructureResult::FullMatch
            } else {
                MatchStructureResult::None
            };
        }

        if !params.is_tiled {
            if (params.height, params.pitch) != (rhs.height, rhs.pitch) {
                return MatchStructureResult::None;
            }
            return if params.width == rhs.width {
                MatchStructureResult::FullMatch
            } else {
                MatchStructureResult::SemiMatch
            };
        }

        let layout = |p: &SurfaceParams| {
            (
                p.depth,
                p.block_width,
                p.block_height,
                p.block_depth,
                p.tile_width_spacing,
                p.num_levels,
            )
        };
        if layout(params) != layout(rhs) {
            return MatchStructureResult::None;
        }
        if (params.width, params.height) == (rhs.width, rhs.height) {
            return MatchStructureResult::FullMatch;
        }
        let ws = SurfaceParams::convert_width(
            rhs.block_aligned_width(),
            params.pixel_format,
            rhs.pixel_format,
        );
        let hs = SurfaceParams::convert_height(rhs.height, params.pixel_format, rhs.pixel_format);
        if (params.block_aligned_width(), params.height) == (ws, hs) {
            return MatchStructureResult::SemiMatch;
        }
        MatchStructureResult::None
    }

    /// Layer and mip level starting exactly at `candidate_gpu_addr`
    pub fn layer_mipmap(&self, candidate_gpu_addr: u64) -> Option<(u32, u32)> {
        if self.gpu_addr == candidate_gpu_addr {
            return Some((0, 0));
        }
        if candidate_gpu_addr < self.gpu_addr || self.layer_size == 0 {
            return None;
        }
        let relative_address = (candidate_gpu_addr - self.gpu_addr) as usize;
        let layer = relative_address / self.layer_size;
        if layer >= self.params.depth as usize {
            return None;
        }
        let mipmap_address = relative_address - self.layer_size * layer;
        let level = self.mipmap_offsets.binary_search(&mipmap_address).ok()?;
        Some((layer as u32, level as u32))
    }

    /// Copies that move every shared layer and level into a surface of `in_params`.
    pub fn break_down(&self, in_params: &SurfaceParams) -> Vec<CopyParams> {
        let params = &self.params;
        if params.is_layered {
            let mut result = Vec::with_capacity((params.depth * params.num_levels) as usize);
            for layer in 0..params.depth {
                for level in 0..params.num_levels {
                    let width = SurfaceParams::intersect_width(params, in_params, level, level);
                    let height = SurfaceParams::intersect_height(params, in_params, level, level);
                    result.push(CopyParams::new(
                        (0, 0, layer),
                        (0, 0, layer),
                        level,
                        level,
                        width,
                        height,
                        1,
                    ));
                }
            }
            result
        } else {
            (0..params.num_levels)
                .map(|level| {
                    let width = SurfaceParams::intersect_width(params, in_params, level, level);
                    let height = SurfaceParams::intersect_height(params, in_params, level, level);
                    let depth = params.mip_depth(level).min(in_params.mip_depth(level));
                    CopyParams::whole_level(width, height, depth, level)
                })
                .collect()
        }
    }

    // --------------------------------------------------------------------------------------------
    // Views
    // --------------------------------------------------------------------------------------------

    /// View of the whole surface typed as `overview_params.target`
    pub fn emplace_overview(&self, overview_params: &SurfaceParams) -> ViewParams {
        let num_layers = if self.params.is_layered && !overview_params.is_layered {
            1
        } else {
            self.params.depth
        };
        ViewParams::new(overview_params.target, 0, num_layers, 0, self.params.num_levels)
    }

    /// View of the layer or mip level a candidate at `view_addr` refers to
    pub fn emplace_view(
        &self,
        view_params: &SurfaceParams,
        view_addr: u64,
        candidate_size: usize,
    ) -> Option<ViewParams> {
        if self.params.target == SurfaceTarget::Texture3D
            || view_params.target == SurfaceTarget::Texture3D
            || (self.params.num_levels == 1 && !self.params.is_layered)
        {
            return None;
        }
        let (layer, mipmap) = self.layer_mipmap(view_addr)?;
        if self.mipmap_size(mipmap) != candidate_size {
            return self.emplace_irregular_view(view_params, view_addr, candidate_size, mipmap, layer);
        }
        Some(ViewParams::new(view_params.target, layer, 1, mipmap, 1))
    }

    /// View spanning several layers or several levels of one layer
    fn emplace_irregular_view(
        &self,
        view_params: &SurfaceParams,
        view_addr: u64,
        candidate_size: usize,
        mipmap: u32,
        layer: u32,
    ) -> Option<ViewParams> {
        let (end_layer, end_mipmap) = self.layer_mipmap(view_addr + candidate_size as u64)?;
        if layer != end_layer {
            if mipmap == 0 && end_mipmap == 0 {
                return Some(ViewParams::new(view_params.target, layer, end_layer - layer, 0, 1));
            }
            return None;
        }
        Some(ViewParams::new(view_params.target, layer, 1, mipmap, end_mipmap - mipmap))
    }

    pub fn emplace_3d_view(&self, slice: u32, depth: u32, base_level: u32, num_levels: u32) -> ViewParams {
        ViewParams::new(SurfaceTarget::Texture3D, slice, depth, base_level, num_levels)
    }

    // --------------------------------------------------------------------------------------------
    // Guest memory transfers
    // --------------------------------------------------------------------------------------------

    fn mip_layout(&self, level: u32, depth: u32) -> BlockLinearLayout {
        let params = &self.params;
        BlockLinearLayout {
            bytes_per_pixel: params.bytes_per_pixel(),
            width: params.mip_width(level).div_ceil(params.default_block_width()),
            height: params.mip_height(level).div_ceil(params.default_block_height()),
            depth,
            block_height: params.mip_block_height(level),
            block_depth: params.mip_block_depth(level),
            tile_width_spacing: params.tile_width_spacing,
        }
    }

    /// Move every level between the guest buffer and the host layout.
    fn swizzle_levels(&self, guest: &mut [u8], host: &mut [u8], to_host: bool) {
        let params = &self.params;
        for level in 0..params.num_levels {
            let host_offset = params.host_mipmap_level_offset(level);
            let guest_offset = params.guest_mipmap_level_offset(level);
            let (layers, guest_stride, host_stride, layout) = if params.is_layered {
                (
                    params.depth as usize,
                    self.layer_size,
                    params.host_layer_size(level),
                    self.mip_layout(level, 1),
                )
            } else {
                (1, 0, 0, self.mip_layout(level, params.mip_depth(level)))
            };
            for layer in 0..layers {
                let guest_start = guest_offset + layer * guest_stride;
                let host_start = host_offset + layer * host_stride;
                let (Some(guest), Some(host)) = (guest.get_mut(guest_start..), host.get_mut(host_start..))
                else {
                    error!("Level {} layer {} lies outside the surface", level, layer);
                    return;
                };
                if to_host {
                    layout.unswizzle(host, guest);
                } else {
                    layout.swizzle(guest, host);
                }
            }
        }
    }

    /// Read the surface from guest memory into the host layout.
    pub fn load_buffer(&self, memory_manager: &MemoryManager) -> Vec<u8> {
        let params = &self.params;
        let mut guest = vec![0u8; self.guest_memory_size];
        memory_manager.read_block_unsafe(self.gpu_addr, &mut guest);
        let mut host = vec![0u8; self.host_memory_size];

        if params.is_tiled {
            if params.block_width != 0 {
                warn!(
                    "Block width is {} on a {} texture",
                    params.block_width,
                    params.target_name()
                );
            }
            self.swizzle_levels(&mut guest, &mut host, true);
        } else {
            if params.num_levels != 1 {
                warn!("Linear mipmap loading is not implemented");
            }
            let width = params.width.div_ceil(params.default_block_width());
            let height = params.height.div_ceil(params.default_block_height());
            let copy_size = (width * params.bytes_per_pixel()) as usize;
            copy_rows(&guest, params.pitch as usize, &mut host, copy_size, copy_size, height);
        }
        host
    }

    /// Write host-layout `staging` back to guest memory.
    pub fn flush_buffer(&self, memory_manager: &MemoryManager, staging: &[u8]) {
        let params = &self.params;
        let mut guest = vec![0u8; self.guest_memory_size];
        // A 2D slice of a 3D texture shares GOBs with its neighbours
        if params.block_depth > 0 && params.target == SurfaceTarget::Texture2D {
            memory_manager.read_block_unsafe(self.gpu_addr, &mut guest);
        }

        if params.is_tiled {
            let mut host = staging.to_vec();
            host.resize(self.host_memory_size, 0);
            self.swizzle_levels(&mut guest, &mut host, false);
        } else if params.is_buffer() {
            let len = guest.len().min(staging.len());
            guest[..len].copy_from_slice(&staging[..len]);
        } else {
            let copy_size = (params.width * params.bytes_per_pixel()) as usize;
            copy_rows(staging, copy_size, &mut guest, params.pitch as usize, copy_size, params.height);
        }
        memory_manager.write_block_unsafe(self.gpu_addr, &guest);
    }

    // --------------------------------------------------------------------------------------------
    // Host transfers
    // --------------------------------------------------------------------------------------------

    /// Record an upload of host-layout `data` into the image.
    pub fn upload_texture(&self, scheduler: &Scheduler<B>, data: Vec<u8>) {
        scheduler.request_outside_render_pass_operation_context();
        let image = self.image.clone();
        scheduler.record(move |backend: &B, cmdbuf| backend.cmd_upload_image(cmdbuf, &image, &data));
    }

    /// Read the image back, waiting for the GPU to finish.
    pub fn download_texture(&self, scheduler: &Scheduler<B>) -> Vec<u8> {
        trace!("Downloading surface at {:#x}", self.gpu_addr);
        scheduler.request_outside_render_pass_operation_context();
        let staging: StagingBuffer = Arc::new(Mutex::new(Vec::new()));
        let image = self.image.clone();
        let target = staging.clone();
        scheduler.record(move |backend: &B, cmdbuf| backend.cmd_download_image(cmdbuf, &image, &target));
        scheduler.finish();
        std::mem::take(&mut *staging.lock())
    }
}

/// Copy `rows` rows of `row_size` bytes between buffers of different pitch.
fn copy_rows(src: &[u8], src_pitch: usize, dst: &mut [u8], dst_pitch: usize, row_size: usize, rows: u32) {
    if src_pitch == dst_pitch {
        let len = (row_size.max(src_pitch) * rows as usize).min(src.len()).min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    for row in 0..rows as usize {
        let (Some(from), Some(to)) = (
            src.get(row * src_pitch..row * src_pitch + row_size),
            dst.get_mut(row * dst_pitch..row * dst_pitch + row_size),
        ) else {
            break;
        };
        to.copy_from_slice(from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::gpu_memory::GpuMemoryConfig;
    use crate::memory::{DeviceMemory, Memory};
    use crate::texture_cache::surface_params::tests::rgba8_2d;
    use oxidinx_hw::memory_map::dram;

    const GPU_BASE: u64 = 0x1_0000_0000;

    fn memory_manager() -> MemoryManager {
        let device = Arc::new(DeviceMemory::new(0x40_0000));
        let memory = Arc::new(Memory::new(device, 32));
        memory.map_memory_region(0x10_0000, 0x20_0000, dram::BASE).unwrap();
        let config = GpuMemoryConfig {
            address_space_bits: 36,
            ..GpuMemoryConfig::default()
        };
        let manager = MemoryManager::new(memory, config);
        manager.map(0x10_0000, GPU_BASE, 0x20_0000).unwrap();
        manager
    }

    fn surface(params: SurfaceParams) -> Surface<SoftwareBackend> {
        let backend = SoftwareBackend::new();
        let image = backend.create_image(&params);
        Surface::new(GPU_BASE, params, image)
    }

    #[test]
    fn test_mipmap_layout() {
        let mut params = rgba8_2d(64, 64, true);
        params.num_levels = 3;
        params.block_height = 3;
        let surface = surface(params);
        assert_eq!(surface.layer_mipmap(GPU_BASE), Some((0, 0)));
        let level1 = GPU_BASE + surface.mipmap_size(0) as u64;
        assert_eq!(surface.layer_mipmap(level1), Some((0, 1)));
        assert_eq!(surface.layer_mipmap(level1 + 4), None);
        assert_eq!(surface.layer_mipmap(GPU_BASE - 1), None);
    }

    #[test]
    fn test_emplace_view_of_layer() {
        let mut params = rgba8_2d(16, 16, true);
        params.target = SurfaceTarget::Texture2DArray;
        params.is_layered = true;
        params.depth = 4;
        let surface = surface(params);
        let layer_size = surface.size_in_bytes() / 4;

        let layer = rgba8_2d(16, 16, true);
        let view = surface
            .emplace_view(&layer, GPU_BASE + 2 * layer_size as u64, layer_size)
            .unwrap();
        assert_eq!(view, ViewParams::new(SurfaceTarget::Texture2D, 2, 1, 0, 1));

        // Two layers at once
        let view = surface
            .emplace_view(&layer, GPU_BASE + layer_size as u64, 2 * layer_size)
            .unwrap();
        assert_eq!(view, ViewParams::new(SurfaceTarget::Texture2D, 1, 2, 0, 1));
    }

    #[test]
    fn test_structure_matching() {
        let surface = surface(rgba8_2d(64, 64, true));
        assert_eq!(
            surface.matches_structure(&rgba8_2d(64, 64, true)),
            MatchStructureResult::FullMatch
        );
        assert_eq!(
            surface.matches_structure(&rgba8_2d(60, 64, true)),
            MatchStructureResult::SemiMatch
        );
        assert_eq!(
            surface.matches_structure(&rgba8_2d(64, 32, true)),
            MatchStructureResult::None
        );
        assert_eq!(
            surface.matches_topology(&rgba8_2d(64, 64, false)),
            MatchTopologyResult::None
        );
    }

    #[test]
    fn test_render_targets_stay_modified() {
        let mut surface = surface(rgba8_2d(8, 8, true));
        surface.mark_as_render_target(true, 0);
        surface.mark_as_modified(false, 3);
        assert!(surface.is_modified());
        assert_eq!(surface.modification_tick(), 3);
        assert!(!surface.is_protected());
    }

    #[test]
    fn test_tiled_round_trip_through_guest_memory() {
        let manager = memory_manager();
        let surface = surface(rgba8_2d(32, 16, true));
        let pixels: Vec<u8> = (0..32 * 16 * 4).map(|i| (i % 251) as u8).collect();

        surface.flush_buffer(&manager, &pixels);
        let mut raw = vec![0u8; 64];
        manager.read_block(GPU_BASE, &mut raw);
        // The first GOB row holds pixels 0..4 of row 0, then row 1
        assert_eq!(&raw[0..16], &pixels[0..16]);
        assert_eq!(&raw[16..32], &pixels[128..144]);

        assert_eq!(surface.load_buffer(&manager), pixels);
    }

    #[test]
    fn test_linear_rows_use_pitch() {
        let manager = memory_manager();
        let mut params = rgba8_2d(2, 2, false);
        params.pitch = 16;
        let surface = surface(params);
        let pixels: Vec<u8> = (1..=16).collect();

        surface.flush_buffer(&manager, &pixels);
        let mut raw = vec![0u8; 32];
        manager.read_block(GPU_BASE, &mut raw);
        assert_eq!(&raw[0..8], &pixels[0..8]);
        assert_eq!(&raw[8..16], &[0; 8]);
        assert_eq!(&raw[16..24], &pixels[8..16]);
        assert_eq!(surface.load_buffer(&manager), pixels);
    }
}
