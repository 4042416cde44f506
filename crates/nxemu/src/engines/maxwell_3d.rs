//! Reduced 3D engine state.
//!
//! Only what the rasterizer and the texture cache consume is modelled: the
//! color render targets, the depth buffer, bound textures and clear values.
//! Writers mark the matching [`DirtyFlags`] so consumers re-resolve lazily.

use crate::texture_cache::tic::{SamplerEntry, TicEntry};
use bitflags::bitflags;
use oxidinx_hw::specs::render_targets::NUM_COLOR;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// State changed since the rasterizer last consumed it
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        const COLOR_BUFFER_0 = 1 << 0;
        const COLOR_BUFFER_1 = 1 << 1;
        const COLOR_BUFFER_2 = 1 << 2;
        const COLOR_BUFFER_3 = 1 << 3;
        const COLOR_BUFFER_4 = 1 << 4;
        const COLOR_BUFFER_5 = 1 << 5;
        const COLOR_BUFFER_6 = 1 << 6;
        const COLOR_BUFFER_7 = 1 << 7;
        const COLOR_BUFFERS = 0xFF;
        const ZETA_BUFFER = 1 << 8;
        /// The framebuffer as a whole needs rebuilding
        const RENDER_TARGETS = 1 << 9;
    }
}

impl DirtyFlags {
    pub fn color_buffer(index: usize) -> Self {
        assert!(index < NUM_COLOR, "render target index {index} out of range");
        Self::from_bits_truncate(Self::COLOR_BUFFER_0.bits() << index)
    }
}

/// One color render target slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderTargetConfig {
    pub address: u64,
    /// Width in pixels, or the row pitch in bytes for pitch-linear targets
    pub width: u32,
    pub height: u32,
    /// Render target format code, see `oxidinx_hw::specs::render_target_format`
    pub format: u32,
    /// Block-linear when set, pitch-linear otherwise
    pub is_tiled: bool,
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
    /// Layers are depth slices of a 3D texture
    pub is_3d: bool,
    pub layers: u32,
}

/// Depth/stencil buffer configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZetaConfig {
    pub address: u64,
    /// Depth format code, see `oxidinx_hw::specs::depth_format`
    pub format: u32,
    pub is_tiled: bool,
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearBuffers {
    pub depth: bool,
    pub stencil: bool,
    /// RGBA write mask, bit 0 is red
    pub color_mask: u8,
    /// Color render target to clear
    pub rt: u32,
}

/// A texture bound for sampling by the current draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundTexture {
    pub tic: TicEntry,
    pub entry: SamplerEntry,
}

#[derive(Debug, Clone, Default)]
pub struct Regs {
    pub rt: [RenderTargetConfig; NUM_COLOR],
    pub rt_count: u32,
    pub zeta: ZetaConfig,
    pub zeta_enable: bool,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub clear_buffers: ClearBuffers,
    pub textures: Vec<BoundTexture>,
    pub vertex_count: u32,
    pub index_count: u32,
    pub instance_count: u32,
}

pub struct Maxwell3D {
    regs: Mutex<Regs>,
    dirty: AtomicU32,
}

impl Maxwell3D {
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(Regs::default()),
            // Everything has to be resolved once
            dirty: AtomicU32::new(DirtyFlags::all().bits()),
        }
    }

    pub fn regs(&self) -> MutexGuard<'_, Regs> {
        self.regs.lock()
    }

    pub fn set_render_target(&self, index: usize, config: RenderTargetConfig) {
        let flags = DirtyFlags::color_buffer(index) | DirtyFlags::RENDER_TARGETS;
        self.regs.lock().rt[index] = config;
        self.mark_dirty(flags);
    }

    pub fn set_render_target_count(&self, count: u32) {
        self.regs.lock().rt_count = count.min(NUM_COLOR as u32);
        self.mark_dirty(DirtyFlags::COLOR_BUFFERS | DirtyFlags::RENDER_TARGETS);
    }

    pub fn set_zeta(&self, config: ZetaConfig, enable: bool) {
        {
            let mut regs = self.regs.lock();
            regs.zeta = config;
            regs.zeta_enable = enable;
        }
        self.mark_dirty(DirtyFlags::ZETA_BUFFER | DirtyFlags::RENDER_TARGETS);
    }

    pub fn mark_dirty(&self, flags: DirtyFlags) {
        self.dirty.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn is_dirty(&self, flags: DirtyFlags) -> bool {
        self.dirty.load(Ordering::Acquire) & flags.bits() != 0
    }

    /// Clear `flags`, returning whether any of them was set.
    pub fn test_and_clear(&self, flags: DirtyFlags) -> bool {
        self.dirty.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }
}

impl Default for Maxwell3D {
    fn default() -> Self {
        Self::new()
    }
}
