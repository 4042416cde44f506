//! Fermi 2D engine (NV class 902D).
//!
//! The engine is a flat register file. Writing the high word of the 64-bit
//! `BLIT_SRC_Y` register starts a scaled surface copy, which is clipped to both
//! surfaces and handed to the rasterizer.

use crate::rasterizer::RasterizerInterface;
use oxidinx_hw::mmio::fermi_2d::{NUM_REGS, operation, registers, surface};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Where sample positions are taken from inside a pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Center,
    Corner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    PointSample,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SrcCopyAnd,
    RopAnd,
    Blend,
    SrcCopy,
    Rop,
    SrcCopyPremult,
    BlendPremult,
    Unknown(u32),
}

impl From<u32> for Operation {
    fn from(value: u32) -> Self {
        match value {
            operation::SRC_COPY_AND => Operation::SrcCopyAnd,
            operation::ROP_AND => Operation::RopAnd,
            operation::BLEND => Operation::Blend,
            operation::SRC_COPY => Operation::SrcCopy,
            operation::ROP => Operation::Rop,
            operation::SRC_COPY_PREMULT => Operation::SrcCopyPremult,
            operation::BLEND_PREMULT => Operation::BlendPremult,
            other => Operation::Unknown(other),
        }
    }
}

/// Axis-aligned rectangle, right and bottom exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.right.wrapping_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.wrapping_sub(self.top)
    }
}

/// A resolved blit request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub operation: Operation,
    pub filter: Filter,
    pub src_rect: Rect,
    pub dst_rect: Rect,
}

/// Surface descriptor as programmed into the `SRC` or `DST` register block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Surface {
    /// Render target format code
    pub format: u32,
    pub linear: bool,
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
    pub depth: u32,
    pub layer: u32,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub address_high: u32,
    pub address_low: u32,
}

impl Surface {
    fn decode(words: &[u32]) -> Self {
        let word = |offset: u32| words[offset as usize];
        let block = word(surface::BLOCK);
        Self {
            format: word(surface::FORMAT),
            linear: word(surface::LINEAR) & 1 != 0,
            block_width: block & 0xF,
            block_height: (block >> 4) & 0xF,
            block_depth: (block >> 8) & 0xF,
            depth: word(surface::DEPTH),
            layer: word(surface::LAYER),
            pitch: word(surface::PITCH),
            width: word(surface::WIDTH),
            height: word(surface::HEIGHT),
            address_high: word(surface::ADDRESS_HIGH),
            address_low: word(surface::ADDRESS_LOW),
        }
    }

    pub fn address(&self) -> u64 {
        ((self.address_high as u64) << 32) | self.address_low as u64
    }
}

/// Shorten a blit line so it stays inside a surface of `src_line` pixels.
///
/// Returns the matching destination length and how far the source overshot.
fn delimit_line(src_1: u32, src_2: u32, dst_1: u32, dst_2: u32, src_line: u32) -> (u32, u32) {
    let line_a = src_2.wrapping_sub(src_1);
    let line_b = dst_2.wrapping_sub(dst_1);
    let excess = (line_a.wrapping_sub(src_line).wrapping_add(src_1) as i32).max(0) as u32;
    if line_a == 0 {
        return (line_b, excess);
    }
    let scaled = (excess as u64 * line_b as u64 / line_a as u64) as u32;
    (line_b.wrapping_sub(scaled), excess)
}

pub struct Fermi2D {
    regs: Box<[u32; NUM_REGS]>,
    rasterizer: Option<Arc<dyn RasterizerInterface>>,
}

impl Fermi2D {
    pub fn new() -> Self {
        Self {
            regs: Box::new([0; NUM_REGS]),
            rasterizer: None,
        }
    }

    pub fn bind_rasterizer(&mut self, rasterizer: Arc<dyn RasterizerInterface>) {
        self.rasterizer = Some(rasterizer);
    }

    pub fn reg(&self, method: u32) -> u32 {
        self.regs[method as usize]
    }

    fn reg64(&self, method: u32) -> u64 {
        ((self.reg(method + 1) as u64) << 32) | self.reg(method) as u64
    }

    pub fn src(&self) -> Surface {
        let start = registers::SRC as usize;
        Surface::decode(&self.regs[start..start + surface::WORDS as usize])
    }

    pub fn dst(&self) -> Surface {
        let start = registers::DST as usize;
        Surface::decode(&self.regs[start..start + surface::WORDS as usize])
    }

    pub fn operation(&self) -> Operation {
        Operation::from(self.reg(registers::OPERATION))
    }

    pub fn origin(&self) -> Origin {
        if self.reg(registers::BLIT_CONTROL) & 1 != 0 {
            Origin::Corner
        } else {
            Origin::Center
        }
    }

    pub fn filter(&self) -> Filter {
        if (self.reg(registers::BLIT_CONTROL) >> 4) & 1 != 0 {
            Filter::Linear
        } else {
            Filter::PointSample
        }
    }

    /// Write one register. Panics when `method` is outside the register file.
    pub fn call_method(&mut self, method: u32, value: u32, is_last_call: bool) {
        assert!(
            (method as usize) < NUM_REGS,
            "Invalid Fermi2D register {method:#x}"
        );
        trace!("reg[{:#x}] = {:#x} (last={})", method, value, is_last_call);
        self.regs[method as usize] = value;

        if method == registers::BLIT_TRIGGER {
            self.handle_surface_copy();
        }
    }

    /// Apply `values` to the same method, as an array write.
    pub fn call_multi_method(&mut self, method: u32, values: &[u32], methods_pending: u32) {
        for (i, &value) in values.iter().enumerate() {
            let is_last = methods_pending.wrapping_sub(i as u32) <= 1;
            self.call_method(method, value, is_last);
        }
    }

    /// Compute the clipped blit rectangles for the current register state.
    pub fn surface_copy_config(&self) -> Config {
        let src = self.src();
        let dst = self.dst();
        let dst_x = self.reg(registers::BLIT_DST_X);
        let dst_y = self.reg(registers::BLIT_DST_Y);
        let dst_width = self.reg(registers::BLIT_DST_WIDTH);
        let dst_height = self.reg(registers::BLIT_DST_HEIGHT);
        let du_dx = self.reg64(registers::BLIT_DU_DX) as i64;
        let dv_dy = self.reg64(registers::BLIT_DV_DY) as i64;
        let src_x = self.reg64(registers::BLIT_SRC_X) as i64;
        let src_y = self.reg64(registers::BLIT_SRC_Y) as i64;

        let src_x1 = (src_x >> 32) as u32;
        let src_y1 = (src_y >> 32) as u32;
        let (mut src_x2, mut src_y2) = match self.origin() {
            Origin::Corner => (
                (src_x.wrapping_add(du_dx.wrapping_mul(dst_width as i64)) >> 32) as u32,
                (src_y.wrapping_add(dv_dy.wrapping_mul(dst_height as i64)) >> 32) as u32,
            ),
            Origin::Center => (
                src_x1.wrapping_add(dst_width),
                src_y1.wrapping_add(dst_height),
            ),
        };
        let mut dst_x2 = dst_x.wrapping_add(dst_width);
        let mut dst_y2 = dst_y.wrapping_add(dst_height);

        // Clip against the source surface first
        let (new_dst_w, src_excess_x) = delimit_line(src_x1, src_x2, dst_x, dst_x2, src.width);
        let (new_dst_h, src_excess_y) = delimit_line(src_y1, src_y2, dst_y, dst_y2, src.height);
        dst_x2 = dst_x.wrapping_add(new_dst_w);
        src_x2 = src_x2.wrapping_sub(src_excess_x);
        dst_y2 = dst_y.wrapping_add(new_dst_h);
        src_y2 = src_y2.wrapping_sub(src_excess_y);

        // then against the destination
        let (new_src_w, dst_excess_x) = delimit_line(dst_x, dst_x2, src_x1, src_x2, dst.width);
        let (new_src_h, dst_excess_y) = delimit_line(dst_y, dst_y2, src_y1, src_y2, dst.height);
        src_x2 = src_x1.wrapping_add(new_src_w);
        dst_x2 = dst_x2.wrapping_sub(dst_excess_x);
        src_y2 = src_y1.wrapping_add(new_src_h);
        dst_y2 = dst_y2.wrapping_sub(dst_excess_y);

        Config {
            operation: self.operation(),
            filter: self.filter(),
            src_rect: Rect {
                left: src_x1,
                top: src_y1,
                right: src_x2,
                bottom: src_y2,
            },
            dst_rect: Rect {
                left: dst_x,
                top: dst_y,
                right: dst_x2,
                bottom: dst_y2,
            },
        }
    }

    fn handle_surface_copy(&mut self) {
        let operation = self.operation();
        debug!("Requested a surface copy with operation {:?}", operation);
        if operation != Operation::SrcCopy {
            warn!("Unimplemented blit operation {:?}, skipping copy", operation);
            return;
        }

        let config = self.surface_copy_config();
        let (src, dst) = (self.src(), self.dst());
        let Some(rasterizer) = &self.rasterizer else {
            error!("Surface copy requested without a bound rasterizer");
            return;
        };
        if !rasterizer.accelerate_surface_copy(&src, &dst, &config) {
            error!(
                "Surface copy {:#x} -> {:#x} was not accelerated",
                src.address(),
                dst.address()
            );
        }
    }
}

impl Default for Fermi2D {
    fn default() -> Self {
        Self::new()
    }
}
