//! Fermi 2D engine (NV class 902D) register file layout.
//!
//! Register indices are in units of 32-bit words (method numbers).
//!
//! # References
//! - <https://github.com/envytools/envytools/blob/master/rnndb/graph/nv_2d.xml>

/// NV device class of the 2D engine
pub const CLASS_ID: u32 = 0x902D;

/// Number of 32-bit registers exposed by the engine
pub const NUM_REGS: usize = 0x258;

/// Register indices
pub mod registers {
    /// First word of the destination surface descriptor
    pub const DST: u32 = 0x80;

    /// First word of the source surface descriptor
    pub const SRC: u32 = 0x8C;

    /// Blit raster operation
    pub const OPERATION: u32 = 0xAB;

    /// Blit control (bit 0: origin, bit 4: filter)
    pub const BLIT_CONTROL: u32 = 0x223;

    /// Destination rectangle origin X
    pub const BLIT_DST_X: u32 = 0x22C;
    /// Destination rectangle origin Y
    pub const BLIT_DST_Y: u32 = 0x22D;
    /// Destination rectangle width
    pub const BLIT_DST_WIDTH: u32 = 0x22E;
    /// Destination rectangle height
    pub const BLIT_DST_HEIGHT: u32 = 0x22F;

    /// Source X step per destination pixel (32.32 fixed point, two words)
    pub const BLIT_DU_DX: u32 = 0x230;
    /// Source Y step per destination pixel (32.32 fixed point, two words)
    pub const BLIT_DV_DY: u32 = 0x232;
    /// Source rectangle origin X (32.32 fixed point, two words)
    pub const BLIT_SRC_X: u32 = 0x234;
    /// Source rectangle origin Y (32.32 fixed point, two words)
    pub const BLIT_SRC_Y: u32 = 0x236;

    /// Writing the high word of `BLIT_SRC_Y` starts the blit
    pub const BLIT_TRIGGER: u32 = BLIT_SRC_Y + 1;
}

/// Word offsets inside a surface descriptor (relative to `DST` or `SRC`)
pub mod surface {
    /// Render target format code
    pub const FORMAT: u32 = 0;
    /// Bit 0 set when the surface is pitch-linear
    pub const LINEAR: u32 = 1;
    /// Block dimensions (log2 GOBs): width bits 0-3, height 4-7, depth 8-11
    pub const BLOCK: u32 = 2;
    pub const DEPTH: u32 = 3;
    pub const LAYER: u32 = 4;
    /// Row pitch in bytes for linear surfaces
    pub const PITCH: u32 = 5;
    pub const WIDTH: u32 = 6;
    pub const HEIGHT: u32 = 7;
    pub const ADDRESS_HIGH: u32 = 8;
    pub const ADDRESS_LOW: u32 = 9;
    /// Number of words in a surface descriptor
    pub const WORDS: u32 = 10;
}

/// Values of the `OPERATION` register
pub mod operation {
    pub const SRC_COPY_AND: u32 = 0;
    pub const ROP_AND: u32 = 1;
    pub const BLEND: u32 = 2;
    pub const SRC_COPY: u32 = 3;
    pub const ROP: u32 = 4;
    pub const SRC_COPY_PREMULT: u32 = 5;
    pub const BLEND_PREMULT: u32 = 6;
}
