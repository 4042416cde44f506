/// Block-linear (GOB based) memory layout
///
/// A GOB ("group of bytes") is a 64 byte wide, 8 row tall tile. Blocks are
/// stacks of `1 << block_height` GOBs vertically and `1 << block_depth` deep.
pub mod block_linear {
    /// log2 of the GOB width in bytes
    pub const GOB_SIZE_X_SHIFT: u32 = 6;
    /// log2 of the GOB height in rows
    pub const GOB_SIZE_Y_SHIFT: u32 = 3;
    /// log2 of the GOB depth
    pub const GOB_SIZE_Z_SHIFT: u32 = 0;
    /// log2 of the GOB size in bytes
    pub const GOB_SIZE_SHIFT: u32 = GOB_SIZE_X_SHIFT + GOB_SIZE_Y_SHIFT + GOB_SIZE_Z_SHIFT;

    /// GOB width in bytes
    pub const GOB_SIZE_X: u32 = 1 << GOB_SIZE_X_SHIFT;
    /// GOB height in rows
    pub const GOB_SIZE_Y: u32 = 1 << GOB_SIZE_Y_SHIFT;
    /// GOB size in bytes (512)
    pub const GOB_SIZE: u32 = 1 << GOB_SIZE_SHIFT;

    /// Largest block dimension (log2 GOBs) the hardware accepts
    pub const MAX_BLOCK_SHIFT: u32 = 5;
}

/// Render target format codes as written by the guest into engine registers
pub mod render_target_format {
    pub const NONE: u32 = 0x0;
    pub const R32G32B32A32_FLOAT: u32 = 0xC0;
    pub const R16G16B16A16_UNORM: u32 = 0xC6;
    pub const R16G16B16A16_FLOAT: u32 = 0xCA;
    pub const R32G32_FLOAT: u32 = 0xCB;
    pub const B8G8R8A8_UNORM: u32 = 0xCF;
    pub const B8G8R8A8_SRGB: u32 = 0xD0;
    pub const A2B10G10R10_UNORM: u32 = 0xD1;
    pub const A8B8G8R8_UNORM: u32 = 0xD5;
    pub const A8B8G8R8_SRGB: u32 = 0xD6;
    pub const R16G16_UNORM: u32 = 0xDA;
    pub const R16G16_FLOAT: u32 = 0xDE;
    pub const B10G11R11_FLOAT: u32 = 0xE0;
    pub const R32_UINT: u32 = 0xE4;
    pub const R32_FLOAT: u32 = 0xE5;
    pub const R5G6B5_UNORM: u32 = 0xE8;
    pub const A1R5G5B5_UNORM: u32 = 0xE9;
    pub const R8G8_UNORM: u32 = 0xEA;
    pub const R16_UNORM: u32 = 0xEE;
    pub const R16_FLOAT: u32 = 0xF2;
    pub const R8_UNORM: u32 = 0xF3;
}

/// Depth buffer format codes
pub mod depth_format {
    pub const D32_FLOAT: u32 = 0xA;
    pub const D16_UNORM: u32 = 0x13;
    pub const S8_UINT_Z24_UNORM: u32 = 0x14;
    pub const D24X8_UNORM: u32 = 0x15;
    pub const D24S8_UNORM: u32 = 0x16;
    pub const D32_FLOAT_S8X24_UINT: u32 = 0x19;
}

/// Display framebuffer pixel formats (as handed to the presentation layer)
pub mod framebuffer_format {
    pub const A8B8G8R8_UNORM: u32 = 1;
    pub const RGB565_UNORM: u32 = 4;
    pub const B8G8R8A8_UNORM: u32 = 5;
}

/// Render target limits of the 3D engine
pub mod render_targets {
    /// Number of color render target slots
    pub const NUM_COLOR: usize = 8;
}

/// Texture descriptor (TIC) format codes
pub mod texture_format {
    pub const R32_G32_B32_A32: u32 = 0x01;
    pub const R16_G16_B16_A16: u32 = 0x03;
    pub const R32_G32: u32 = 0x04;
    pub const A8R8G8B8: u32 = 0x08;
    pub const A2B10G10R10: u32 = 0x09;
    pub const R16_G16: u32 = 0x0C;
    pub const R32: u32 = 0x0F;
    pub const A1B5G5R5: u32 = 0x14;
    pub const B5G6R5: u32 = 0x15;
    pub const BC7U: u32 = 0x17;
    pub const G8R8: u32 = 0x18;
    pub const R16: u32 = 0x1B;
    pub const R8: u32 = 0x1D;
    pub const BF10GF11RF11: u32 = 0x21;
    pub const DXT1: u32 = 0x24;
    pub const DXT23: u32 = 0x25;
    pub const DXT45: u32 = 0x26;
    pub const DXN1: u32 = 0x27;
    pub const DXN2: u32 = 0x28;
    pub const S8Z24: u32 = 0x29;
    pub const ZF32: u32 = 0x2F;
    pub const ZF32_X24S8: u32 = 0x30;
    pub const Z16: u32 = 0x3A;
    pub const ASTC_2D_4X4: u32 = 0x40;
}

/// Per-component numeric interpretation in a texture descriptor
pub mod component_type {
    pub const SNORM: u32 = 1;
    pub const UNORM: u32 = 2;
    pub const SINT: u32 = 3;
    pub const UINT: u32 = 4;
    pub const FLOAT: u32 = 7;
}

/// Texture dimensionality codes in a texture descriptor
pub mod texture_type {
    pub const TEXTURE_1D: u32 = 0;
    pub const TEXTURE_2D: u32 = 1;
    pub const TEXTURE_3D: u32 = 2;
    pub const TEXTURE_CUBEMAP: u32 = 3;
    pub const TEXTURE_1D_ARRAY: u32 = 4;
    pub const TEXTURE_2D_ARRAY: u32 = 5;
    pub const TEXTURE_1D_BUFFER: u32 = 6;
    pub const TEXTURE_2D_NO_MIPMAP: u32 = 7;
    pub const TEXTURE_CUBE_ARRAY: u32 = 8;
}

/// Host1x synchronization points
pub mod syncpoints {
    /// Number of hardware syncpoint counters
    pub const MAX_SYNCPOINTS: usize = 192;
}
