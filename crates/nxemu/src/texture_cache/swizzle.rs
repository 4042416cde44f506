//! Block-linear (GOB) swizzling.
//!
//! Guest textures are stored as blocks of GOBs. A GOB is 64 bytes by 8 rows;
//! inside it, bytes are interleaved according to [`gob_offset`]. Blocks stack
//! `1 << block_height` GOBs vertically and `1 << block_depth` deep, and are laid
//! out row-major across the surface.

use oxidinx_hw::specs::block_linear::{
    GOB_SIZE_SHIFT, GOB_SIZE_X, GOB_SIZE_X_SHIFT, GOB_SIZE_Y, GOB_SIZE_Y_SHIFT, GOB_SIZE_Z_SHIFT,
};

/// Byte offset of `(x, y)` inside one GOB, `x` in bytes.
pub const fn gob_offset(x: u32, y: u32) -> u32 {
    ((x % 64) / 32) * 256 + ((y % 8) / 2) * 64 + ((x % 32) / 16) * 32 + (y % 2) * 16 + (x % 16)
}

const fn build_gob_table() -> [[u16; GOB_SIZE_X as usize]; GOB_SIZE_Y as usize] {
    let mut table = [[0u16; GOB_SIZE_X as usize]; GOB_SIZE_Y as usize];
    let mut y = 0;
    while y < GOB_SIZE_Y {
        let mut x = 0;
        while x < GOB_SIZE_X {
            table[y as usize][x as usize] = gob_offset(x, y) as u16;
            x += 1;
        }
        y += 1;
    }
    table
}

static GOB_TABLE: [[u16; GOB_SIZE_X as usize]; GOB_SIZE_Y as usize] = build_gob_table();

fn align_bits(value: u32, bits: u32) -> u32 {
    let mask = (1u32 << bits) - 1;
    (value + mask) & !mask
}

/// Guest size in bytes of one mip level; `width` and `height` are in format blocks.
pub fn calculate_size(
    tiled: bool,
    bytes_per_pixel: u32,
    width: u32,
    height: u32,
    depth: u32,
    block_height: u32,
    block_depth: u32,
) -> usize {
    if tiled {
        let aligned_width = align_bits(width * bytes_per_pixel, GOB_SIZE_X_SHIFT) as usize;
        let aligned_height = align_bits(height, GOB_SIZE_Y_SHIFT + block_height) as usize;
        let aligned_depth = align_bits(depth, GOB_SIZE_Z_SHIFT + block_depth) as usize;
        aligned_width * aligned_height * aligned_depth
    } else {
        (width * height * depth * bytes_per_pixel) as usize
    }
}

/// Geometry of one block-linear image, in format blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLinearLayout {
    pub bytes_per_pixel: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// log2 GOBs per block vertically
    pub block_height: u32,
    /// log2 GOBs per block in depth
    pub block_depth: u32,
    /// Row alignment multiplier in GOBs
    pub tile_width_spacing: u32,
}

impl BlockLinearLayout {
    fn stride(&self) -> u32 {
        let row = self.width * self.bytes_per_pixel;
        row.next_multiple_of(GOB_SIZE_X * self.tile_width_spacing.max(1))
    }

    /// Offset of every pixel in (tiled, linear) byte pairs, row major.
    fn for_each_pixel(&self, mut f: impl FnMut(usize, usize)) {
        let bpp = self.bytes_per_pixel;
        let pitch = (self.width * bpp) as usize;
        let gobs_in_x = self.stride().div_ceil(GOB_SIZE_X);
        let block_size = gobs_in_x << (GOB_SIZE_SHIFT + self.block_height + self.block_depth);
        let slice_size = self.height.div_ceil(GOB_SIZE_Y << self.block_height) * block_size;
        let block_height_mask = (1u32 << self.block_height) - 1;
        let block_depth_mask = (1u32 << self.block_depth) - 1;
        let x_shift = GOB_SIZE_SHIFT + self.block_height + self.block_depth;

        for z in 0..self.depth {
            let offset_z = (z >> self.block_depth) * slice_size
                + ((z & block_depth_mask) << (GOB_SIZE_SHIFT + self.block_height));
            for y in 0..self.height {
                let row = &GOB_TABLE[(y % GOB_SIZE_Y) as usize];
                let block_y = y >> GOB_SIZE_Y_SHIFT;
                let offset_y = (block_y >> self.block_height) * block_size
                    + ((block_y & block_height_mask) << GOB_SIZE_SHIFT);
                let linear_row = z as usize * pitch * self.height as usize + y as usize * pitch;
                for column in 0..self.width {
                    let x = column * bpp;
                    let offset_x = (x >> GOB_SIZE_X_SHIFT) << x_shift;
                    let tiled = offset_z + offset_y + offset_x + row[(x % GOB_SIZE_X) as usize] as u32;
                    f(tiled as usize, linear_row + x as usize);
                }
            }
        }
    }

    /// Convert tiled guest data to a tightly packed linear image.
    pub fn unswizzle(&self, linear: &mut [u8], tiled: &[u8]) {
        let bpp = self.bytes_per_pixel as usize;
        self.for_each_pixel(|t, l| {
            if let (Some(dst), Some(src)) = (linear.get_mut(l..l + bpp), tiled.get(t..t + bpp)) {
                dst.copy_from_slice(src);
            }
        });
    }

    /// Convert a tightly packed linear image to tiled guest data.
    pub fn swizzle(&self, tiled: &mut [u8], linear: &[u8]) {
        let bpp = self.bytes_per_pixel as usize;
        self.for_each_pixel(|t, l| {
            if let (Some(dst), Some(src)) = (tiled.get_mut(t..t + bpp), linear.get(l..l + bpp)) {
                dst.copy_from_slice(src);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gob_table_is_a_permutation() {
        let mut seen = [false; 512];
        for y in 0..GOB_SIZE_Y {
            for x in 0..GOB_SIZE_X {
                let offset = gob_offset(x, y) as usize;
                assert!(!seen[offset], "duplicate offset {offset}");
                seen[offset] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_known_gob_offsets() {
        assert_eq!(gob_offset(0, 0), 0);
        assert_eq!(gob_offset(4, 0), 4);
        assert_eq!(gob_offset(0, 1), 16);
        assert_eq!(gob_offset(16, 0), 32);
        assert_eq!(gob_offset(0, 2), 64);
        assert_eq!(gob_offset(32, 0), 256);
        assert_eq!(gob_offset(63, 7), 511);
    }

    #[test]
    fn test_calculate_size() {
        // 16x16 RGBA8, one GOB tall blocks: 64 bytes wide, 16 rows
        assert_eq!(calculate_size(true, 4, 16, 16, 1, 0, 0), 64 * 16);
        // block height 4 pads height to 128 rows
        assert_eq!(calculate_size(true, 4, 16, 16, 1, 4, 0), 64 * 128);
        assert_eq!(calculate_size(false, 4, 16, 16, 1, 4, 0), 16 * 16 * 4);
    }

    #[test]
    fn test_second_gob_row_follows_block() {
        // A 2 GOB wide surface with one-GOB blocks: the second GOB in x is the
        // next block, 512 bytes later.
        let layout = BlockLinearLayout {
            bytes_per_pixel: 4,
            width: 32,
            height: 8,
            depth: 1,
            block_height: 0,
            block_depth: 0,
            tile_width_spacing: 1,
        };
        let mut linear = vec![0u8; 32 * 8 * 4];
        linear[16 * 4] = 0xAB;
        let mut tiled = vec![0u8; calculate_size(true, 4, 32, 8, 1, 0, 0)];
        layout.swizzle(&mut tiled, &linear);
        assert_eq!(tiled[512], 0xAB);

        let mut back = vec![0u8; linear.len()];
        layout.unswizzle(&mut back, &tiled);
        assert_eq!(back, linear);
    }
}
