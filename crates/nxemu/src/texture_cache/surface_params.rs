//! Immutable surface descriptors and their guest/host memory geometry.

use super::format::{PixelFormat, SurfaceTarget, SurfaceType};
use super::swizzle;
use super::tic::{ImageEntry, ImageType, SamplerEntry, TextureType, TicEntry};
use crate::engines::fermi_2d;
use crate::engines::maxwell_3d::Regs;
use oxidinx_hw::specs::block_linear::{GOB_SIZE, GOB_SIZE_SHIFT, MAX_BLOCK_SHIFT};
use oxidinx_hw::specs::render_target_format;
use std::hash::{Hash, Hasher};
use tracing::{error, warn};

/// How closely a cached surface's tiling class matches a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTopologyResult {
    FullMatch,
    /// Same tiling and pixel size, but only one side is block compressed
    CompressUnmatch,
    None,
}

/// How closely a cached surface's size and layout match a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStructureResult {
    FullMatch,
    /// Same memory footprint, different logical width
    SemiMatch,
    None,
}

/// Everything needed to size, key and compare a cached surface.
///
/// Equality and hashing ignore `srgb_conversion`, `is_layered` and
/// `emulated_levels`: surfaces differing only there share storage.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceParams {
    pub is_tiled: bool,
    pub srgb_conversion: bool,
    pub is_layered: bool,
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
    pub tile_width_spacing: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub pitch: u32,
    pub num_levels: u32,
    pub emulated_levels: u32,
    pub pixel_format: PixelFormat,
    pub surface_type: SurfaceType,
    pub target: SurfaceTarget,
}

impl PartialEq for SurfaceParams {
    fn eq(&self, rhs: &Self) -> bool {
        self.key() == rhs.key()
    }
}

impl Eq for SurfaceParams {}

impl Hash for SurfaceParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

type ParamsKey = (
    bool,
    [u32; 9],
    PixelFormat,
    SurfaceType,
    SurfaceTarget,
);

fn texture_type_to_target(texture_type: TextureType, is_array: bool) -> SurfaceTarget {
    match (texture_type, is_array) {
        (TextureType::Texture1D, false) => SurfaceTarget::Texture1D,
        (TextureType::Texture1D, true) => SurfaceTarget::Texture1DArray,
        (TextureType::Texture2D, false) => SurfaceTarget::Texture2D,
        (TextureType::Texture2D, true) => SurfaceTarget::Texture2DArray,
        (TextureType::Texture3D, is_array) => {
            if is_array {
                error!("3D textures cannot be arrays");
            }
            SurfaceTarget::Texture3D
        }
        (TextureType::TextureCube, false) => SurfaceTarget::TextureCubemap,
        (TextureType::TextureCube, true) => SurfaceTarget::TextureCubeArray,
    }
}

fn image_type_to_target(image_type: ImageType) -> SurfaceTarget {
    match image_type {
        ImageType::Texture1D => SurfaceTarget::Texture1D,
        ImageType::TextureBuffer => SurfaceTarget::TextureBuffer,
        ImageType::Texture1DArray => SurfaceTarget::Texture1DArray,
        ImageType::Texture2D => SurfaceTarget::Texture2D,
        ImageType::Texture2DArray => SurfaceTarget::Texture2DArray,
        ImageType::Texture3D => SurfaceTarget::Texture3D,
    }
}

/// Ceiling of log2, with `log2_ceil(0) == log2_ceil(1) == 0`
pub(crate) fn log2_ceil(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        u32::BITS - (value - 1).leading_zeros()
    }
}

fn align_bits(value: usize, bits: u32) -> usize {
    let mask = (1usize << bits) - 1;
    (value + mask) & !mask
}

fn mipmap_blocks(mip_size: u32, tile: u32) -> u32 {
    mip_size.div_ceil(tile).max(1)
}

impl SurfaceParams {
    fn key(&self) -> ParamsKey {
        (
            self.is_tiled,
            [
                self.block_width,
                self.block_height,
                self.block_depth,
                self.tile_width_spacing,
                self.width,
                self.height,
                self.depth,
                self.pitch,
                self.num_levels,
            ],
            self.pixel_format,
            self.surface_type,
            self.target,
        )
    }

    fn from_tic(tic: &TicEntry) -> Self {
        let is_tiled = tic.is_tiled();
        let srgb_conversion = tic.srgb_conversion;
        let pixel_format = PixelFormat::from_texture_format(tic.format, srgb_conversion, tic.r_type);
        Self {
            is_tiled,
            srgb_conversion,
            is_layered: false,
            block_width: if is_tiled { tic.block_width } else { 0 },
            block_height: if is_tiled { tic.block_height } else { 0 },
            block_depth: if is_tiled { tic.block_depth } else { 0 },
            tile_width_spacing: if is_tiled { 1 << tic.tile_width_spacing } else { 1 },
            width: tic.width,
            height: 1,
            depth: 1,
            pitch: 0,
            num_levels: 1,
            emulated_levels: 1,
            pixel_format,
            surface_type: pixel_format.surface_type(),
            target: SurfaceTarget::TextureBuffer,
        }
    }

    /// Fill in the dimensions shared by texture and image descriptors.
    fn apply_tic_dimensions(&mut self, tic: &TicEntry) {
        if tic.is_buffer() {
            self.target = SurfaceTarget::TextureBuffer;
            self.width = tic.width;
            self.pitch = self.width * self.bytes_per_pixel();
            self.height = 1;
            self.depth = 1;
            self.num_levels = 1;
            self.emulated_levels = 1;
            self.is_layered = false;
            return;
        }
        self.width = tic.width;
        self.height = tic.height;
        self.depth = tic.depth;
        self.pitch = if self.is_tiled { 0 } else { tic.pitch };
        if self.target.is_cube() {
            self.depth *= 6;
        }
        self.num_levels = tic.max_mip_level + 1;
        self.emulated_levels = self.num_levels.min(self.max_possible_mipmap());
        self.is_layered = self.target.is_layered();
    }

    /// Parameters for a texture sampled through `entry`.
    pub fn create_for_texture(tic: &TicEntry, entry: &SamplerEntry) -> Self {
        let mut params = Self::from_tic(tic);
        if entry.is_shadow && params.surface_type == SurfaceType::ColorTexture {
            match params.pixel_format {
                PixelFormat::R16Unorm | PixelFormat::R16Float => {
                    params.pixel_format = PixelFormat::D16Unorm;
                }
                PixelFormat::R32Float => params.pixel_format = PixelFormat::D32Float,
                other => warn!("Unimplemented shadow convert format {:?}", other),
            }
            params.surface_type = params.pixel_format.surface_type();
        }
        params.target = texture_type_to_target(entry.texture_type, entry.is_array);
        params.apply_tic_dimensions(tic);
        params
    }

    /// Parameters for a texture bound as a shader image.
    pub fn create_for_image(tic: &TicEntry, entry: &ImageEntry) -> Self {
        let mut params = Self::from_tic(tic);
        params.target = image_type_to_target(entry.image_type);
        params.apply_tic_dimensions(tic);
        params
    }

    /// Parameters for the bound depth buffer.
    pub fn create_for_depth_buffer(regs: &Regs) -> Self {
        let zeta = &regs.zeta;
        let block_depth = zeta.block_depth.min(MAX_BLOCK_SHIFT);
        let is_layered = zeta.layers > 1 && block_depth == 0;
        let pixel_format = PixelFormat::from_depth_format(zeta.format);
        Self {
            is_tiled: zeta.is_tiled,
            srgb_conversion: false,
            is_layered,
            block_width: zeta.block_width.min(MAX_BLOCK_SHIFT),
            block_height: zeta.block_height.min(MAX_BLOCK_SHIFT),
            block_depth,
            tile_width_spacing: 1,
            width: zeta.width,
            height: zeta.height,
            depth: if is_layered { zeta.layers } else { 1 },
            pitch: 0,
            num_levels: 1,
            emulated_levels: 1,
            pixel_format,
            surface_type: pixel_format.surface_type(),
            target: if is_layered {
                SurfaceTarget::Texture2DArray
            } else {
                SurfaceTarget::Texture2D
            },
        }
    }

    /// Parameters for color render target `index`.
    pub fn create_for_framebuffer(regs: &Regs, index: usize) -> Self {
        let config = &regs.rt[index];
        let pixel_format = PixelFormat::from_render_target_format(config.format);
        let (pitch, width) = if config.is_tiled {
            (0, config.width)
        } else {
            let bpp = pixel_format.bytes_per_pixel().max(1);
            (config.width, config.width / bpp)
        };
        let (depth, is_layered, target) = if config.is_3d {
            (config.layers, false, SurfaceTarget::Texture3D)
        } else if config.layers > 1 {
            (config.layers, true, SurfaceTarget::Texture2DArray)
        } else {
            (1, false, SurfaceTarget::Texture2D)
        };
        Self {
            is_tiled: config.is_tiled,
            srgb_conversion: matches!(
                config.format,
                render_target_format::B8G8R8A8_SRGB | render_target_format::A8B8G8R8_SRGB
            ),
            is_layered,
            block_width: config.block_width.min(MAX_BLOCK_SHIFT),
            block_height: config.block_height.min(MAX_BLOCK_SHIFT),
            block_depth: config.block_depth.min(MAX_BLOCK_SHIFT),
            tile_width_spacing: 1,
            width,
            height: config.height,
            depth,
            pitch,
            num_levels: 1,
            emulated_levels: 1,
            pixel_format,
            surface_type: pixel_format.surface_type(),
            target,
        }
    }

    /// Parameters for a 2D engine source or destination surface.
    pub fn create_for_fermi_copy_surface(config: &fermi_2d::Surface) -> Self {
        let is_tiled = !config.linear;
        let pixel_format = PixelFormat::from_render_target_format(config.format);
        let block = |value: u32| if is_tiled { value.min(MAX_BLOCK_SHIFT) } else { 0 };
        Self {
            is_tiled,
            srgb_conversion: matches!(
                config.format,
                render_target_format::B8G8R8A8_SRGB | render_target_format::A8B8G8R8_SRGB
            ),
            is_layered: false,
            block_width: block(config.block_width),
            block_height: block(config.block_height),
            block_depth: block(config.block_depth),
            tile_width_spacing: 1,
            width: config.width,
            height: config.height,
            depth: 1,
            pitch: config.pitch,
            num_levels: 1,
            emulated_levels: 1,
            pixel_format,
            surface_type: pixel_format.surface_type(),
            target: SurfaceTarget::Texture2D,
        }
    }

    pub fn expected_target(entry: &SamplerEntry) -> SurfaceTarget {
        texture_type_to_target(entry.texture_type, entry.is_array)
    }

    pub fn expected_image_target(entry: &ImageEntry) -> SurfaceTarget {
        image_type_to_target(entry.image_type)
    }

    // --------------------------------------------------------------------------------------------
    // Format shorthands
    // --------------------------------------------------------------------------------------------

    pub fn bits_per_pixel(&self) -> u32 {
        self.pixel_format.bits_per_pixel()
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.pixel_format.bytes_per_pixel()
    }

    pub fn default_block_width(&self) -> u32 {
        self.pixel_format.default_block_width()
    }

    pub fn default_block_height(&self) -> u32 {
        self.pixel_format.default_block_height()
    }

    pub fn is_compressed(&self) -> bool {
        self.pixel_format.is_compressed()
    }

    pub fn is_pixel_format_zeta(&self) -> bool {
        self.pixel_format.is_depth_stencil()
    }

    pub fn is_buffer(&self) -> bool {
        self.target == SurfaceTarget::TextureBuffer
    }

    pub fn num_layers(&self) -> u32 {
        if self.is_layered { self.depth } else { 1 }
    }

    pub fn target_name(&self) -> &'static str {
        match self.target {
            SurfaceTarget::Texture1D => "1D",
            SurfaceTarget::TextureBuffer => "TexBuffer",
            SurfaceTarget::Texture2D => "2D",
            SurfaceTarget::Texture3D => "3D",
            SurfaceTarget::Texture1DArray => "1DArray",
            SurfaceTarget::Texture2DArray => "2DArray",
            SurfaceTarget::TextureCubemap => "Cube",
            SurfaceTarget::TextureCubeArray => "CubeArray",
        }
    }

    // --------------------------------------------------------------------------------------------
    // Mip geometry
    // --------------------------------------------------------------------------------------------

    pub fn mip_width(&self, level: u32) -> u32 {
        (self.width >> level).max(1)
    }

    pub fn mip_height(&self, level: u32) -> u32 {
        (self.height >> level).max(1)
    }

    pub fn mip_depth(&self, level: u32) -> u32 {
        if self.is_layered {
            self.depth
        } else {
            (self.depth >> level).max(1)
        }
    }

    /// Block height of a mip level, shrunk to fit the level (nouveau's
    /// auto-resizing rule).
    pub fn mip_block_height(&self, level: u32) -> u32 {
        if level == 0 {
            return self.block_height;
        }
        let blocks_in_y = self.mip_height(level).div_ceil(self.default_block_height());
        log2_ceil(blocks_in_y).clamp(3, 7) - 3
    }

    pub fn mip_block_depth(&self, level: u32) -> u32 {
        if level == 0 {
            return self.block_depth;
        }
        if self.is_layered {
            return 0;
        }
        let block_depth = log2_ceil(self.mip_depth(level));
        if block_depth > 4 {
            return 5 - (self.mip_block_height(level) >= 2) as u32;
        }
        block_depth
    }

    /// Number of mip levels a host texture of this size can hold
    pub fn max_possible_mipmap(&self) -> u32 {
        let max_w = log2_ceil(self.width) + 1;
        let max_h = log2_ceil(self.height) + 1;
        let max_mipmap = max_w.max(max_h);
        if self.target != SurfaceTarget::Texture3D {
            return max_mipmap;
        }
        max_mipmap.max(log2_ceil(self.depth) + 1)
    }

    /// Width padded to a whole GOB row
    pub fn block_aligned_width(&self) -> u32 {
        self.width.next_multiple_of(64 / self.bytes_per_pixel().max(1))
    }

    fn inner_mipmap_memory_size(&self, level: u32, as_host_size: bool) -> usize {
        let width = mipmap_blocks(self.mip_width(level), self.default_block_width());
        let height = mipmap_blocks(self.mip_height(level), self.default_block_height());
        let depth = if self.is_layered { 1 } else { self.mip_depth(level) };
        if self.is_tiled {
            swizzle::calculate_size(
                !as_host_size,
                self.bytes_per_pixel(),
                width,
                height,
                depth,
                self.mip_block_height(level),
                self.mip_block_depth(level),
            )
        } else if as_host_size || self.is_buffer() {
            (self.bytes_per_pixel() * width * height * depth) as usize
        } else {
            self.pitch as usize * height as usize * depth as usize
        }
    }

    fn layer_size(&self, as_host_size: bool) -> usize {
        let size: usize = (0..self.num_levels)
            .map(|level| self.inner_mipmap_memory_size(level, as_host_size))
            .sum();
        if self.is_tiled && self.is_layered {
            return Self::align_layered(size, self.block_height, self.block_depth);
        }
        size
    }

    pub fn guest_size_in_bytes(&self) -> usize {
        self.layer_size(false) * self.num_layers() as usize
    }

    pub fn host_size_in_bytes(&self) -> usize {
        self.layer_size(true) * self.num_layers() as usize
    }

    pub fn guest_layer_size(&self) -> usize {
        self.layer_size(false)
    }

    pub fn guest_mipmap_size(&self, level: u32) -> usize {
        self.inner_mipmap_memory_size(level, false)
    }

    pub fn host_mipmap_size(&self, level: u32) -> usize {
        self.inner_mipmap_memory_size(level, true) * self.num_layers() as usize
    }

    /// Size of one layer of `level` in host memory; 3D surfaces have no layers.
    pub fn host_layer_size(&self, level: u32) -> usize {
        assert!(
            self.target != SurfaceTarget::Texture3D,
            "3D surfaces are addressed by slice"
        );
        self.inner_mipmap_memory_size(level, true)
    }

    /// Size of one 2D slice (layer or depth slice) of `level` in host memory
    pub fn host_slice_size(&self, level: u32) -> usize {
        let width = mipmap_blocks(self.mip_width(level), self.default_block_width());
        let height = mipmap_blocks(self.mip_height(level), self.default_block_height());
        (width * height * self.bytes_per_pixel()) as usize
    }

    pub fn guest_mipmap_level_offset(&self, level: u32) -> usize {
        (0..level).map(|i| self.inner_mipmap_memory_size(i, false)).sum()
    }

    pub fn host_mipmap_level_offset(&self, level: u32) -> usize {
        (0..level).map(|i| self.host_mipmap_size(i)).sum()
    }

    // --------------------------------------------------------------------------------------------
    // Block-linear addressing
    // --------------------------------------------------------------------------------------------

    /// Bytes in one block
    pub fn block_size(&self) -> u32 {
        let x = 64 << self.block_width;
        let y = 8 << self.block_height;
        let z = 1 << self.block_depth;
        x * y * z
    }

    /// Pixel extent of one block in x and y
    pub fn block_xy(&self) -> (u32, u32) {
        let x_pixels = 64 / self.bytes_per_pixel().max(1);
        (x_pixels << self.block_width, 8 << self.block_height)
    }

    /// Pixel coordinates of the GOB at byte `offset` into the surface.
    pub fn block_offset_xyz(&self, offset: u32) -> (u32, u32, u32) {
        let block_size = self.block_size();
        let block_index = offset / block_size;
        let gob_index = (offset % block_size) / GOB_SIZE;
        let x_block_pixels = (64 / self.bytes_per_pixel().max(1)) << self.block_width;
        let y_block_pixels = 8 << self.block_height;
        let z_block_pixels = 1 << self.block_depth;
        let x_blocks = self.width.div_ceil(x_block_pixels).max(1);
        let y_blocks = self.height.div_ceil(y_block_pixels).max(1);
        let z_blocks = self.depth.div_ceil(z_block_pixels).max(1);
        let base_x = block_index % x_blocks;
        let base_y = (block_index / x_blocks) % y_blocks;
        let base_z = (block_index / (x_blocks * y_blocks)) % z_blocks;
        let x = base_x * x_block_pixels;
        let y = base_y * y_block_pixels + (gob_index * 8) % y_block_pixels;
        let z = base_z * z_block_pixels + (gob_index >> self.block_height);
        (x, y, z)
    }

    pub fn align_layered(size: usize, block_height: u32, block_depth: u32) -> usize {
        align_bits(size, GOB_SIZE_SHIFT + block_height + block_depth)
    }

    // --------------------------------------------------------------------------------------------
    // Cross-format helpers
    // --------------------------------------------------------------------------------------------

    /// Express `width` of `from` texels in units of `to` texels.
    pub fn convert_width(width: u32, from: PixelFormat, to: PixelFormat) -> u32 {
        let bw1 = from.default_block_width();
        let bw2 = to.default_block_width();
        (width * bw2).div_ceil(bw1)
    }

    pub fn convert_height(height: u32, from: PixelFormat, to: PixelFormat) -> u32 {
        let bh1 = from.default_block_height();
        let bh2 = to.default_block_height();
        (height * bh2).div_ceil(bh1)
    }

    /// Widest region a copy between two mip levels of different formats can cover.
    pub fn intersect_width(src: &Self, dst: &Self, src_level: u32, dst_level: u32) -> u32 {
        let bw1 = src.default_block_width();
        let bw2 = dst.default_block_width();
        let t_src = (src.mip_width(src_level) * bw2).div_ceil(bw1);
        let t_dst = (dst.mip_width(dst_level) * bw1).div_ceil(bw2);
        t_src.min(t_dst)
    }

    pub fn intersect_height(src: &Self, dst: &Self, src_level: u32, dst_level: u32) -> u32 {
        let bh1 = src.default_block_height();
        let bh2 = dst.default_block_height();
        let t_src = (src.mip_height(src_level) * bh2).div_ceil(bh1);
        let t_dst = (dst.mip_height(dst_level) * bh1).div_ceil(bh2);
        t_src.min(t_dst)
    }

    /// Placeholder bound in place of textures at unmapped addresses
    pub fn null_surface(target: SurfaceTarget) -> Self {
        Self {
            is_tiled: false,
            srgb_conversion: false,
            is_layered: target.is_layered(),
            block_width: 0,
            block_height: 0,
            block_depth: 0,
            tile_width_spacing: 1,
            width: 1,
            height: 1,
            depth: if target.is_cube() { 6 } else { 1 },
            pitch: 4,
            num_levels: 1,
            emulated_levels: 1,
            pixel_format: PixelFormat::R8Unorm,
            surface_type: SurfaceType::ColorTexture,
            target,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use oxidinx_hw::specs::{component_type, texture_format, texture_type};

    /// A 2D RGBA8 surface with the given tiling
    pub(crate) fn rgba8_2d(width: u32, height: u32, is_tiled: bool) -> SurfaceParams {
        SurfaceParams {
            is_tiled,
            srgb_conversion: false,
            is_layered: false,
            block_width: 0,
            block_height: 0,
            block_depth: 0,
            tile_width_spacing: 1,
            width,
            height,
            depth: 1,
            pitch: if is_tiled { 0 } else { width * 4 },
            num_levels: 1,
            emulated_levels: 1,
            pixel_format: PixelFormat::A8B8G8R8Unorm,
            surface_type: SurfaceType::ColorTexture,
            target: SurfaceTarget::Texture2D,
        }
    }

    #[test]
    fn test_equality_ignores_srgb_and_emulated_levels() {
        let a = rgba8_2d(64, 64, true);
        let mut b = a;
        b.srgb_conversion = true;
        b.emulated_levels = 7;
        assert_eq!(a, b);

        let mut hasher_a = std::collections::hash_map::DefaultHasher::new();
        let mut hasher_b = std::collections::hash_map::DefaultHasher::new();
        a.hash(&mut hasher_a);
        b.hash(&mut hasher_b);
        assert_eq!(hasher_a.finish(), hasher_b.finish());

        b.width = 32;
        assert_ne!(a, b);
    }

    #[test]
    fn test_linear_sizes() {
        let mut params = rgba8_2d(16, 8, false);
        params.pitch = 128;
        assert_eq!(params.guest_size_in_bytes(), 128 * 8);
        assert_eq!(params.host_size_in_bytes(), 16 * 8 * 4);
    }

    #[test]
    fn test_mipmap_offsets() {
        let mut params = rgba8_2d(64, 64, true);
        params.num_levels = 3;
        params.block_height = 3;
        // Level 0 is 64x64 RGBA8 at block height 3: 256 bytes by 64 rows
        assert_eq!(params.guest_mipmap_size(0), 256 * 64);
        // Level 1 is 32 rows; its block height shrinks to 2
        assert_eq!(params.mip_block_height(1), 2);
        assert_eq!(params.guest_mipmap_level_offset(1), 256 * 64);
        assert_eq!(params.host_mipmap_level_offset(1), 64 * 64 * 4);
        assert_eq!(params.host_mipmap_level_offset(2), 64 * 64 * 4 + 32 * 32 * 4);
    }

    #[test]
    fn test_layered_sizes_are_block_aligned() {
        let mut params = rgba8_2d(16, 16, true);
        params.target = SurfaceTarget::Texture2DArray;
        params.is_layered = true;
        params.depth = 4;
        params.block_height = 1;
        // one layer is 64 bytes * 16 rows, aligned to 1024 byte blocks
        assert_eq!(params.guest_layer_size(), 1024);
        assert_eq!(params.guest_size_in_bytes(), 4096);
        assert_eq!(params.host_layer_size(0), 16 * 16 * 4);
    }

    #[test]
    fn test_max_possible_mipmap() {
        assert_eq!(rgba8_2d(64, 16, true).max_possible_mipmap(), 7);
        assert_eq!(rgba8_2d(1, 1, true).max_possible_mipmap(), 1);
        assert_eq!(rgba8_2d(100, 3, true).max_possible_mipmap(), 8);
    }

    #[test]
    fn test_block_offset_xyz() {
        let mut params = rgba8_2d(64, 64, true);
        params.target = SurfaceTarget::Texture3D;
        params.depth = 4;
        params.block_depth = 2;
        // 16 pixels per GOB row, one GOB tall blocks, four GOBs deep
        assert_eq!(params.block_offset_xyz(0), (0, 0, 0));
        assert_eq!(params.block_offset_xyz(512), (0, 0, 1));
        assert_eq!(params.block_offset_xyz(3 * 512), (0, 0, 3));
        assert_eq!(params.block_offset_xyz(4 * 512), (16, 0, 0));
    }

    #[test]
    fn test_format_conversions() {
        let bc1 = PixelFormat::Bc1RgbaUnorm;
        let rgba = PixelFormat::A8B8G8R8Unorm;
        assert_eq!(SurfaceParams::convert_width(64, bc1, rgba), 16);
        assert_eq!(SurfaceParams::convert_width(16, rgba, bc1), 64);
        assert_eq!(SurfaceParams::convert_height(6, bc1, rgba), 2);
    }

    #[test]
    fn test_create_for_texture_cube() {
        let tic = TicEntry {
            address: 0x1_0000_0000,
            format: texture_format::A8R8G8B8,
            r_type: component_type::UNORM,
            width: 32,
            height: 32,
            depth: 1,
            max_mip_level: 9,
            texture_type: texture_type::TEXTURE_CUBEMAP,
            ..Default::default()
        };
        let entry = SamplerEntry {
            texture_type: TextureType::TextureCube,
            is_array: false,
            is_shadow: false,
        };
        let params = SurfaceParams::create_for_texture(&tic, &entry);
        assert_eq!(params.target, SurfaceTarget::TextureCubemap);
        assert_eq!(params.depth, 6);
        assert!(params.is_layered);
        assert_eq!(params.num_levels, 10);
        assert_eq!(params.emulated_levels, 6);
        assert_eq!(params.target_name(), "Cube");
    }

    #[test]
    fn test_shadow_sampler_reinterprets_as_depth() {
        let tic = TicEntry {
            format: texture_format::R32,
            r_type: component_type::FLOAT,
            width: 8,
            height: 8,
            depth: 1,
            ..Default::default()
        };
        let entry = SamplerEntry {
            texture_type: TextureType::Texture2D,
            is_array: false,
            is_shadow: true,
        };
        let params = SurfaceParams::create_for_texture(&tic, &entry);
        assert_eq!(params.pixel_format, PixelFormat::D32Float);
        assert_eq!(params.surface_type, SurfaceType::Depth);
    }

    #[test]
    fn test_linear_framebuffer_width_is_pitch() {
        let mut regs = Regs::default();
        regs.rt[0].format = render_target_format::A8B8G8R8_UNORM;
        regs.rt[0].width = 256;
        regs.rt[0].height = 4;
        let params = SurfaceParams::create_for_framebuffer(&regs, 0);
        assert_eq!(params.width, 64);
        assert_eq!(params.pitch, 256);
        assert_eq!(params.target, SurfaceTarget::Texture2D);
    }

    #[test]
    fn test_framebuffer_block_shifts_are_clamped() {
        let mut regs = Regs::default();
        regs.rt[0].format = render_target_format::A8B8G8R8_UNORM;
        regs.rt[0].is_tiled = true;
        regs.rt[0].width = 64;
        regs.rt[0].height = 64;
        regs.rt[0].block_width = 0xFFFF;
        regs.rt[0].block_height = 31;
        regs.rt[0].block_depth = 40;
        let params = SurfaceParams::create_for_framebuffer(&regs, 0);
        assert_eq!(params.block_width, MAX_BLOCK_SHIFT);
        assert_eq!(params.block_height, MAX_BLOCK_SHIFT);
        assert_eq!(params.block_depth, MAX_BLOCK_SHIFT);
        assert_eq!(
            params.block_size(),
            (64 << MAX_BLOCK_SHIFT) * (8 << MAX_BLOCK_SHIFT) * (1 << MAX_BLOCK_SHIFT)
        );
    }

    #[test]
    fn test_null_surface() {
        let params = SurfaceParams::null_surface(SurfaceTarget::TextureCubeArray);
        assert_eq!(params.depth, 6);
        assert!(params.is_layered);
        assert_eq!(params.pixel_format, PixelFormat::R8Unorm);
    }
}
