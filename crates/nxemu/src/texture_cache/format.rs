//! Host pixel formats and the guest format codes that map onto them.

use oxidinx_hw::specs::{
    component_type, depth_format, framebuffer_format, render_target_format, texture_format,
};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelFormat {
    A8B8G8R8Unorm,
    A8B8G8R8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R5G6B5Unorm,
    A1R5G5B5Unorm,
    A2B10G10R10Unorm,
    B10G11R11Float,
    R8Unorm,
    R8G8Unorm,
    R16Unorm,
    R16Float,
    R16G16Unorm,
    R16G16Float,
    R32Uint,
    R32Float,
    R32G32Float,
    R16G16B16A16Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    Bc1RgbaUnorm,
    Bc2Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
    Bc7Unorm,
    Astc2D4x4Unorm,
    D16Unorm,
    D32Float,
    S8UintD24Unorm,
    D24UnormS8Uint,
    D32FloatS8Uint,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceType {
    ColorTexture,
    Depth,
    DepthStencil,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurfaceTarget {
    Texture1D,
    TextureBuffer,
    Texture2D,
    Texture3D,
    Texture1DArray,
    Texture2DArray,
    TextureCubemap,
    TextureCubeArray,
}

impl SurfaceTarget {
    pub const ALL: [SurfaceTarget; 8] = [
        SurfaceTarget::Texture1D,
        SurfaceTarget::TextureBuffer,
        SurfaceTarget::Texture2D,
        SurfaceTarget::Texture3D,
        SurfaceTarget::Texture1DArray,
        SurfaceTarget::Texture2DArray,
        SurfaceTarget::TextureCubemap,
        SurfaceTarget::TextureCubeArray,
    ];

    /// Targets addressed by layer rather than by depth slice
    pub fn is_layered(self) -> bool {
        matches!(
            self,
            SurfaceTarget::Texture1DArray
                | SurfaceTarget::Texture2DArray
                | SurfaceTarget::TextureCubemap
                | SurfaceTarget::TextureCubeArray
        )
    }

    pub fn is_cube(self) -> bool {
        matches!(self, SurfaceTarget::TextureCubemap | SurfaceTarget::TextureCubeArray)
    }
}

/// (bits per block, block width, block height, surface type)
struct FormatInfo(u32, u32, u32, SurfaceType);

impl PixelFormat {
    fn info(self) -> FormatInfo {
        use PixelFormat::*;
        use SurfaceType::*;
        match self {
            A8B8G8R8Unorm | A8B8G8R8Srgb | B8G8R8A8Unorm | B8G8R8A8Srgb => {
                FormatInfo(32, 1, 1, ColorTexture)
            }
            R5G6B5Unorm | A1R5G5B5Unorm => FormatInfo(16, 1, 1, ColorTexture),
            A2B10G10R10Unorm | B10G11R11Float => FormatInfo(32, 1, 1, ColorTexture),
            R8Unorm => FormatInfo(8, 1, 1, ColorTexture),
            R8G8Unorm | R16Unorm | R16Float => FormatInfo(16, 1, 1, ColorTexture),
            R16G16Unorm | R16G16Float | R32Uint | R32Float => FormatInfo(32, 1, 1, ColorTexture),
            R32G32Float | R16G16B16A16Unorm | R16G16B16A16Float => {
                FormatInfo(64, 1, 1, ColorTexture)
            }
            R32G32B32A32Float => FormatInfo(128, 1, 1, ColorTexture),
            Bc1RgbaUnorm | Bc4Unorm => FormatInfo(64, 4, 4, ColorTexture),
            Bc2Unorm | Bc3Unorm | Bc5Unorm | Bc7Unorm | Astc2D4x4Unorm => {
                FormatInfo(128, 4, 4, ColorTexture)
            }
            D16Unorm => FormatInfo(16, 1, 1, Depth),
            D32Float => FormatInfo(32, 1, 1, Depth),
            S8UintD24Unorm | D24UnormS8Uint => FormatInfo(32, 1, 1, DepthStencil),
            D32FloatS8Uint => FormatInfo(64, 1, 1, DepthStencil),
            PixelFormat::Invalid => FormatInfo(0, 1, 1, SurfaceType::Invalid),
        }
    }

    /// Bits per pixel, or per compressed block
    pub fn bits_per_pixel(self) -> u32 {
        self.info().0
    }

    pub fn bytes_per_pixel(self) -> u32 {
        self.bits_per_pixel() / 8
    }

    pub fn default_block_width(self) -> u32 {
        self.info().1
    }

    pub fn default_block_height(self) -> u32 {
        self.info().2
    }

    pub fn surface_type(self) -> SurfaceType {
        self.info().3
    }

    pub fn is_compressed(self) -> bool {
        self.default_block_width() > 1 || self.default_block_height() > 1
    }

    pub fn is_depth_stencil(self) -> bool {
        matches!(self.surface_type(), SurfaceType::Depth | SurfaceType::DepthStencil)
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, PixelFormat::A8B8G8R8Srgb | PixelFormat::B8G8R8A8Srgb)
    }

    /// The format aliasing the same bits with the other aspect (depth vs color).
    pub fn sibling(self) -> Option<PixelFormat> {
        use PixelFormat::*;
        match self {
            D16Unorm => Some(R16Unorm),
            R16Unorm => Some(D16Unorm),
            D32Float => Some(R32Float),
            R32Float => Some(D32Float),
            D32FloatS8Uint => Some(R32G32Float),
            R32G32Float => Some(D32FloatS8Uint),
            _ => None,
        }
    }

    /// Whether a raw image copy between the two formats preserves meaning.
    pub fn is_copy_compatible(self, other: PixelFormat) -> bool {
        if self == other {
            return true;
        }
        self.surface_type() == SurfaceType::ColorTexture
            && other.surface_type() == SurfaceType::ColorTexture
            && self.bits_per_pixel() == other.bits_per_pixel()
            && self.default_block_width() == other.default_block_width()
            && self.default_block_height() == other.default_block_height()
    }

    pub fn from_render_target_format(format: u32) -> PixelFormat {
        use PixelFormat::*;
        match format {
            render_target_format::R32G32B32A32_FLOAT => R32G32B32A32Float,
            render_target_format::R16G16B16A16_UNORM => R16G16B16A16Unorm,
            render_target_format::R16G16B16A16_FLOAT => R16G16B16A16Float,
            render_target_format::R32G32_FLOAT => R32G32Float,
            render_target_format::B8G8R8A8_UNORM => B8G8R8A8Unorm,
            render_target_format::B8G8R8A8_SRGB => B8G8R8A8Srgb,
            render_target_format::A2B10G10R10_UNORM => A2B10G10R10Unorm,
            render_target_format::A8B8G8R8_UNORM => A8B8G8R8Unorm,
            render_target_format::A8B8G8R8_SRGB => A8B8G8R8Srgb,
            render_target_format::R16G16_UNORM => R16G16Unorm,
            render_target_format::R16G16_FLOAT => R16G16Float,
            render_target_format::B10G11R11_FLOAT => B10G11R11Float,
            render_target_format::R32_UINT => R32Uint,
            render_target_format::R32_FLOAT => R32Float,
            render_target_format::R5G6B5_UNORM => R5G6B5Unorm,
            render_target_format::A1R5G5B5_UNORM => A1R5G5B5Unorm,
            render_target_format::R8G8_UNORM => R8G8Unorm,
            render_target_format::R16_UNORM => R16Unorm,
            render_target_format::R16_FLOAT => R16Float,
            render_target_format::R8_UNORM => R8Unorm,
            _ => {
                error!("Unimplemented render target format {:#x}", format);
                Invalid
            }
        }
    }

    pub fn from_depth_format(format: u32) -> PixelFormat {
        use PixelFormat::*;
        match format {
            depth_format::D32_FLOAT => D32Float,
            depth_format::D16_UNORM => D16Unorm,
            depth_format::S8_UINT_Z24_UNORM => S8UintD24Unorm,
            depth_format::D24X8_UNORM | depth_format::D24S8_UNORM => D24UnormS8Uint,
            depth_format::D32_FLOAT_S8X24_UINT => D32FloatS8Uint,
            _ => {
                error!("Unimplemented depth format {:#x}", format);
                Invalid
            }
        }
    }

    pub fn from_framebuffer_format(format: u32) -> PixelFormat {
        match format {
            framebuffer_format::A8B8G8R8_UNORM => PixelFormat::A8B8G8R8Unorm,
            framebuffer_format::RGB565_UNORM => PixelFormat::R5G6B5Unorm,
            framebuffer_format::B8G8R8A8_UNORM => PixelFormat::B8G8R8A8Unorm,
            _ => {
                error!("Unimplemented framebuffer format {}", format);
                PixelFormat::A8B8G8R8Unorm
            }
        }
    }

    /// Resolve a texture descriptor format; unknown combinations fall back to RGBA8.
    pub fn from_texture_format(format: u32, srgb: bool, component: u32) -> PixelFormat {
        use PixelFormat::*;
        use component_type::{FLOAT, UINT, UNORM};
        match (format, component) {
            (texture_format::A8R8G8B8, UNORM) if srgb => A8B8G8R8Srgb,
            (texture_format::A8R8G8B8, UNORM) => A8B8G8R8Unorm,
            (texture_format::A2B10G10R10, UNORM) => A2B10G10R10Unorm,
            (texture_format::A1B5G5R5, UNORM) => A1R5G5B5Unorm,
            (texture_format::B5G6R5, UNORM) => R5G6B5Unorm,
            (texture_format::G8R8, UNORM) => R8G8Unorm,
            (texture_format::R8, UNORM) => R8Unorm,
            (texture_format::R16, UNORM) => R16Unorm,
            (texture_format::R16, FLOAT) => R16Float,
            (texture_format::R16_G16, UNORM) => R16G16Unorm,
            (texture_format::R16_G16, FLOAT) => R16G16Float,
            (texture_format::R32, UINT) => R32Uint,
            (texture_format::R32, FLOAT) => R32Float,
            (texture_format::R32_G32, FLOAT) => R32G32Float,
            (texture_format::R16_G16_B16_A16, UNORM) => R16G16B16A16Unorm,
            (texture_format::R16_G16_B16_A16, FLOAT) => R16G16B16A16Float,
            (texture_format::R32_G32_B32_A32, FLOAT) => R32G32B32A32Float,
            (texture_format::BF10GF11RF11, FLOAT) => B10G11R11Float,
            (texture_format::DXT1, _) => Bc1RgbaUnorm,
            (texture_format::DXT23, _) => Bc2Unorm,
            (texture_format::DXT45, _) => Bc3Unorm,
            (texture_format::DXN1, _) => Bc4Unorm,
            (texture_format::DXN2, _) => Bc5Unorm,
            (texture_format::BC7U, _) => Bc7Unorm,
            (texture_format::ASTC_2D_4X4, _) => Astc2D4x4Unorm,
            (texture_format::Z16, _) => D16Unorm,
            (texture_format::ZF32, _) => D32Float,
            (texture_format::S8Z24, _) => S8UintD24Unorm,
            (texture_format::ZF32_X24S8, _) => D32FloatS8Uint,
            _ => {
                warn!(
                    "Texture format {:#x} with component type {} not implemented",
                    format, component
                );
                A8B8G8R8Unorm
            }
        }
    }
}
