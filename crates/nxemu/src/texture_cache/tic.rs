//! Texture descriptors and the shader-side view of a texture binding.

use oxidinx_hw::specs::texture_type;

/// Memory layout declared by a texture descriptor header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TicHeaderVersion {
    OneDBuffer,
    PitchColorKey,
    Pitch,
    #[default]
    BlockLinear,
    BlockLinearColorKey,
}

/// Decoded texture image control (TIC) entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TicEntry {
    pub address: u64,
    pub header_version: TicHeaderVersion,
    /// Texture format code, see `oxidinx_hw::specs::texture_format`
    pub format: u32,
    /// Component type of the red channel; decides UNORM vs FLOAT variants
    pub r_type: u32,
    pub srgb_conversion: bool,
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
    /// log2 of the tile width spacing
    pub tile_width_spacing: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub pitch: u32,
    pub max_mip_level: u32,
    /// Dimensionality code, see `oxidinx_hw::specs::texture_type`
    pub texture_type: u32,
}

impl TicEntry {
    pub fn is_tiled(&self) -> bool {
        matches!(
            self.header_version,
            TicHeaderVersion::BlockLinear | TicHeaderVersion::BlockLinearColorKey
        )
    }

    pub fn is_buffer(&self) -> bool {
        self.header_version == TicHeaderVersion::OneDBuffer
    }
}

/// Texture dimensionality as declared by a shader sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureType {
    Texture1D,
    Texture2D,
    Texture3D,
    TextureCube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerEntry {
    pub texture_type: TextureType,
    pub is_array: bool,
    pub is_shadow: bool,
}

/// Image dimensionality as declared by a shader image binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Texture1D,
    TextureBuffer,
    Texture1DArray,
    Texture2D,
    Texture2DArray,
    Texture3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageEntry {
    pub image_type: ImageType,
}

/// Whether a descriptor of `tic_type` may be sampled through `entry`.
pub fn is_type_compatible(tic_type: u32, entry: &SamplerEntry) -> bool {
    let shader_type = entry.texture_type;
    match tic_type {
        texture_type::TEXTURE_1D | texture_type::TEXTURE_1D_ARRAY => {
            shader_type == TextureType::Texture1D
        }
        // Buffers are accepted as-is.
        texture_type::TEXTURE_1D_BUFFER => true,
        texture_type::TEXTURE_2D | texture_type::TEXTURE_2D_NO_MIPMAP => {
            shader_type == TextureType::Texture2D
        }
        texture_type::TEXTURE_2D_ARRAY => {
            matches!(shader_type, TextureType::Texture2D | TextureType::TextureCube)
        }
        texture_type::TEXTURE_3D => shader_type == TextureType::Texture3D,
        texture_type::TEXTURE_CUBEMAP | texture_type::TEXTURE_CUBE_ARRAY => {
            shader_type == TextureType::TextureCube
                || (shader_type == TextureType::Texture2D && entry.is_array)
        }
        _ => {
            tracing::error!("Unknown texture type {}", tic_type);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(texture_type: TextureType, is_array: bool) -> SamplerEntry {
        SamplerEntry {
            texture_type,
            is_array,
            is_shadow: false,
        }
    }

    #[test]
    fn test_type_compatibility() {
        assert!(is_type_compatible(
            texture_type::TEXTURE_2D,
            &sampler(TextureType::Texture2D, false)
        ));
        assert!(!is_type_compatible(
            texture_type::TEXTURE_2D,
            &sampler(TextureType::Texture3D, false)
        ));
        assert!(is_type_compatible(
            texture_type::TEXTURE_CUBEMAP,
            &sampler(TextureType::Texture2D, true)
        ));
        assert!(!is_type_compatible(
            texture_type::TEXTURE_CUBEMAP,
            &sampler(TextureType::Texture2D, false)
        ));
        assert!(is_type_compatible(
            texture_type::TEXTURE_1D_BUFFER,
            &sampler(TextureType::Texture3D, false)
        ));
    }

    #[test]
    fn test_header_layouts() {
        let mut tic = TicEntry::default();
        assert!(tic.is_tiled());
        tic.header_version = TicHeaderVersion::Pitch;
        assert!(!tic.is_tiled());
        tic.header_version = TicHeaderVersion::OneDBuffer;
        assert!(tic.is_buffer());
    }
}
