//! Typed sub-resource references into cached surfaces.

use super::format::SurfaceTarget;
use super::surface::SurfaceId;

/// The layer and mip range a view exposes, and how it is typed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewParams {
    pub target: SurfaceTarget,
    pub base_layer: u32,
    pub num_layers: u32,
    pub base_level: u32,
    pub num_levels: u32,
}

impl ViewParams {
    pub const fn new(
        target: SurfaceTarget,
        base_layer: u32,
        num_layers: u32,
        base_level: u32,
        num_levels: u32,
    ) -> Self {
        Self {
            target,
            base_layer,
            num_layers,
            base_level,
            num_levels,
        }
    }

    pub fn is_layered(&self) -> bool {
        self.target.is_layered()
    }
}

/// Handle to a view of a cached surface.
///
/// Views do not keep their surface alive. A view taken before the surface was
/// unregistered refers to a stale `generation` and is rejected by
/// [`TextureCache::view_is_current`](super::TextureCache::view_is_current).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct View {
    pub surface: SurfaceId,
    pub generation: u32,
    pub params: ViewParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layered_targets() {
        let array = ViewParams::new(SurfaceTarget::Texture2DArray, 0, 4, 0, 1);
        let flat = ViewParams::new(SurfaceTarget::Texture2D, 2, 1, 0, 1);
        assert!(array.is_layered());
        assert!(!flat.is_layered());
        assert_ne!(array, flat);
    }
}
