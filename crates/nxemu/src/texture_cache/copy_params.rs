/// A sub-region copy between two surfaces, in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyParams {
    pub source_x: u32,
    pub source_y: u32,
    pub source_z: u32,
    pub dest_x: u32,
    pub dest_y: u32,
    pub dest_z: u32,
    pub source_level: u32,
    pub dest_level: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl CopyParams {
    pub const fn new(
        (source_x, source_y, source_z): (u32, u32, u32),
        (dest_x, dest_y, dest_z): (u32, u32, u32),
        source_level: u32,
        dest_level: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Self {
        Self {
            source_x,
            source_y,
            source_z,
            dest_x,
            dest_y,
            dest_z,
            source_level,
            dest_level,
            width,
            height,
            depth,
        }
    }

    /// Copy a whole `level` between surfaces of identical geometry.
    pub const fn whole_level(width: u32, height: u32, depth: u32, level: u32) -> Self {
        Self::new((0, 0, 0), (0, 0, 0), level, level, width, height, depth)
    }
}
