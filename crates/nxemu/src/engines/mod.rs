//! GPU engines fed by the command processor.

pub mod fermi_2d;
pub mod maxwell_3d;

pub use fermi_2d::Fermi2D;
pub use maxwell_3d::Maxwell3D;
