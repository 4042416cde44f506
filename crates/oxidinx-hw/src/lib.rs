//! Hardware constants for the emulated console.
//!
//! Pure data: address space geometry, engine register indices and the
//! guest-visible format codes. Nothing in here has behaviour.

pub mod memory_map;
pub mod mmio;
pub mod specs;
