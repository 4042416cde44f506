//! Guest GPU emulation core: guest memory, the GPU address space, the 2D
//! engine, the texture cache and the command scheduler behind a pluggable
//! host graphics backend.

pub mod args;
pub mod backend;
pub mod config;
pub mod engines;
pub mod error;
pub mod fence_manager;
pub mod gpu;
pub mod gpu_memory;
pub mod master_semaphore;
pub mod memory;
pub mod rasterizer;
pub mod resource_pool;
pub mod scheduler;
pub mod texture_cache;
pub mod trace;

// Re-export commonly used types
pub use args::Args;
pub use backend::{GraphicsBackend, SoftwareBackend};
pub use config::{EmulationConfig, GpuAccuracy};
pub use error::{BackendError, GpuMemoryError, MemoryError, TraceError};
pub use gpu::{Gpu, Syncpoints};
pub use gpu_memory::{GpuMemoryConfig, MemoryManager};
pub use memory::{DeviceMemory, Memory};
pub use rasterizer::{FramebufferConfig, Rasterizer, RasterizerInterface};
pub use trace::{Directive, TraceRunner, TraceStats};
