//! Emulation settings threaded through the memory core, texture cache and scheduler.

/// How hard the GPU emulation tries to keep guest memory and host resources coherent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum GpuAccuracy {
    #[default]
    Normal,
    High,
    Extreme,
}

/// Configuration for the emulated GPU pipeline
#[derive(Debug, Clone, Default)]
pub struct EmulationConfig {
    /// GPU accuracy level
    pub accuracy: GpuAccuracy,
    /// Guest CPU cores run on separate host threads
    pub use_multi_core: bool,
    /// GPU command processing runs asynchronously to the guest CPU
    pub use_asynchronous_gpu_emulation: bool,
    /// Spawn the auxiliary timeline waiter used by graphics debuggers
    pub renderer_debug: bool,
}

impl EmulationConfig {
    pub fn is_gpu_level_high(&self) -> bool {
        self.accuracy >= GpuAccuracy::High
    }

    pub fn is_gpu_level_extreme(&self) -> bool {
        self.accuracy == GpuAccuracy::Extreme
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_levels() {
        let mut config = EmulationConfig::default();
        assert!(!config.is_gpu_level_high());
        assert!(!config.is_gpu_level_extreme());

        config.accuracy = GpuAccuracy::High;
        assert!(config.is_gpu_level_high());
        assert!(!config.is_gpu_level_extreme());

        config.accuracy = GpuAccuracy::Extreme;
        assert!(config.is_gpu_level_high());
        assert!(config.is_gpu_level_extreme());
    }
}
