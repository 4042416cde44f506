use crate::config::{EmulationConfig, GpuAccuracy};
use clap::{Parser, ValueEnum};
use oxidinx_hw::memory_map::cpu_page;
use std::path::PathBuf;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyArg {
    Normal,
    High,
    Extreme,
}

impl From<AccuracyArg> for GpuAccuracy {
    fn from(value: AccuracyArg) -> Self {
        match value {
            AccuracyArg::Normal => GpuAccuracy::Normal,
            AccuracyArg::High => GpuAccuracy::High,
            AccuracyArg::Extreme => GpuAccuracy::Extreme,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "nxemu-cli", about = "Replay a GPU trace against the headless backend")]
pub struct Args {
    /// Path to the trace file to replay
    pub trace: PathBuf,

    /// How hard the GPU emulation keeps guest memory and host surfaces coherent
    #[arg(long, value_enum, default_value_t = AccuracyArg::Normal)]
    pub accuracy: AccuracyArg,

    /// Defer semaphore and syncpoint releases behind host fences
    #[arg(long)]
    pub async_gpu: bool,

    /// Spawn the timeline waiter thread used by graphics debuggers
    #[arg(long)]
    pub renderer_debug: bool,

    /// Size of emulated DRAM in bytes (hex: 0x1000 or decimal: 4096)
    #[arg(long, value_parser = parse_hex_or_dec, default_value = "0x4000000")]
    pub dram_size: u64,
}

impl Args {
    /// Validate that the arguments are consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.dram_size == 0 {
            return Err("--dram-size must not be zero".to_string());
        }
        if self.dram_size & cpu_page::MASK != 0 {
            return Err(format!(
                "--dram-size {:#x} is not a multiple of the {:#x} byte page size",
                self.dram_size,
                cpu_page::SIZE
            ));
        }
        Ok(())
    }

    pub fn to_emulation_config(&self) -> EmulationConfig {
        EmulationConfig {
            accuracy: self.accuracy.into(),
            use_multi_core: false,
            use_asynchronous_gpu_emulation: self.async_gpu,
            renderer_debug: self.renderer_debug,
        }
    }
}

pub fn parse_hex_or_dec(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_or_dec() {
        assert_eq!(parse_hex_or_dec("0x10"), Ok(16));
        assert_eq!(parse_hex_or_dec("0XfF"), Ok(255));
        assert_eq!(parse_hex_or_dec("42"), Ok(42));
        assert!(parse_hex_or_dec("0xg").is_err());
    }

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from([
            "nxemu-cli",
            "frame.trace",
            "--accuracy",
            "extreme",
            "--async-gpu",
            "--dram-size",
            "0x100000",
        ]);
        assert!(args.validate().is_ok());
        let config = args.to_emulation_config();
        assert!(config.is_gpu_level_extreme());
        assert!(config.use_asynchronous_gpu_emulation);
        assert!(!config.renderer_debug);
        assert_eq!(args.dram_size, 0x10_0000);
    }

    #[test]
    fn test_unaligned_dram_is_rejected() {
        let args = Args::parse_from(["nxemu-cli", "frame.trace", "--dram-size", "4097"]);
        assert!(args.validate().is_err());
    }
}
