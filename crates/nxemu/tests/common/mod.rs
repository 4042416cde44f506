#![allow(dead_code)]

use nxemu::engines::fermi_2d;
use nxemu::{DeviceMemory, EmulationConfig, Gpu, GpuMemoryConfig, Memory, SoftwareBackend};
use oxidinx_hw::memory_map::dram;
use oxidinx_hw::specs::render_target_format;
use std::sync::Arc;

pub const CPU_BASE: u64 = 0x10_0000;
pub const GPU_BASE: u64 = 0x1_0000_0000;
pub const DRAM_SIZE: u64 = 0x20_0000;

/// A GPU over 2 MB of guest memory, mapped at `CPU_BASE` and `GPU_BASE`.
pub fn gpu(config: EmulationConfig) -> (Gpu<SoftwareBackend>, Arc<SoftwareBackend>) {
    let device = Arc::new(DeviceMemory::new(DRAM_SIZE));
    let memory = Arc::new(Memory::new(device, 32));
    memory.map_memory_region(CPU_BASE, DRAM_SIZE, dram::BASE).unwrap();
    let backend = Arc::new(SoftwareBackend::new());
    let gpu = Gpu::new(
        config,
        backend.clone(),
        memory,
        GpuMemoryConfig {
            address_space_bits: 36,
            ..GpuMemoryConfig::default()
        },
    );
    gpu.memory_manager().map(CPU_BASE, GPU_BASE, DRAM_SIZE).unwrap();
    (gpu, backend)
}

pub fn linear_surface(width: u32, height: u32, gpu_addr: u64) -> fermi_2d::Surface {
    fermi_2d::Surface {
        format: render_target_format::A8B8G8R8_UNORM,
        linear: true,
        pitch: width * 4,
        width,
        height,
        depth: 1,
        address_high: (gpu_addr >> 32) as u32,
        address_low: gpu_addr as u32,
        ..Default::default()
    }
}

pub fn copy_config(src: fermi_2d::Rect, dst: fermi_2d::Rect) -> fermi_2d::Config {
    fermi_2d::Config {
        operation: fermi_2d::Operation::SrcCopy,
        filter: fermi_2d::Filter::PointSample,
        src_rect: src,
        dst_rect: dst,
    }
}

pub fn rect(width: u32, height: u32) -> fermi_2d::Rect {
    fermi_2d::Rect {
        left: 0,
        top: 0,
        right: width,
        bottom: height,
    }
}
