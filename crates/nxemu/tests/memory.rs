use nxemu::memory::{PAGE_SIZE, PageType};
use nxemu::{DeviceMemory, GpuMemoryConfig, Memory, MemoryManager};
use oxidinx_hw::memory_map::{dram, gpu_page};
use proptest::prelude::*;
use std::sync::Arc;

const CPU_BASE: u64 = 0x10_0000;
const REGION: u64 = 0x4_0000;

fn mapped_memory() -> Arc<Memory> {
    let device = Arc::new(DeviceMemory::new(REGION));
    let memory = Arc::new(Memory::new(device, 32));
    memory.map_memory_region(CPU_BASE, REGION, dram::BASE).unwrap();
    memory
}

fn small_gpu_config() -> GpuMemoryConfig {
    GpuMemoryConfig {
        address_space_bits: 36,
        ..GpuMemoryConfig::default()
    }
}

#[test]
fn write_read_unmap_scenario() {
    let device = Arc::new(DeviceMemory::new(0x1000));
    let memory = Memory::new(device, 32);
    memory.map_memory_region(0x1000, 0x1000, dram::BASE).unwrap();

    memory.write32(0x1004, 0xdead_beef);
    assert_eq!(memory.read32(0x1004), 0xdead_beef);

    memory.unmap_region(0x1000, 0x1000).unwrap();
    assert_eq!(memory.read32(0x1004), 0);
    assert!(!memory.is_valid_virtual_address(0x1004));
    // Writes to the hole are dropped
    memory.write32(0x1004, 1);
    assert_eq!(memory.read32(0x1004), 0);
}

#[test]
fn misaligned_mappings_are_rejected() {
    let memory = mapped_memory();
    assert!(memory.map_memory_region(CPU_BASE + 0x10, PAGE_SIZE, dram::BASE).is_err());
    assert!(memory.map_memory_region(CPU_BASE, PAGE_SIZE + 1, dram::BASE).is_err());
    assert!(memory.map_memory_region(CPU_BASE, PAGE_SIZE, dram::BASE + REGION).is_err());
}

#[test]
fn gpu_reads_follow_cpu_writes() {
    let memory = mapped_memory();
    let gpu = MemoryManager::new(memory.clone(), small_gpu_config());
    let gpu_addr = gpu.map_allocate(CPU_BASE, REGION, 0).unwrap();
    assert_eq!(gpu_addr, gpu_page::ADDRESS_SPACE_START);

    memory.write64(CPU_BASE + 0x3FF8, 0x0123_4567_89AB_CDEF);
    assert_eq!(gpu.read::<u64>(gpu_addr + 0x3FF8), 0x0123_4567_89AB_CDEF);

    gpu.write::<u32>(gpu_addr + 0x20, 0xFEED_F00D);
    assert_eq!(memory.read32(CPU_BASE + 0x20), 0xFEED_F00D);

    // A second allocation lands after the first
    let second = gpu.map_allocate(CPU_BASE, gpu_page::SIZE, 0).unwrap();
    assert!(second >= gpu_addr + REGION);
}

// ================================================================================================
// Properties
// ================================================================================================

#[derive(Debug, Clone)]
enum Access {
    Write32 { offset: u64, value: u32 },
    Write8 { offset: u64, value: u8 },
    Block { offset: u64, data: Vec<u8> },
    Zero { offset: u64, len: usize },
}

fn access_strategy() -> impl Strategy<Value = Access> {
    let offset = 0..REGION - 0x200;
    prop_oneof![
        (offset.clone(), any::<u32>()).prop_map(|(offset, value)| Access::Write32 { offset, value }),
        (offset.clone(), any::<u8>()).prop_map(|(offset, value)| Access::Write8 { offset, value }),
        (offset.clone(), proptest::collection::vec(any::<u8>(), 1..0x200))
            .prop_map(|(offset, data)| Access::Block { offset, data }),
        (offset, 1usize..0x200).prop_map(|(offset, len)| Access::Zero { offset, len }),
    ]
}

fn apply(memory: &Memory, access: &Access) -> u32 {
    match access {
        Access::Write32 { offset, value } => {
            memory.write32(CPU_BASE + offset, *value);
            memory.read32(CPU_BASE + offset)
        }
        Access::Write8 { offset, value } => {
            memory.write8(CPU_BASE + offset, *value);
            memory.read8(CPU_BASE + offset) as u32
        }
        Access::Block { offset, data } => {
            memory.write_block(CPU_BASE + offset, data);
            memory.read32(CPU_BASE + offset)
        }
        Access::Zero { offset, len } => {
            memory.zero_block(CPU_BASE + offset, *len);
            memory.read32(CPU_BASE + offset)
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_gpu_translation_round_trips(
        cpu_page in 0u64..0x1000,
        gpu_page_index in 0u64..0x100,
        pages in 1u64..16,
        probes in proptest::collection::vec(any::<u64>(), 1..16),
    ) {
        let memory = mapped_memory();
        let gpu = MemoryManager::new(memory, small_gpu_config());
        let cpu_addr = CPU_BASE + (cpu_page << 12);
        let gpu_addr = gpu_page::ADDRESS_SPACE_START + (gpu_page_index << gpu_page::BITS);
        let size = pages << gpu_page::BITS;

        prop_assert_eq!(gpu.map(cpu_addr, gpu_addr, size).unwrap(), gpu_addr);
        for probe in probes {
            let k = probe % size;
            prop_assert_eq!(gpu.gpu_to_cpu_address(gpu_addr + k), Some(cpu_addr + k));
        }
        prop_assert_eq!(gpu.gpu_to_cpu_address(gpu_addr + size), None);
    }

    #[test]
    fn prop_unmapped_range_translates_to_nothing(
        gpu_page_index in 0u64..0x100,
        pages in 1u64..16,
        hole_start in 0u64..16,
        hole_pages in 1u64..16,
    ) {
        let memory = mapped_memory();
        let gpu = MemoryManager::new(memory, small_gpu_config());
        let gpu_addr = gpu_page::ADDRESS_SPACE_START + (gpu_page_index << gpu_page::BITS);
        gpu.map(CPU_BASE, gpu_addr, pages << gpu_page::BITS).unwrap();

        let hole = gpu_addr + (hole_start.min(pages - 1) << gpu_page::BITS);
        let hole_size = hole_pages << gpu_page::BITS;
        gpu.unmap(hole, hole_size).unwrap();
        for page in 0..hole_pages {
            let base = hole + (page << gpu_page::BITS);
            prop_assert_eq!(gpu.gpu_to_cpu_address(base), None);
            prop_assert_eq!(gpu.gpu_to_cpu_address(base + gpu_page::MASK), None);
        }
        if hole > gpu_addr {
            prop_assert_eq!(gpu.gpu_to_cpu_address(gpu_addr), Some(CPU_BASE));
        }
    }

    #[test]
    fn prop_cached_pages_match_direct_pages(
        accesses in proptest::collection::vec(access_strategy(), 1..48),
    ) {
        let direct = mapped_memory();
        let cached = mapped_memory();
        cached.rasterizer_mark_region_cached(CPU_BASE, REGION, true);
        prop_assert_eq!(cached.page_type(CPU_BASE), PageType::RasterizerCachedMemory);

        for access in &accesses {
            prop_assert_eq!(apply(&direct, access), apply(&cached, access));
        }

        let mut from_direct = vec![0u8; REGION as usize];
        let mut from_cached = vec![0u8; REGION as usize];
        direct.read_block(CPU_BASE, &mut from_direct);
        cached.read_block(CPU_BASE, &mut from_cached);
        prop_assert!(from_direct == from_cached);

        // Restoring direct access keeps the contents
        cached.rasterizer_mark_region_cached(CPU_BASE, REGION, false);
        cached.read_block(CPU_BASE, &mut from_cached);
        prop_assert!(from_direct == from_cached);
    }
}
