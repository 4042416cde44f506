//! # References
//! - <https://switchbrew.org/wiki/Memory_layout>
//! - <https://switchbrew.org/wiki/NV_services#NVGPU_AS_IOCTL_ALLOC_SPACE>

/// DRAM as seen by the application processor
pub mod dram {
    /// Physical base address of DRAM
    pub const BASE: u64 = 0x8000_0000;
    /// Default DRAM size (4 GB on retail units)
    pub const SIZE: u64 = 4 * 1024 * 1024 * 1024;
}

/// CPU-side page table geometry
pub mod cpu_page {
    /// log2 of the CPU page size
    pub const BITS: u64 = 12;
    /// CPU page size in bytes (4 KB)
    pub const SIZE: u64 = 1 << BITS;
    /// Mask selecting the offset inside a CPU page
    pub const MASK: u64 = SIZE - 1;
    /// Width of a 64-bit process address space
    pub const ADDRESS_SPACE_BITS: u64 = 39;
}

/// GPU MMU geometry
pub mod gpu_page {
    /// log2 of the GPU "big page" size
    pub const BITS: u64 = 16;
    /// GPU page size in bytes (64 KB)
    pub const SIZE: u64 = 1 << BITS;
    /// Mask selecting the offset inside a GPU page
    pub const MASK: u64 = SIZE - 1;
    /// Width of the GPU virtual address space
    pub const ADDRESS_SPACE_BITS: u64 = 40;
    /// Size of the GPU virtual address space in bytes
    pub const ADDRESS_SPACE_SIZE: u64 = 1 << ADDRESS_SPACE_BITS;
    /// Lowest address handed out by the free-range allocator
    ///
    /// Addresses below 4 GB are reserved so that 32-bit GPU pointers never alias
    /// a valid mapping.
    pub const ADDRESS_SPACE_START: u64 = 1 << 32;

    /// CPU addresses are stored in page entries shifted by this amount
    pub const ENTRY_ADDRESS_SHIFT: u64 = 12;
}
