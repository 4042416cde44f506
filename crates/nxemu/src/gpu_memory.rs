//! GPU virtual memory manager.
//!
//! The GPU MMU translates 40-bit GPU virtual addresses to CPU virtual addresses
//! at "big page" granularity. Entries either hold a CPU address, reserve
//! address space without backing ([`PageEntry::ALLOCATED`]) or are unmapped.

use crate::error::GpuMemoryError;
use crate::memory::{GuestValue, HostPtr, Memory, PAGE_MASK as CPU_PAGE_MASK, PAGE_SIZE as CPU_PAGE_SIZE};
use crate::rasterizer::RasterizerInterface;
use oxidinx_hw::memory_map::gpu_page;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, instrument};

/// Geometry of the GPU address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemoryConfig {
    pub page_bits: u64,
    pub address_space_bits: u64,
    pub address_space_start: u64,
}

impl Default for GpuMemoryConfig {
    fn default() -> Self {
        Self {
            page_bits: gpu_page::BITS,
            address_space_bits: gpu_page::ADDRESS_SPACE_BITS,
            address_space_start: gpu_page::ADDRESS_SPACE_START,
        }
    }
}

impl GpuMemoryConfig {
    pub fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    pub fn page_mask(&self) -> u64 {
        self.page_size() - 1
    }

    pub fn address_space_size(&self) -> u64 {
        1 << self.address_space_bits
    }

    fn page_table_len(&self) -> usize {
        1usize << (self.address_space_bits - self.page_bits)
    }
}

/// One GPU page table entry: a shifted CPU address or a state marker.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageEntry(u32);

impl PageEntry {
    pub const UNMAPPED: Self = Self(u32::MAX);
    pub const ALLOCATED: Self = Self(u32::MAX - 1);

    pub fn from_cpu_addr(cpu_addr: u64) -> Self {
        Self((cpu_addr >> gpu_page::ENTRY_ADDRESS_SHIFT) as u32)
    }

    pub fn is_unmapped(self) -> bool {
        self == Self::UNMAPPED
    }

    pub fn is_allocated(self) -> bool {
        self == Self::ALLOCATED
    }

    pub fn is_valid(self) -> bool {
        !self.is_unmapped() && !self.is_allocated()
    }

    pub fn to_address(self) -> u64 {
        (self.0 as u64) << gpu_page::ENTRY_ADDRESS_SHIFT
    }

    /// Entry for the page `offset` bytes further on; state markers are unchanged.
    fn offset(self, offset: u64) -> Self {
        if self.is_valid() {
            Self::from_cpu_addr(self.to_address() + offset)
        } else {
            self
        }
    }
}

impl std::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UNMAPPED => write!(f, "Unmapped"),
            Self::ALLOCATED => write!(f, "Allocated"),
            entry => write!(f, "Valid({:#x})", entry.to_address()),
        }
    }
}

pub struct MemoryManager {
    config: GpuMemoryConfig,
    memory: Arc<Memory>,
    page_table: RwLock<Vec<PageEntry>>,
    rasterizer: RwLock<Option<Weak<dyn RasterizerInterface>>>,
}

impl MemoryManager {
    pub fn new(memory: Arc<Memory>, config: GpuMemoryConfig) -> Self {
        Self {
            config,
            memory,
            page_table: RwLock::new(vec![PageEntry::UNMAPPED; config.page_table_len()]),
            rasterizer: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &GpuMemoryConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn bind_rasterizer(&self, rasterizer: Weak<dyn RasterizerInterface>) {
        *self.rasterizer.write() = Some(rasterizer);
    }

    fn with_rasterizer(&self, f: impl FnOnce(&dyn RasterizerInterface)) {
        let rasterizer = self.rasterizer.read().as_ref().and_then(Weak::upgrade);
        if let Some(rasterizer) = rasterizer {
            f(rasterizer.as_ref());
        }
    }

    // --------------------------------------------------------------------------------------------
    // Mapping
    // --------------------------------------------------------------------------------------------

    fn update_range(
        &self,
        gpu_addr: u64,
        entry: PageEntry,
        size: u64,
    ) -> Result<u64, GpuMemoryError> {
        let page_size = self.config.page_size();
        let first = (gpu_addr >> self.config.page_bits) as usize;
        let count = size.div_ceil(page_size) as usize;
        let mut table = self.page_table.write();
        if first + count > table.len() {
            return Err(GpuMemoryError::OutOfRange { gpu_addr, size });
        }
        for (i, slot) in table[first..first + count].iter_mut().enumerate() {
            *slot = entry.offset(i as u64 * page_size);
        }
        Ok(gpu_addr)
    }

    /// Map `size` bytes of CPU memory at `cpu_addr` to `gpu_addr`.
    pub fn map(&self, cpu_addr: u64, gpu_addr: u64, size: u64) -> Result<u64, GpuMemoryError> {
        debug!("Mapping CPU {:#x} to GPU {:#x} ({:#x} bytes)", cpu_addr, gpu_addr, size);
        self.update_range(gpu_addr, PageEntry::from_cpu_addr(cpu_addr), size)
    }

    /// Map `size` bytes of CPU memory at the first free GPU range.
    pub fn map_allocate(&self, cpu_addr: u64, size: u64, align: u64) -> Result<u64, GpuMemoryError> {
        let gpu_addr = self
            .find_free_range(size, align)
            .ok_or(GpuMemoryError::OutOfAddressSpace { size })?;
        self.map(cpu_addr, gpu_addr, size)
    }

    /// Unmap `[gpu_addr, gpu_addr + size)`, writing cached data back first.
    pub fn unmap(&self, gpu_addr: u64, size: u64) -> Result<(), GpuMemoryError> {
        if size == 0 {
            return Ok(());
        }
        debug!("Unmapping GPU {:#x} ({:#x} bytes)", gpu_addr, size);
        if let Some(cpu_addr) = self.gpu_to_cpu_address(gpu_addr) {
            self.with_rasterizer(|r| r.flush_and_invalidate_region(cpu_addr, size));
        }
        self.update_range(gpu_addr, PageEntry::UNMAPPED, size)?;
        Ok(())
    }

    /// Reserve `[gpu_addr, gpu_addr + size)` without backing it.
    ///
    /// Returns `None` when any page of the range is already in use.
    pub fn allocate_fixed(&self, gpu_addr: u64, size: u64) -> Option<u64> {
        let page_size = self.config.page_size();
        {
            let table = self.page_table.read();
            let mut offset = 0;
            while offset < size {
                let index = ((gpu_addr + offset) >> self.config.page_bits) as usize;
                if !table.get(index).is_some_and(|entry| entry.is_unmapped()) {
                    return None;
                }
                offset += page_size;
            }
        }
        self.update_range(gpu_addr, PageEntry::ALLOCATED, size).ok()
    }

    pub fn allocate(&self, size: u64, align: u64) -> Result<u64, GpuMemoryError> {
        let gpu_addr = self
            .find_free_range(size, align)
            .ok_or(GpuMemoryError::OutOfAddressSpace { size })?;
        self.allocate_fixed(gpu_addr, size)
            .ok_or(GpuMemoryError::OutOfRange { gpu_addr, size })
    }

    /// First-fit search for `size` bytes of unmapped address space aligned to `align`.
    pub fn find_free_range(&self, size: u64, align: u64) -> Option<u64> {
        let page_size = self.config.page_size();
        let align = if align == 0 {
            page_size
        } else {
            align.next_multiple_of(page_size)
        };
        let address_space_size = self.config.address_space_size();

        let table = self.page_table.read();
        let mut available_size = 0;
        let mut gpu_addr = self.config.address_space_start;
        while gpu_addr + available_size < address_space_size {
            let index = ((gpu_addr + available_size) >> self.config.page_bits) as usize;
            if table[index].is_unmapped() {
                available_size += page_size;
                if available_size >= size {
                    return Some(gpu_addr);
                }
            } else {
                gpu_addr += available_size + page_size;
                available_size = 0;
                gpu_addr = gpu_addr.next_multiple_of(align);
            }
        }
        None
    }

    pub fn page_entry(&self, gpu_addr: u64) -> PageEntry {
        let index = (gpu_addr >> self.config.page_bits) as usize;
        self.page_table
            .read()
            .get(index)
            .copied()
            .unwrap_or(PageEntry::UNMAPPED)
    }

    pub fn gpu_to_cpu_address(&self, gpu_addr: u64) -> Option<u64> {
        let entry = self.page_entry(gpu_addr);
        entry
            .is_valid()
            .then(|| entry.to_address() + (gpu_addr & self.config.page_mask()))
    }

    pub fn get_pointer(&self, gpu_addr: u64) -> Option<HostPtr> {
        let cpu_addr = self.gpu_to_cpu_address(gpu_addr)?;
        self.memory.get_pointer(cpu_addr)
    }

    /// Whether the range stays inside one CPU page.
    pub fn is_granular_range(&self, gpu_addr: u64, size: u64) -> bool {
        self.gpu_to_cpu_address(gpu_addr)
            .is_some_and(|cpu_addr| (cpu_addr & CPU_PAGE_MASK) + size <= CPU_PAGE_SIZE)
    }

    // --------------------------------------------------------------------------------------------
    // Accesses
    // --------------------------------------------------------------------------------------------

    /// Host pointer for `size` bytes at `gpu_addr` when they sit inside one GPU page and one CPU page.
    fn contiguous_pointer(&self, gpu_addr: u64, size: u64) -> Option<HostPtr> {
        let fits_gpu_page = (gpu_addr & self.config.page_mask()) + size <= self.config.page_size();
        if fits_gpu_page && self.is_granular_range(gpu_addr, size) {
            self.get_pointer(gpu_addr)
        } else {
            None
        }
    }

    fn assert_mapped(&self, gpu_addr: u64, size: u64, kind: &str, bits: u32) {
        let last = gpu_addr + size - 1;
        if self.gpu_to_cpu_address(gpu_addr).is_none() || self.gpu_to_cpu_address(last).is_none() {
            panic!("GPU {kind}{bits} at unmapped address {gpu_addr:#x}");
        }
    }

    /// Typed read used by engines; an unmapped address is an engine programming error.
    ///
    /// Values straddling a page boundary are assembled from each page's own mapping.
    pub fn read<T: GuestValue>(&self, gpu_addr: u64) -> T {
        let size = size_of::<T>() as u64;
        if let Some(ptr) = self.contiguous_pointer(gpu_addr, size) {
            // SAFETY: the pointer addresses `size` bytes inside one mapped CPU page.
            return unsafe { ptr.as_ptr().cast::<T>().read_unaligned() };
        }
        self.assert_mapped(gpu_addr, size, "read", T::BITS);
        let mut bytes = [0u8; 8];
        self.read_block_unsafe(gpu_addr, &mut bytes[..size as usize]);
        T::from_u64(u64::from_le_bytes(bytes))
    }

    /// Typed write used by engines; an unmapped address is an engine programming error.
    pub fn write<T: GuestValue>(&self, gpu_addr: u64, data: T) {
        let size = size_of::<T>() as u64;
        if let Some(ptr) = self.contiguous_pointer(gpu_addr, size) {
            // SAFETY: as in `read`.
            unsafe { ptr.as_ptr().cast::<T>().write_unaligned(data) };
            return;
        }
        self.assert_mapped(gpu_addr, size, "write", T::BITS);
        let bytes = data.to_u64().to_le_bytes();
        self.write_block_unsafe(gpu_addr, &bytes[..size as usize]);
    }

    /// Split a GPU range at GPU page boundaries and resolve each piece.
    fn for_each_chunk(&self, gpu_addr: u64, size: usize, mut f: impl FnMut(Option<u64>, usize, usize)) {
        let page_size = self.config.page_size() as usize;
        let mut remaining = size;
        let mut page_index = gpu_addr >> self.config.page_bits;
        let mut page_offset = (gpu_addr & self.config.page_mask()) as usize;
        let mut buffer_offset = 0;
        while remaining > 0 {
            let amount = remaining.min(page_size - page_offset);
            let cpu_addr = self
                .gpu_to_cpu_address(page_index << self.config.page_bits)
                .map(|addr| addr + page_offset as u64);
            f(cpu_addr, buffer_offset, amount);
            page_index += 1;
            page_offset = 0;
            buffer_offset += amount;
            remaining -= amount;
        }
    }

    /// Read with a rasterizer flush per chunk so cached GPU data is visible.
    ///
    /// Unmapped chunks leave the destination untouched.
    #[instrument(level = "trace", skip(self, dest_buffer))]
    pub fn read_block(&self, gpu_src_addr: u64, dest_buffer: &mut [u8]) {
        self.for_each_chunk(gpu_src_addr, dest_buffer.len(), |cpu_addr, offset, amount| {
            if let Some(cpu_addr) = cpu_addr {
                self.with_rasterizer(|r| r.flush_region(cpu_addr, amount as u64));
                self.memory
                    .read_block_unsafe(cpu_addr, &mut dest_buffer[offset..offset + amount]);
            }
        });
    }

    /// Read without coherency callbacks; unmapped chunks read as zero.
    pub fn read_block_unsafe(&self, gpu_src_addr: u64, dest_buffer: &mut [u8]) {
        self.for_each_chunk(gpu_src_addr, dest_buffer.len(), |cpu_addr, offset, amount| {
            let dest = &mut dest_buffer[offset..offset + amount];
            match cpu_addr {
                Some(cpu_addr) => self.memory.read_block_unsafe(cpu_addr, dest),
                None => dest.fill(0),
            }
        });
    }

    #[instrument(level = "trace", skip(self, src_buffer))]
    pub fn write_block(&self, gpu_dest_addr: u64, src_buffer: &[u8]) {
        self.for_each_chunk(gpu_dest_addr, src_buffer.len(), |cpu_addr, offset, amount| {
            if let Some(cpu_addr) = cpu_addr {
                self.with_rasterizer(|r| r.invalidate_region(cpu_addr, amount as u64));
                self.memory
                    .write_block_unsafe(cpu_addr, &src_buffer[offset..offset + amount]);
            }
        });
    }

    pub fn write_block_unsafe(&self, gpu_dest_addr: u64, src_buffer: &[u8]) {
        self.for_each_chunk(gpu_dest_addr, src_buffer.len(), |cpu_addr, offset, amount| {
            if let Some(cpu_addr) = cpu_addr {
                self.memory
                    .write_block_unsafe(cpu_addr, &src_buffer[offset..offset + amount]);
            }
        });
    }

    pub fn copy_block(&self, gpu_dest_addr: u64, gpu_src_addr: u64, size: usize) {
        let mut tmp_buffer = vec![0u8; size];
        self.read_block(gpu_src_addr, &mut tmp_buffer);
        self.write_block(gpu_dest_addr, &tmp_buffer);
    }

    pub fn copy_block_unsafe(&self, gpu_dest_addr: u64, gpu_src_addr: u64, size: usize) {
        let mut tmp_buffer = vec![0u8; size];
        self.read_block_unsafe(gpu_src_addr, &mut tmp_buffer);
        self.write_block_unsafe(gpu_dest_addr, &tmp_buffer);
    }
}
