//! Guest virtual memory for the emulated application processor.
//!
//! A flat page table maps guest virtual pages onto host pointers into
//! [`DeviceMemory`]. Pages the GPU has cached are flagged
//! [`PageType::RasterizerCachedMemory`]: their direct pointer is withheld so every
//! access takes the slow path, which keeps the rasterizer coherent with the
//! guest-visible contents before reads and after writes.
//!
//! Out-of-range or unmapped accesses are guest behaviour, not bugs: they log an
//! error and read as zero or are dropped. A `Memory` page without a pointer is an
//! internal invariant violation and panics.

use crate::error::MemoryError;
use crate::rasterizer::RasterizerInterface;
use oxidinx_hw::memory_map::{cpu_page, dram};
use parking_lot::RwLock;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, instrument, trace};

pub const PAGE_BITS: u64 = cpu_page::BITS;
pub const PAGE_SIZE: u64 = cpu_page::SIZE;
pub const PAGE_MASK: u64 = cpu_page::MASK;

// ================================================================================================
// Host backing
// ================================================================================================

/// Raw host pointer into device memory.
///
/// Guest memory is shared by every emulated core and the GPU, so pointers are
/// handed across threads freely. Accesses through them are unsynchronised just
/// like the hardware they model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// SAFETY: a HostPtr always points into a DeviceMemory allocation that outlives
// every page table referencing it (the page table holds an Arc to it).
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    fn add(self, offset: u64) -> Self {
        // SAFETY: callers only offset within the page the pointer was derived for.
        HostPtr(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)) })
    }
}

/// Host allocation standing in for the console's physical DRAM.
///
/// Physical addresses start at [`dram::BASE`]. The allocation is made of `u64`
/// words so every naturally aligned guest access is also aligned on the host,
/// which the exclusive (atomic) accessors rely on.
pub struct DeviceMemory {
    buffer: NonNull<u64>,
    words: usize,
}

// SAFETY: the buffer is a plain heap allocation owned by this struct.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl DeviceMemory {
    /// Allocate `size` bytes of zeroed DRAM, rounded up to whole pages.
    pub fn new(size: u64) -> Self {
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let words = (size / 8) as usize;
        let boxed: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u64;
        Self {
            // SAFETY: Box::into_raw never returns null.
            buffer: unsafe { NonNull::new_unchecked(raw) },
            words,
        }
    }

    pub fn size(&self) -> u64 {
        self.words as u64 * 8
    }

    /// Whether `[paddr, paddr + size)` lies inside DRAM.
    pub fn contains(&self, paddr: u64, size: u64) -> bool {
        paddr >= dram::BASE
            && paddr
                .checked_add(size)
                .is_some_and(|end| end <= dram::BASE + self.size())
    }

    /// Host pointer for a physical address, or `None` outside DRAM.
    pub fn get_pointer(&self, paddr: u64) -> Option<HostPtr> {
        if !self.contains(paddr, 1) {
            return None;
        }
        let offset = (paddr - dram::BASE) as usize;
        // SAFETY: offset was bounds checked above.
        let ptr = unsafe { (self.buffer.as_ptr() as *mut u8).add(offset) };
        NonNull::new(ptr).map(HostPtr)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        // SAFETY: reconstructs exactly the boxed slice leaked in `new`.
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.buffer.as_ptr(), self.words);
            drop(Box::from_raw(slice));
        }
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("base", &format_args!("{:#x}", dram::BASE))
            .field("size", &format_args!("{:#x}", self.size()))
            .finish()
    }
}

// ================================================================================================
// Page table
// ================================================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageType {
    /// Not mapped into the address space
    #[default]
    Unmapped,
    /// Backed by host memory reachable through the page pointer
    Memory,
    /// Backed by host memory, but the GPU holds cached copies: accesses go through
    /// the backing address table and notify the rasterizer
    RasterizerCachedMemory,
    /// Reserved for MMIO-like regions; never created by this crate
    Special,
}

struct PageTable {
    pointers: Vec<Option<HostPtr>>,
    /// Physical address backing each page, 0 when none
    backing_addr: Vec<u64>,
    attributes: Vec<PageType>,
}

impl PageTable {
    fn new(num_pages: usize) -> Self {
        Self {
            pointers: vec![None; num_pages],
            backing_addr: vec![0; num_pages],
            attributes: vec![PageType::Unmapped; num_pages],
        }
    }

    fn len(&self) -> usize {
        self.pointers.len()
    }
}

/// Result of resolving one guest address
#[derive(Debug, Clone, Copy)]
enum PageLookup {
    Direct(HostPtr),
    Cached(HostPtr),
    Unmapped,
}

/// Guest integer types that can be loaded and stored.
pub trait GuestValue: Copy + Default + std::fmt::LowerHex + Send + 'static {
    const BITS: u32;
    fn to_u64(self) -> u64;
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_guest_value {
    ($($ty:ty),*) => {$(
        impl GuestValue for $ty {
            const BITS: u32 = <$ty>::BITS;
            fn to_u64(self) -> u64 {
                self as u64
            }
            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        }
    )*};
}

impl_guest_value!(u8, u16, u32, u64);

// ================================================================================================
// Memory
// ================================================================================================

/// Guest virtual address space of one process.
///
/// Callers must serialise conflicting mapping changes; individual accesses
/// only take the page-table lock long enough to copy a pointer out.
pub struct Memory {
    device: Arc<DeviceMemory>,
    page_table: RwLock<PageTable>,
    rasterizer: RwLock<Option<Weak<dyn RasterizerInterface>>>,
}

impl Memory {
    /// Create an address space of `1 << address_space_bits` bytes over `device`.
    ///
    /// Panics if the space is smaller than one page or too large to index.
    pub fn new(device: Arc<DeviceMemory>, address_space_bits: u32) -> Self {
        assert!(
            (PAGE_BITS..usize::BITS as u64).contains(&(address_space_bits as u64)),
            "Guest address space of {address_space_bits} bits cannot hold a page table"
        );
        let num_pages = 1usize << (address_space_bits as u64 - PAGE_BITS);
        debug!(
            "Creating guest address space of {} pages ({} bits)",
            num_pages, address_space_bits
        );
        Self {
            device,
            page_table: RwLock::new(PageTable::new(num_pages)),
            rasterizer: RwLock::new(None),
        }
    }

    pub fn device(&self) -> &Arc<DeviceMemory> {
        &self.device
    }

    /// Connect the rasterizer that receives flush/invalidate notifications.
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

    /// Map `[base, base + size)` onto physical memory starting at `target`.
    pub fn map_memory_region(&self, base: u64, size: u64, target: u64) -> Result<(), MemoryError> {
        check_page_aligned("base", base)?;
        check_page_aligned("size", size)?;
        if !self.device.contains(target, size) {
            return Err(MemoryError::BadPhysicalAddress(target));
        }
        self.map_pages(base >> PAGE_BITS, size >> PAGE_BITS, target, PageType::Memory)
    }

    /// Remove `[base, base + size)` from the address space.
    pub fn unmap_region(&self, base: u64, size: u64) -> Result<(), MemoryError> {
        check_page_aligned("base", base)?;
        check_page_aligned("size", size)?;
        self.map_pages(base >> PAGE_BITS, size >> PAGE_BITS, 0, PageType::Unmapped)
    }

    fn map_pages(
        &self,
        base: u64,
        num_pages: u64,
        mut target: u64,
        page_type: PageType,
    ) -> Result<(), MemoryError> {
        debug!(
            "Mapping {:#x} onto {:#x}-{:#x}",
            target,
            base << PAGE_BITS,
            (base + num_pages) << PAGE_BITS
        );
        let end = base + num_pages;

        // Cached pages must be written back before their mapping changes.
        let cached_pages: Vec<u64> = {
            let table = self.page_table.read();
            if end as usize > table.len() {
                return Err(MemoryError::OutOfRange {
                    base: base << PAGE_BITS,
                    size: num_pages << PAGE_BITS,
                });
            }
            (base..end)
                .filter(|&page| {
                    table.attributes[page as usize] == PageType::RasterizerCachedMemory
                })
                .collect()
        };
        for page in cached_pages {
            self.with_rasterizer(|r| r.flush_and_invalidate_region(page << PAGE_BITS, PAGE_SIZE));
        }

        let mut table = self.page_table.write();
        if target == 0 {
            assert!(
                page_type != PageType::Memory,
                "mapping memory page without a pointer @ {:#x}",
                base << PAGE_BITS
            );
            for page in base..end {
                let page = page as usize;
                table.pointers[page] = None;
                table.attributes[page] = page_type;
                table.backing_addr[page] = 0;
            }
        } else {
            for page in base..end {
                let page = page as usize;
                table.pointers[page] = self.device.get_pointer(target);
                table.attributes[page] = page_type;
                table.backing_addr[page] = target;
                target += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Current attribute of the page containing `vaddr`.
    pub fn page_type(&self, vaddr: u64) -> PageType {
        let table = self.page_table.read();
        let page = (vaddr >> PAGE_BITS) as usize;
        table.attributes.get(page).copied().unwrap_or_default()
    }

    fn lookup(&self, vaddr: u64) -> PageLookup {
        let table = self.page_table.read();
        let page = (vaddr >> PAGE_BITS) as usize;
        if page >= table.len() {
            return PageLookup::Unmapped;
        }
        let offset = vaddr & PAGE_MASK;
        if let Some(ptr) = table.pointers[page] {
            return PageLookup::Direct(ptr.add(offset));
        }
        match table.attributes[page] {
            PageType::Unmapped => PageLookup::Unmapped,
            PageType::Memory => panic!("mapped memory page {vaddr:#x} without a pointer"),
            PageType::RasterizerCachedMemory => {
                match self.device.get_pointer(table.backing_addr[page]) {
                    Some(ptr) => PageLookup::Cached(ptr.add(offset)),
                    None => PageLookup::Unmapped,
                }
            }
            PageType::Special => unreachable!("special page {vaddr:#x} accessed as memory"),
        }
    }

    pub fn is_valid_virtual_address(&self, vaddr: u64) -> bool {
        let table = self.page_table.read();
        let page = (vaddr >> PAGE_BITS) as usize;
        if page >= table.len() {
            return false;
        }
        table.pointers[page].is_some()
            || table.attributes[page] == PageType::RasterizerCachedMemory
    }

    /// Host pointer for `vaddr`, following the backing table for cached pages.
    pub fn get_pointer(&self, vaddr: u64) -> Option<HostPtr> {
        match self.lookup(vaddr) {
            PageLookup::Direct(ptr) | PageLookup::Cached(ptr) => Some(ptr),
            PageLookup::Unmapped => {
                error!("Unknown GetPointer @ {:#x}", vaddr);
                None
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Typed accesses
    // --------------------------------------------------------------------------------------------

    fn read<T: GuestValue>(&self, vaddr: u64) -> T {
        let size = size_of::<T>() as u64;
        match self.lookup(vaddr) {
            // SAFETY: the pointer addresses `size` bytes inside one mapped page.
            PageLookup::Direct(ptr) => unsafe { ptr.as_ptr().cast::<T>().read_unaligned() },
            PageLookup::Cached(ptr) => {
                self.with_rasterizer(|r| r.flush_region(vaddr, size));
                // SAFETY: as above, the backing page is still live device memory.
                unsafe { ptr.as_ptr().cast::<T>().read_unaligned() }
            }
            PageLookup::Unmapped => {
                error!("Unmapped Read{} @ {:#x}", T::BITS, vaddr);
                T::default()
            }
        }
    }

    fn write<T: GuestValue>(&self, vaddr: u64, data: T) {
        let size = size_of::<T>() as u64;
        match self.lookup(vaddr) {
            // SAFETY: the pointer addresses `size` bytes inside one mapped page.
            PageLookup::Direct(ptr) => unsafe { ptr.as_ptr().cast::<T>().write_unaligned(data) },
            PageLookup::Cached(ptr) => {
                // SAFETY: as above.
                unsafe { ptr.as_ptr().cast::<T>().write_unaligned(data) };
                self.with_rasterizer(|r| r.invalidate_region(vaddr, size));
            }
            PageLookup::Unmapped => {
                error!("Unmapped Write{} {:#x} @ {:#x}", T::BITS, data, vaddr);
            }
        }
    }

    pub fn read8(&self, vaddr: u64) -> u8 {
        self.read::<u8>(vaddr)
    }

    pub fn read16(&self, vaddr: u64) -> u16 {
        if vaddr & 1 == 0 {
            self.read::<u16>(vaddr)
        } else {
            let lo = self.read8(vaddr) as u16;
            let hi = self.read8(vaddr + 1) as u16;
            lo | (hi << 8)
        }
    }

    pub fn read32(&self, vaddr: u64) -> u32 {
        if vaddr & 3 == 0 {
            self.read::<u32>(vaddr)
        } else {
            let lo = self.read16(vaddr) as u32;
            let hi = self.read16(vaddr + 2) as u32;
            lo | (hi << 16)
        }
    }

    pub fn read64(&self, vaddr: u64) -> u64 {
        if vaddr & 7 == 0 {
            self.read::<u64>(vaddr)
        } else {
            let lo = self.read32(vaddr) as u64;
            let hi = self.read32(vaddr + 4) as u64;
            lo | (hi << 32)
        }
    }

    pub fn write8(&self, vaddr: u64, data: u8) {
        self.write::<u8>(vaddr, data)
    }

    pub fn write16(&self, vaddr: u64, data: u16) {
        if vaddr & 1 == 0 {
            self.write::<u16>(vaddr, data)
        } else {
            self.write8(vaddr, data as u8);
            self.write8(vaddr + 1, (data >> 8) as u8);
        }
    }

    pub fn write32(&self, vaddr: u64, data: u32) {
        if vaddr & 3 == 0 {
            self.write::<u32>(vaddr, data)
        } else {
            self.write16(vaddr, data as u16);
            self.write16(vaddr + 2, (data >> 16) as u16);
        }
    }

    pub fn write64(&self, vaddr: u64, data: u64) {
        if vaddr & 7 == 0 {
            self.write::<u64>(vaddr, data)
        } else {
            self.write32(vaddr, data as u32);
            self.write32(vaddr + 4, (data >> 32) as u32);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Exclusive (compare-and-swap) stores
    // --------------------------------------------------------------------------------------------

    fn write_exclusive<T: GuestValue>(
        &self,
        vaddr: u64,
        data: T,
        expected: T,
        cas: impl FnOnce(*mut u8, T, T) -> bool,
    ) -> bool {
        let size = size_of::<T>() as u64;
        if vaddr & (size - 1) != 0 {
            error!("Misaligned WriteExclusive{} @ {:#x}", T::BITS, vaddr);
            return false;
        }
        match self.lookup(vaddr) {
            PageLookup::Direct(ptr) => cas(ptr.as_ptr(), data, expected),
            PageLookup::Cached(ptr) => {
                self.with_rasterizer(|r| r.invalidate_region(vaddr, size));
                cas(ptr.as_ptr(), data, expected)
            }
            PageLookup::Unmapped => {
                // Reported as a successful store without touching memory.
                error!("Unmapped WriteExclusive{} {:#x} @ {:#x}", T::BITS, data, vaddr);
                true
            }
        }
    }

    pub fn write_exclusive8(&self, vaddr: u64, data: u8, expected: u8) -> bool {
        self.write_exclusive(vaddr, data, expected, |ptr, data, expected| {
            // SAFETY: ptr is a live, naturally aligned pointer into device memory.
            let atomic = unsafe { AtomicU8::from_ptr(ptr) };
            atomic
                .compare_exchange(expected, data, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    pub fn write_exclusive16(&self, vaddr: u64, data: u16, expected: u16) -> bool {
        self.write_exclusive(vaddr, data, expected, |ptr, data, expected| {
            // SAFETY: alignment was checked and device memory is u64 aligned.
            let atomic = unsafe { AtomicU16::from_ptr(ptr.cast()) };
            atomic
                .compare_exchange(expected, data, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    pub fn write_exclusive32(&self, vaddr: u64, data: u32, expected: u32) -> bool {
        self.write_exclusive(vaddr, data, expected, |ptr, data, expected| {
            // SAFETY: alignment was checked and device memory is u64 aligned.
            let atomic = unsafe { AtomicU32::from_ptr(ptr.cast()) };
            atomic
                .compare_exchange(expected, data, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    pub fn write_exclusive64(&self, vaddr: u64, data: u64, expected: u64) -> bool {
        self.write_exclusive(vaddr, data, expected, |ptr, data, expected| {
            // SAFETY: alignment was checked and device memory is u64 aligned.
            let atomic = unsafe { AtomicU64::from_ptr(ptr.cast()) };
            atomic
                .compare_exchange(expected, data, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    /// Read a NUL-terminated string of at most `max_length` bytes.
    pub fn read_cstring(&self, mut vaddr: u64, max_length: usize) -> String {
        let mut bytes = Vec::new();
        while bytes.len() < max_length {
            let byte = self.read8(vaddr);
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            vaddr += 1;
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // --------------------------------------------------------------------------------------------
    // Block accesses
    // --------------------------------------------------------------------------------------------

    #[instrument(level = "trace", skip(self, dest_buffer))]
    pub fn read_block(&self, src_addr: u64, dest_buffer: &mut [u8]) {
        self.read_block_impl(src_addr, dest_buffer, true)
    }

    pub fn read_block_unsafe(&self, src_addr: u64, dest_buffer: &mut [u8]) {
        self.read_block_impl(src_addr, dest_buffer, false)
    }

    fn read_block_impl(&self, src_addr: u64, dest_buffer: &mut [u8], coherent: bool) {
        let size = dest_buffer.len();
        for_each_page_chunk(src_addr, size, |current_vaddr, offset, amount| {
            let dest = &mut dest_buffer[offset..offset + amount];
            match self.lookup(current_vaddr) {
                PageLookup::Direct(ptr) => copy_from_host(ptr, dest),
                PageLookup::Cached(ptr) => {
                    if coherent {
                        self.with_rasterizer(|r| r.flush_region(current_vaddr, amount as u64));
                    }
                    copy_from_host(ptr, dest)
                }
                PageLookup::Unmapped => {
                    error!(
                        "Unmapped ReadBlock @ {:#x} (start address = {:#x}, size = {})",
                        current_vaddr, src_addr, size
                    );
                    dest.fill(0);
                }
            }
        });
    }

    #[instrument(level = "trace", skip(self, src_buffer))]
    pub fn write_block(&self, dest_addr: u64, src_buffer: &[u8]) {
        self.write_block_impl(dest_addr, src_buffer, true)
    }

    pub fn write_block_unsafe(&self, dest_addr: u64, src_buffer: &[u8]) {
        self.write_block_impl(dest_addr, src_buffer, false)
    }

    fn write_block_impl(&self, dest_addr: u64, src_buffer: &[u8], coherent: bool) {
        let size = src_buffer.len();
        for_each_page_chunk(dest_addr, size, |current_vaddr, offset, amount| {
            let src = &src_buffer[offset..offset + amount];
            match self.lookup(current_vaddr) {
                PageLookup::Direct(ptr) => copy_to_host(ptr, src),
                PageLookup::Cached(ptr) => {
                    if coherent {
                        self.with_rasterizer(|r| r.invalidate_region(current_vaddr, amount as u64));
                    }
                    copy_to_host(ptr, src)
                }
                PageLookup::Unmapped => {
                    error!(
                        "Unmapped WriteBlock @ {:#x} (start address = {:#x}, size = {})",
                        current_vaddr, dest_addr, size
                    );
                }
            }
        });
    }

    pub fn zero_block(&self, dest_addr: u64, size: usize) {
        for_each_page_chunk(dest_addr, size, |current_vaddr, _, amount| {
            match self.lookup(current_vaddr) {
                // SAFETY: the chunk never crosses the end of the mapped page.
                PageLookup::Direct(ptr) => unsafe { ptr.as_ptr().write_bytes(0, amount) },
                PageLookup::Cached(ptr) => {
                    self.with_rasterizer(|r| r.invalidate_region(current_vaddr, amount as u64));
                    // SAFETY: as above.
                    unsafe { ptr.as_ptr().write_bytes(0, amount) }
                }
                PageLookup::Unmapped => {
                    error!(
                        "Unmapped ZeroBlock @ {:#x} (start address = {:#x}, size = {})",
                        current_vaddr, dest_addr, size
                    );
                }
            }
        });
    }

    pub fn copy_block(&self, dest_addr: u64, src_addr: u64, size: usize) {
        let mut staging = Vec::with_capacity(PAGE_SIZE as usize);
        for_each_page_chunk(src_addr, size, |current_vaddr, offset, amount| {
            let dest = dest_addr + offset as u64;
            match self.lookup(current_vaddr) {
                PageLookup::Direct(ptr) => {
                    staging.resize(amount, 0);
                    copy_from_host(ptr, &mut staging);
                    self.write_block(dest, &staging);
                }
                PageLookup::Cached(ptr) => {
                    self.with_rasterizer(|r| r.flush_region(current_vaddr, amount as u64));
                    staging.resize(amount, 0);
                    copy_from_host(ptr, &mut staging);
                    self.write_block(dest, &staging);
                }
                PageLookup::Unmapped => {
                    error!(
                        "Unmapped CopyBlock @ {:#x} (start address = {:#x}, size = {})",
                        current_vaddr, src_addr, size
                    );
                    self.zero_block(dest, amount);
                }
            }
        });
    }

    // --------------------------------------------------------------------------------------------
    // Rasterizer cache marking
    // --------------------------------------------------------------------------------------------

    /// Toggle CPU pages between direct and rasterizer-cached access.
    pub fn rasterizer_mark_region_cached(&self, vaddr: u64, size: u64, cached: bool) {
        if vaddr == 0 || size == 0 {
            return;
        }
        trace!("Marking {:#x}+{:#x} cached={}", vaddr, size, cached);
        let first_page = vaddr >> PAGE_BITS;
        let last_page = (vaddr + size - 1) >> PAGE_BITS;

        let mut table = self.page_table.write();
        for page in first_page..=last_page {
            let page = page as usize;
            if page >= table.len() {
                break;
            }
            match (cached, table.attributes[page]) {
                (true, PageType::Memory) => {
                    table.attributes[page] = PageType::RasterizerCachedMemory;
                    table.pointers[page] = None;
                }
                (false, PageType::RasterizerCachedMemory) => {
                    match self.device.get_pointer(table.backing_addr[page]) {
                        Some(ptr) => {
                            table.pointers[page] = Some(ptr);
                            table.attributes[page] = PageType::Memory;
                        }
                        None => {
                            error!(
                                "Cached page {:#x} lost its backing memory, leaving it unmapped",
                                (page as u64) << PAGE_BITS
                            );
                            table.attributes[page] = PageType::Unmapped;
                        }
                    }
                }
                // Several GPU mappings may alias one CPU page, and a process need
                // not map every GPU-visible region.
                (_, PageType::Unmapped)
                | (true, PageType::RasterizerCachedMemory)
                | (false, PageType::Memory) => {}
                (_, PageType::Special) => unreachable!("special page marked for caching"),
            }
        }
    }
}

fn check_page_aligned(what: &'static str, value: u64) -> Result<(), MemoryError> {
    if value & PAGE_MASK != 0 {
        return Err(MemoryError::Misaligned {
            what,
            value,
            page_size: PAGE_SIZE,
        });
    }
    Ok(())
}

/// Split `[addr, addr + size)` at CPU page boundaries.
///
/// The callback receives the chunk's guest address, its offset into the
/// caller's buffer and its length.
pub(crate) fn for_each_page_chunk(addr: u64, size: usize, mut f: impl FnMut(u64, usize, usize)) {
    let mut remaining = size;
    let mut page_index = addr >> PAGE_BITS;
    let mut page_offset = (addr & PAGE_MASK) as usize;
    let mut buffer_offset = 0;
    while remaining > 0 {
        let amount = remaining.min(PAGE_SIZE as usize - page_offset);
        let current_vaddr = (page_index << PAGE_BITS) + page_offset as u64;
        f(current_vaddr, buffer_offset, amount);
        page_index += 1;
        page_offset = 0;
        buffer_offset += amount;
        remaining -= amount;
    }
}

fn copy_from_host(ptr: HostPtr, dest: &mut [u8]) {
    // SAFETY: ptr addresses at least dest.len() bytes inside one page of device
    // memory; the regions cannot overlap a Rust-owned buffer.
    unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), dest.as_mut_ptr(), dest.len()) }
}

fn copy_to_host(ptr: HostPtr, src: &[u8]) {
    // SAFETY: as in copy_from_host.
    unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) }
}
