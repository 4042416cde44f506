//! Error types for the fallible entry points.
//!
//! Guest misbehaviour (unmapped reads, unsupported blit modes) is not an error:
//! it is logged and a default is produced. These types cover caller mistakes
//! and host failures.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("{what} {value:#x} is not aligned to the {page_size:#x} byte page size")]
    Misaligned {
        what: &'static str,
        value: u64,
        page_size: u64,
    },
    #[error("range {base:#x}+{size:#x} exceeds the address space")]
    OutOfRange { base: u64, size: u64 },
    #[error("physical address {0:#x} is outside device memory")]
    BadPhysicalAddress(u64),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GpuMemoryError {
    #[error("range {gpu_addr:#x}+{size:#x} exceeds the GPU address space")]
    OutOfRange { gpu_addr: u64, size: u64 },
    #[error("no free GPU address range of {size:#x} bytes")]
    OutOfAddressSpace { size: u64 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("graphics device lost")]
    DeviceLost,
    #[error("submission rejected: {0}")]
    Submit(String),
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("line {line}: expected {expected:#x} at {addr:#x}, found {actual:#x}")]
    Mismatch {
        line: usize,
        addr: u64,
        expected: u64,
        actual: u64,
    },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    GpuMemory(#[from] GpuMemoryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
