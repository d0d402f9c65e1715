//! Coherent DMA memory abstraction for bare-metal device drivers.
//!
//! A coherent buffer is simultaneously visible to the host CPU (through a
//! virtual pointer) and to a DMA-capable device (through a bus address),
//! with no cache layer allowed to desynchronize the two views. This crate
//! owns that pairing and the seam to whatever platform actually performs
//! the mapping.
//!
//! # Design Philosophy
//!
//! - **Zero firmware dependencies**: works on any platform
//! - **Device-agnostic**: any driver HAL can implement [`CoherentDevice`]
//! - **One value, both views**: a [`DmaBuffer`] carries the host pointer
//!   and the bus address together so their lifetimes can never diverge
//!
//! # Usage
//!
//! ```ignore
//! use dma_coherent::{CoherentDevice, DmaBuffer};
//!
//! let buf = device.alloc_coherent(4096)?;
//! program_device(buf.bus_addr(), buf.len() as u32);
//! // ... device is told to stop using the region ...
//! unsafe { device.free_coherent(buf) };
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

use core::fmt;
use core::ptr::NonNull;

/// Errors from coherent memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Coherent memory exhausted or the platform refused the mapping.
    AllocationFailed {
        /// Requested length in bytes.
        len: usize,
    },
    /// Zero-length allocations are rejected.
    ZeroLength,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed { len } => {
                write!(f, "coherent allocation of {} bytes failed", len)
            }
            Self::ZeroLength => write!(f, "zero-length coherent allocation"),
        }
    }
}

/// Device handle capable of mapping DMA-coherent memory.
///
/// Implemented by the platform/device layer that owns the physical
/// device (PCI function, IOMMU context, firmware service).
pub trait CoherentDevice {
    /// Allocate `len` bytes of zero-initialized coherent memory.
    ///
    /// The returned buffer must be aligned to at least 64 bytes so that
    /// naturally-aligned ring elements can be placed at any element
    /// boundary within it.
    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer, DmaError>;

    /// Release a buffer previously returned by [`alloc_coherent`].
    ///
    /// # Safety
    /// - `buffer` must originate from `alloc_coherent` on this device
    /// - the device must no longer access the region; this crate does
    ///   not fence that handoff
    ///
    /// [`alloc_coherent`]: CoherentDevice::alloc_coherent
    unsafe fn free_coherent(&self, buffer: DmaBuffer);
}

/// A DMA-coherent memory region.
///
/// Owns the CPU-accessible pointer and the device-visible bus address as
/// a single value. The bus address is exposed read-only; the two views
/// can never be split or resized.
pub struct DmaBuffer {
    host: NonNull<u8>,
    bus_addr: u64,
    len: usize,
}

impl DmaBuffer {
    /// Create a buffer from raw parts.
    ///
    /// # Safety
    /// - `host` must point to `len` bytes of valid DMA-coherent memory
    /// - `bus_addr` must be the device-visible address of the same bytes
    pub const unsafe fn new(host: NonNull<u8>, bus_addr: u64, len: usize) -> Self {
        Self { host, bus_addr, len }
    }

    /// CPU-side base pointer.
    ///
    /// The region is shared with the device; accesses that race device
    /// writes must be volatile.
    #[inline]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.host.as_ptr()
    }

    /// Bus address (what the device sees).
    #[inline]
    pub const fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Region length in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if the region is empty.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// SAFETY: the buffer is a plain (pointer, address, length) triple; the
// queue structures built on top serialize all shared-memory access.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("host", &self.host)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}
