//! Host-heap coherent allocator for unit tests.
//!
//! Plays the platform role: bus address equals the host address, the
//! way an identity-mapped machine behaves, so tests can "be the
//! device" by writing through the bus address from a memcfg.

use core::cell::Cell;
use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use dma_coherent::{CoherentDevice, DmaBuffer, DmaError};

pub struct TestDevice {
    live: Cell<usize>,
    fail_next: Cell<bool>,
}

impl TestDevice {
    pub fn new() -> Self {
        Self {
            live: Cell::new(0),
            fail_next: Cell::new(false),
        }
    }

    /// Outstanding allocations.
    pub fn live(&self) -> usize {
        self.live.get()
    }

    /// Make the next allocation fail, like a host with exhausted
    /// coherent memory.
    pub fn fail_next_alloc(&self) {
        self.fail_next.set(true);
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len, 64).unwrap()
    }
}

impl CoherentDevice for TestDevice {
    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }
        if self.fail_next.replace(false) {
            return Err(DmaError::AllocationFailed { len });
        }
        let ptr = unsafe { alloc_zeroed(Self::layout(len)) };
        let host = NonNull::new(ptr).ok_or(DmaError::AllocationFailed { len })?;
        self.live.set(self.live.get() + 1);
        Ok(unsafe { DmaBuffer::new(host, ptr as u64, len) })
    }

    unsafe fn free_coherent(&self, buffer: DmaBuffer) {
        dealloc(buffer.as_ptr(), Self::layout(buffer.len()));
        self.live.set(self.live.get() - 1);
    }
}
