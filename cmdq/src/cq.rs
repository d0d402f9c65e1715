//! Completion queue: device-to-host response ring.
//!
//! The device writes a [`CompletionEntry`] into the slot at its own
//! write position and sets the PENDING flag; the host consumes slots in
//! order from `read_index` and clears the flag to return each slot.
//! The flag is the only synchronization between the two sides.

use dma_coherent::{CoherentDevice, DmaBuffer};

use crate::error::{QueueError, Result};
use crate::wire::{CompletionEntry, QueueMemcfg};
use crate::QueueId;

/// Device-writable completion ring with a host-side read index.
pub struct CompletionQueue {
    id: QueueId,
    element_count: u32,
    /// Next slot the host will inspect. Advances modulo `element_count`.
    read_index: u32,
    storage: DmaBuffer,
}

impl CompletionQueue {
    /// Allocate a completion ring of `element_count` slots.
    ///
    /// Storage comes zeroed from the device, so no slot starts PENDING.
    /// Fails without leaving partial state behind.
    pub fn create<D: CoherentDevice>(dev: &D, id: QueueId, element_count: u32) -> Result<Self> {
        if element_count == 0 || element_count > u16::MAX as u32 {
            return Err(QueueError::InvalidElementCount);
        }
        let storage = dev.alloc_coherent(element_count as usize * CompletionEntry::SIZE)?;
        log::debug!("cq {}: created, {} slots", id, element_count);
        Ok(Self {
            id,
            element_count,
            read_index: 0,
            storage,
        })
    }

    /// Queue id.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Ring capacity in slots.
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Host-side read position.
    pub fn read_index(&self) -> u32 {
        self.read_index
    }

    /// Build the registration descriptor for this ring.
    ///
    /// Recomputed on every call; a completion queue has no pairing
    /// target of its own, so `vector_or_cq` is 0.
    pub fn memcfg(&self) -> QueueMemcfg {
        QueueMemcfg {
            qid: self.id.raw(),
            el_count: self.element_count as u16,
            vector_or_cq: 0,
            reserved: 0,
            addr: self.storage.bus_addr(),
            length: (self.element_count as usize * CompletionEntry::SIZE) as u32,
        }
    }

    /// Release the ring storage.
    ///
    /// The caller must have told the device to stop using the queue
    /// first; nothing here fences in-flight device access.
    pub fn destroy<D: CoherentDevice>(dev: &D, cq: Self) {
        log::debug!("cq {}: destroyed", cq.id);
        unsafe { dev.free_coherent(cq.storage) };
    }

    /// Pointer to the ring slot at `index`.
    ///
    /// Slots are shared with the device; every access through this
    /// pointer must be volatile.
    pub(crate) fn entry_ptr(&self, index: u32) -> *mut CompletionEntry {
        debug_assert!(index < self.element_count);
        unsafe { (self.storage.as_ptr() as *mut CompletionEntry).add(index as usize) }
    }

    /// Advance the read position one slot, wrapping at capacity.
    pub(crate) fn advance(&mut self) {
        self.read_index = (self.read_index + 1) % self.element_count;
    }
}
