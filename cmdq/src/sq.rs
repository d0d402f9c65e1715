//! Submission queue: host-to-device command ring.
//!
//! Command layout is opaque here; the protocol layer above fills slots
//! through [`SubmissionQueue::element_ptr`] and the device answers on
//! the paired completion queue. This module only tracks acknowledgment:
//! `head` is the oldest slot still awaiting its completion, and it
//! advances exactly once per completion routed by the dispatcher.
//!
//! # Slot lifecycle
//!
//! ```text
//!   Free ──filled by submission layer──> AwaitingCompletion
//!     ▲                                         │
//!     └──────────head advance (route)───────────┘
//! ```
//!
//! A completion whose index disagrees with `head` does not advance
//! anything: the whole queue drops to `Desynchronized` and stays there
//! until the owner tears it down.

use alloc::boxed::Box;

use dma_coherent::{CoherentDevice, DmaBuffer};

use crate::cq::CompletionQueue;
use crate::error::{QueueError, Result};
use crate::wire::QueueMemcfg;
use crate::QueueId;

/// Data the device reported for one completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Ring slot that completed (equal to the head it acknowledged).
    pub index: u32,
    /// Device status code.
    pub status: u32,
    /// Bytes transferred.
    pub data_size: u32,
    /// Command-specific result word.
    pub result: u64,
}

/// Per-queue completion callback.
///
/// Invoked by the dispatcher with the queue and the completion data,
/// before the head advances past the acknowledged slot. The callback
/// cannot fail and cannot stop ring progress.
pub type CompletionHandler = Box<dyn FnMut(&mut SubmissionQueue, &Completion) + Send>;

/// Routing state of a submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqState {
    /// Completions are routed normally.
    Live,
    /// An ordering violation was detected; completions are rejected.
    Desynchronized,
}

/// Host-writable command ring.
pub struct SubmissionQueue {
    id: QueueId,
    element_size: u32,
    element_count: u32,
    /// Oldest slot still awaiting acknowledgment.
    head: u32,
    state: SqState,
    completion: Option<CompletionHandler>,
    storage: DmaBuffer,
}

impl SubmissionQueue {
    /// Allocate a command ring of `element_count` slots of
    /// `element_size` bytes each.
    ///
    /// `completion` is invoked once per acknowledged slot; a queue
    /// created without one acknowledges silently.
    pub fn create<D: CoherentDevice>(
        dev: &D,
        id: QueueId,
        element_size: u32,
        element_count: u32,
        completion: Option<CompletionHandler>,
    ) -> Result<Self> {
        if element_count == 0 || element_count > u16::MAX as u32 || element_size == 0 {
            return Err(QueueError::InvalidElementCount);
        }
        let len = element_count as u64 * element_size as u64;
        if len > u32::MAX as u64 {
            // The descriptor carries the ring length as a u32.
            return Err(QueueError::InvalidElementCount);
        }
        let storage = dev.alloc_coherent(len as usize)?;
        log::debug!(
            "sq {}: created, {} slots x {} bytes",
            id,
            element_count,
            element_size
        );
        Ok(Self {
            id,
            element_size,
            element_count,
            head: 0,
            state: SqState::Live,
            completion,
            storage,
        })
    }

    /// Queue id.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Command slot size in bytes.
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Ring capacity in slots.
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Oldest slot still awaiting acknowledgment.
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Routing state.
    pub fn state(&self) -> SqState {
        self.state
    }

    /// True once an ordering violation has quarantined this queue.
    pub fn is_desynchronized(&self) -> bool {
        self.state == SqState::Desynchronized
    }

    /// Pointer to the command slot at `index`, for the submission layer
    /// to fill.
    ///
    /// The ring is shared with the device; writes that may race device
    /// reads must be volatile, and the slot must not be rewritten after
    /// the device has been told about it.
    pub fn element_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.element_count);
        unsafe {
            self.storage
                .as_ptr()
                .add(index as usize * self.element_size as usize)
        }
    }

    /// Build the registration descriptor, binding this ring's
    /// completions to `cq`.
    ///
    /// Recomputed on every call.
    pub fn memcfg(&self, cq: &CompletionQueue) -> QueueMemcfg {
        QueueMemcfg {
            qid: self.id.raw(),
            el_count: self.element_count as u16,
            vector_or_cq: cq.id().raw(),
            reserved: 0,
            addr: self.storage.bus_addr(),
            length: self.element_count * self.element_size,
        }
    }

    /// Release the ring storage.
    ///
    /// Same caller obligation as completion queues: the device must be
    /// done with the ring before this is called.
    pub fn destroy<D: CoherentDevice>(dev: &D, sq: Self) {
        log::debug!("sq {}: destroyed", sq.id);
        unsafe { dev.free_coherent(sq.storage) };
    }

    pub(crate) fn mark_desynchronized(&mut self) {
        self.state = SqState::Desynchronized;
    }

    /// Advance past the acknowledged slot, wrapping at capacity.
    pub(crate) fn advance_head(&mut self) {
        self.head = (self.head + 1) % self.element_count;
    }

    /// Detach the handler for the duration of a callback, so the
    /// callback can borrow the queue itself.
    pub(crate) fn take_handler(&mut self) -> Option<CompletionHandler> {
        self.completion.take()
    }

    pub(crate) fn restore_handler(&mut self, handler: CompletionHandler) {
        self.completion = Some(handler);
    }
}
