//! Command/completion ring engine for a DMA coprocessor.
//!
//! The device and the host share fixed-capacity rings in DMA-coherent
//! memory: the host fills submission rings with commands, the device
//! answers by writing completion records into a paired completion ring
//! and flagging each slot PENDING. This crate owns the rings, the
//! per-device queue table, and the drain loop that hands completions
//! back to the submitting queue in strict submission order.
//!
//! What it deliberately does not do: decode command payloads, throttle
//! submissions, or recover a queue once the device and host disagree on
//! ring position - it detects that desynchronization, quarantines the
//! queue, and leaves recovery to the owner.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use core::fmt;

pub mod cq;
pub mod error;
pub mod registry;
pub mod sq;
pub mod wire;

#[cfg(test)]
mod testdev;

pub use cq::CompletionQueue;
pub use error::{QueueError, Result};
pub use registry::{DrainReport, QueueRegistry, QueueSlot};
pub use sq::{Completion, CompletionHandler, SqState, SubmissionQueue};
pub use wire::{CompletionEntry, CompletionFlags, QueueMemcfg};

/// Number of queue ids addressable per device.
pub const MAX_QUEUES: usize = 32;

/// Queue identifier.
///
/// Valid ids live in `[0, MAX_QUEUES)` by construction; the raw id a
/// device reports in a completion entry goes through [`QueueId::new`]
/// before it can index anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(u16);

impl QueueId {
    /// Validate a raw queue id.
    pub const fn new(raw: u16) -> Option<Self> {
        if (raw as usize) < MAX_QUEUES {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Raw id as carried on the wire.
    pub const fn raw(self) -> u16 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
