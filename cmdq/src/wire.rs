//! Hardware wire formats.
//!
//! CRITICAL: these structures are read and written by the device. Field
//! order and widths are part of the hardware contract and MUST NOT be
//! reordered or resized.

use bitflags::bitflags;

bitflags! {
    /// Flags word of a completion ring slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompletionFlags: u16 {
        /// Set by the device to hand the slot to the host; cleared by
        /// the host to return it.
        const PENDING = 1 << 0;
    }
}

/// Completion record the device writes into a completion ring slot.
///
/// 24 bytes, naturally aligned, no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionEntry {
    /// Id of the submission queue this completion answers.
    pub qid: u16,
    /// [`CompletionFlags`] bits.
    pub flags: u16,
    /// Ring slot the device claims to complete; must equal the target
    /// queue's head.
    pub completion_index: u32,
    /// Device status code for the command.
    pub status: u32,
    /// Bytes transferred, when the command moved data.
    pub data_size: u32,
    /// Command-specific result word.
    pub result: u64,
}

impl CompletionEntry {
    /// Slot size in bytes.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// True if the device has handed this slot to the host.
    pub fn is_pending(&self) -> bool {
        CompletionFlags::from_bits_truncate(self.flags).contains(CompletionFlags::PENDING)
    }
}

/// Queue registration descriptor handed to device register programming.
///
/// 20 bytes, packed; `u16,u16,u16,u16,u64,u32` on the wire.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct QueueMemcfg {
    /// Queue id being registered.
    pub qid: u16,
    /// Ring capacity in elements.
    pub el_count: u16,
    /// For a submission queue: id of the paired completion queue.
    /// For a completion queue: 0.
    pub vector_or_cq: u16,
    /// Always 0.
    pub reserved: u16,
    /// Bus address of the ring storage.
    pub addr: u64,
    /// Ring storage length in bytes.
    pub length: u32,
}

impl QueueMemcfg {
    /// Descriptor size in bytes.
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

const _: () = assert!(core::mem::size_of::<CompletionEntry>() == 24);
const _: () = assert!(core::mem::align_of::<CompletionEntry>() == 8);
const _: () = assert!(core::mem::size_of::<QueueMemcfg>() == 20);
