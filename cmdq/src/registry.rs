//! Queue table and completion dispatch.
//!
//! One registry per device: a fixed table of queues indexed by queue
//! id, plus the drain loop an interrupt handler or polling thread
//! invokes to pull completions out of a completion ring and
//! acknowledge them on the submission queue that produced them.
//!
//! # Contract
//! - `&mut self` receivers serialize drains; the device side needs no
//!   host lock because the PENDING flag is the only handoff between
//!   the two writers of a slot.
//! - Nothing here blocks. A drain consumes what is pending and
//!   returns.

use core::fmt;
use core::sync::atomic::{fence, Ordering};

use crate::cq::CompletionQueue;
use crate::error::{QueueError, Result};
use crate::sq::{Completion, SubmissionQueue};
use crate::wire::{CompletionEntry, CompletionFlags};
use crate::{QueueId, MAX_QUEUES};

/// A registered queue: submission or completion.
pub enum QueueSlot {
    Submission(SubmissionQueue),
    Completion(CompletionQueue),
}

impl QueueSlot {
    /// Id of the queue in this slot.
    pub fn id(&self) -> QueueId {
        match self {
            Self::Submission(sq) => sq.id(),
            Self::Completion(cq) => cq.id(),
        }
    }
}

impl fmt::Debug for QueueSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submission(sq) => f.debug_tuple("Submission").field(&sq.id()).finish(),
            Self::Completion(cq) => f.debug_tuple("Completion").field(&cq.id()).finish(),
        }
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries routed and acknowledged.
    pub consumed: u32,
    /// Entries dropped by validation; their slots were still returned
    /// to the device.
    pub rejected: u32,
}

impl DrainReport {
    /// Total slots relinquished back to the device.
    pub fn total(&self) -> u32 {
        self.consumed + self.rejected
    }
}

/// Per-device queue table, indexed by queue id.
///
/// The owner inserts a queue after creating it and must remove it
/// before destroying it, or completions would route into freed memory.
pub struct QueueRegistry {
    slots: [Option<QueueSlot>; MAX_QUEUES],
}

impl QueueRegistry {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Register a queue under its own id.
    ///
    /// A live queue already holding the id refuses the insert; the
    /// rejected queue comes back to the caller, which still owns
    /// device memory that must be freed through the device.
    pub fn insert(&mut self, slot: QueueSlot) -> core::result::Result<(), QueueSlot> {
        let idx = slot.id().index();
        if self.slots[idx].is_some() {
            return Err(slot);
        }
        self.slots[idx] = Some(slot);
        Ok(())
    }

    /// Unregister and return the queue with this id.
    pub fn remove(&mut self, id: QueueId) -> Option<QueueSlot> {
        self.slots[id.index()].take()
    }

    /// Look up a queue.
    pub fn get(&self, id: QueueId) -> Option<&QueueSlot> {
        self.slots[id.index()].as_ref()
    }

    /// Look up a queue mutably.
    pub fn get_mut(&mut self, id: QueueId) -> Option<&mut QueueSlot> {
        self.slots[id.index()].as_mut()
    }

    /// Route one completion entry to the submission queue it answers.
    ///
    /// Validation order is fixed: id range, queue existence and kind,
    /// quarantine, then head match. A mismatched head quarantines the
    /// queue without advancing it; completions are matched by ring
    /// position, one slot at a time, so a diverged head can never be
    /// resynchronized from here. On success the callback (if any) runs
    /// and the head advances regardless of what the callback did.
    pub fn route(&mut self, entry: &CompletionEntry) -> Result<()> {
        let id = QueueId::new(entry.qid).ok_or(QueueError::OutOfRangeQueueId)?;
        let sq = match self.slots[id.index()].as_mut() {
            Some(QueueSlot::Submission(sq)) => sq,
            _ => return Err(QueueError::UnknownOrWrongKindQueue),
        };
        if sq.is_desynchronized() {
            return Err(QueueError::QueueDesynchronized);
        }
        if sq.head() != entry.completion_index {
            sq.mark_desynchronized();
            return Err(QueueError::OrderingViolation);
        }
        let completion = Completion {
            index: entry.completion_index,
            status: entry.status,
            data_size: entry.data_size,
            result: entry.result,
        };
        if let Some(mut handler) = sq.take_handler() {
            handler(sq, &completion);
            sq.restore_handler(handler);
        }
        sq.advance_head();
        Ok(())
    }

    /// Drain pending entries from completion queue `id`.
    ///
    /// This is the unit an interrupt handler or polling thread invokes.
    /// It walks the ring from the queue's read index, stops at the
    /// first slot whose PENDING flag is clear, and returns every
    /// visited slot to the device - including entries that failed
    /// validation, which are logged and counted in the report.
    pub fn drain_completions(&mut self, id: QueueId) -> Result<DrainReport> {
        // Take the queue out of the table for the duration: routing
        // below needs the table, and a taken queue also excludes any
        // second drain of the same ring.
        let mut cq = match self.slots[id.index()].take() {
            Some(QueueSlot::Completion(cq)) => cq,
            other => {
                self.slots[id.index()] = other;
                return Err(QueueError::UnknownOrWrongKindQueue);
            }
        };

        let mut report = DrainReport::default();
        loop {
            let slot = cq.entry_ptr(cq.read_index());
            // Flags first; the rest of the entry is only meaningful
            // once PENDING is observed.
            let flags = unsafe { core::ptr::addr_of!((*slot).flags).read_volatile() };
            if !CompletionFlags::from_bits_truncate(flags).contains(CompletionFlags::PENDING) {
                break;
            }
            // The flag read must not be reordered after the payload
            // reads; pairs with the device publishing payload before
            // flag.
            fence(Ordering::Acquire);
            let entry = unsafe { slot.read_volatile() };

            match self.route(&entry) {
                Ok(()) => report.consumed += 1,
                Err(err) => {
                    report.rejected += 1;
                    log::error!(
                        "cq {}: dropped completion for qid {} (index {}): {}",
                        id,
                        entry.qid,
                        entry.completion_index,
                        err
                    );
                }
            }

            // Processing must be complete before the slot is handed
            // back to the device.
            fence(Ordering::Release);
            unsafe { core::ptr::addr_of_mut!((*slot).flags).write_volatile(0) };
            cq.advance();
        }

        self.slots[id.index()] = Some(QueueSlot::Completion(cq));
        Ok(report)
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdev::TestDevice;
    use alloc::boxed::Box;
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    fn qid(raw: u16) -> QueueId {
        QueueId::new(raw).unwrap()
    }

    fn entry(raw_qid: u16, index: u32) -> CompletionEntry {
        CompletionEntry {
            qid: raw_qid,
            flags: CompletionFlags::PENDING.bits(),
            completion_index: index,
            status: 0,
            data_size: 0,
            result: 0,
        }
    }

    /// Registry with SQ 3 (8 slots, recording callback) paired to CQ 1.
    fn harness(dev: &TestDevice) -> (QueueRegistry, Arc<Mutex<Vec<Completion>>>) {
        let seen: Arc<Mutex<Vec<Completion>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: crate::CompletionHandler =
            Box::new(move |_sq, c| sink.lock().unwrap().push(*c));

        let mut reg = QueueRegistry::new();
        let cq = CompletionQueue::create(dev, qid(1), 8).unwrap();
        let sq = SubmissionQueue::create(dev, qid(3), 64, 8, Some(handler)).unwrap();
        reg.insert(QueueSlot::Completion(cq)).unwrap();
        reg.insert(QueueSlot::Submission(sq)).unwrap();
        (reg, seen)
    }

    fn sq_of(reg: &QueueRegistry, id: u16) -> &SubmissionQueue {
        match reg.get(qid(id)) {
            Some(QueueSlot::Submission(sq)) => sq,
            _ => panic!("sq {} not registered", id),
        }
    }

    /// Play the device: write an entry into the CQ ring and flag it.
    fn device_post(reg: &QueueRegistry, cq_id: u16, slot: u32, e: CompletionEntry) {
        let cq = match reg.get(qid(cq_id)) {
            Some(QueueSlot::Completion(cq)) => cq,
            _ => panic!("cq {} not registered", cq_id),
        };
        unsafe { cq.entry_ptr(slot).write_volatile(e) };
    }

    #[test]
    fn insert_hands_back_a_duplicate_id() {
        let dev = TestDevice::new();
        let mut reg = QueueRegistry::new();
        let a = CompletionQueue::create(&dev, qid(1), 4).unwrap();
        let b = CompletionQueue::create(&dev, qid(1), 4).unwrap();
        reg.insert(QueueSlot::Completion(a)).unwrap();
        match reg.insert(QueueSlot::Completion(b)) {
            Err(QueueSlot::Completion(b)) => CompletionQueue::destroy(&dev, b),
            other => panic!("expected the rejected queue back, got {:?}", other),
        }
        // The rejected queue could still be torn down; the first one is live.
        assert_eq!(dev.live(), 1);
    }

    #[test]
    fn remove_returns_the_slot() {
        let dev = TestDevice::new();
        let mut reg = QueueRegistry::new();
        let cq = CompletionQueue::create(&dev, qid(6), 4).unwrap();
        reg.insert(QueueSlot::Completion(cq)).unwrap();
        let slot = reg.remove(qid(6)).unwrap();
        assert_eq!(slot.id(), qid(6));
        assert!(reg.get(qid(6)).is_none());
        if let QueueSlot::Completion(cq) = slot {
            CompletionQueue::destroy(&dev, cq);
        }
        assert_eq!(dev.live(), 0);
    }

    #[test]
    fn route_accepts_in_order_completions() {
        let dev = TestDevice::new();
        let (mut reg, seen) = harness(&dev);
        // 8-slot ring, 10 in-order completions: indices wrap.
        for i in 0..10u32 {
            reg.route(&entry(3, i % 8)).unwrap();
        }
        assert_eq!(sq_of(&reg, 3).head(), 10 % 8);
        assert_eq!(seen.lock().unwrap().len(), 10);
    }

    #[test]
    fn route_passes_completion_data_to_the_callback() {
        let dev = TestDevice::new();
        let (mut reg, seen) = harness(&dev);
        let mut e = entry(3, 0);
        e.status = 0xdead;
        e.data_size = 512;
        e.result = 0x1122_3344_5566_7788;
        reg.route(&e).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Completion {
                index: 0,
                status: 0xdead,
                data_size: 512,
                result: 0x1122_3344_5566_7788,
            }
        );
    }

    #[test]
    fn route_rejects_out_of_range_id() {
        let dev = TestDevice::new();
        let (mut reg, seen) = harness(&dev);
        for raw in [MAX_QUEUES as u16, u16::MAX] {
            assert_eq!(
                reg.route(&entry(raw, 0)),
                Err(QueueError::OutOfRangeQueueId)
            );
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn route_rejects_unknown_and_wrong_kind_ids() {
        let dev = TestDevice::new();
        let (mut reg, _) = harness(&dev);
        // Nothing registered at 7.
        assert_eq!(
            reg.route(&entry(7, 0)),
            Err(QueueError::UnknownOrWrongKindQueue)
        );
        // 1 is the completion queue.
        assert_eq!(
            reg.route(&entry(1, 0)),
            Err(QueueError::UnknownOrWrongKindQueue)
        );
    }

    #[test]
    fn mismatched_index_quarantines_without_moving_head() {
        let dev = TestDevice::new();
        let (mut reg, seen) = harness(&dev);
        reg.route(&entry(3, 0)).unwrap();

        // Device claims slot 5 next; head is 1.
        assert_eq!(reg.route(&entry(3, 5)), Err(QueueError::OrderingViolation));
        assert_eq!(sq_of(&reg, 3).head(), 1);
        assert!(sq_of(&reg, 3).is_desynchronized());
        assert_eq!(seen.lock().unwrap().len(), 1);

        // Even a now-correct index is refused after quarantine.
        assert_eq!(
            reg.route(&entry(3, 1)),
            Err(QueueError::QueueDesynchronized)
        );
        assert_eq!(sq_of(&reg, 3).head(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn callback_less_queue_acknowledges_silently() {
        let dev = TestDevice::new();
        let mut reg = QueueRegistry::new();
        let sq = SubmissionQueue::create(&dev, qid(0), 16, 4, None).unwrap();
        reg.insert(QueueSlot::Submission(sq)).unwrap();
        reg.route(&entry(0, 0)).unwrap();
        reg.route(&entry(0, 1)).unwrap();
        assert_eq!(sq_of(&reg, 0).head(), 2);
    }

    #[test]
    fn drain_of_idle_ring_consumes_nothing() {
        let dev = TestDevice::new();
        let (mut reg, _) = harness(&dev);
        let report = reg.drain_completions(qid(1)).unwrap();
        assert_eq!(report, DrainReport::default());
        if let Some(QueueSlot::Completion(cq)) = reg.get(qid(1)) {
            assert_eq!(cq.read_index(), 0);
        } else {
            panic!("cq missing after drain");
        }
    }

    #[test]
    fn drain_requires_a_completion_queue() {
        let dev = TestDevice::new();
        let (mut reg, _) = harness(&dev);
        // 3 is a submission queue, 9 is empty.
        for raw in [3, 9] {
            assert_eq!(
                reg.drain_completions(qid(raw)),
                Err(QueueError::UnknownOrWrongKindQueue)
            );
        }
        // The submission queue survived the refused drain.
        assert_eq!(sq_of(&reg, 3).head(), 0);
    }

    #[test]
    fn drain_consumes_pending_entries_and_returns_slots() {
        let dev = TestDevice::new();
        let (mut reg, seen) = harness(&dev);
        for i in 0..3u32 {
            device_post(&reg, 1, i, entry(3, i));
        }

        let report = reg.drain_completions(qid(1)).unwrap();
        assert_eq!(report.consumed, 3);
        assert_eq!(report.rejected, 0);
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(sq_of(&reg, 3).head(), 3);

        // Slots were relinquished: flags cleared, index advanced.
        if let Some(QueueSlot::Completion(cq)) = reg.get(qid(1)) {
            assert_eq!(cq.read_index(), 3);
            for i in 0..3 {
                let e = unsafe { cq.entry_ptr(i).read_volatile() };
                assert!(!e.is_pending());
            }
        } else {
            panic!("cq missing after drain");
        }

        // A second drain finds nothing.
        assert_eq!(reg.drain_completions(qid(1)).unwrap(), DrainReport::default());
    }

    #[test]
    fn drain_stops_at_first_non_pending_slot() {
        let dev = TestDevice::new();
        let (mut reg, seen) = harness(&dev);
        // Slot 0 pending, slot 1 idle, slot 2 pending (not yet visible).
        device_post(&reg, 1, 0, entry(3, 0));
        device_post(&reg, 1, 2, entry(3, 1));

        let report = reg.drain_completions(qid(1)).unwrap();
        assert_eq!(report.consumed, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        if let Some(QueueSlot::Completion(cq)) = reg.get(qid(1)) {
            assert_eq!(cq.read_index(), 1);
        } else {
            panic!("cq missing after drain");
        }
    }

    #[test]
    fn drain_drops_bad_entries_and_keeps_going() {
        let dev = TestDevice::new();
        let (mut reg, seen) = harness(&dev);
        // Out-of-range id, then a valid completion behind it.
        device_post(&reg, 1, 0, entry(63, 0));
        device_post(&reg, 1, 1, entry(3, 0));

        let report = reg.drain_completions(qid(1)).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.consumed, 1);
        assert_eq!(report.total(), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(sq_of(&reg, 3).head(), 1);
    }

    #[test]
    fn drain_wraps_the_read_index() {
        let dev = TestDevice::new();
        let mut reg = QueueRegistry::new();
        let cq = CompletionQueue::create(&dev, qid(1), 2).unwrap();
        let sq = SubmissionQueue::create(&dev, qid(3), 64, 2, None).unwrap();
        reg.insert(QueueSlot::Completion(cq)).unwrap();
        reg.insert(QueueSlot::Submission(sq)).unwrap();

        // Two batches across the 2-slot ring boundary.
        device_post(&reg, 1, 0, entry(3, 0));
        device_post(&reg, 1, 1, entry(3, 1));
        assert_eq!(reg.drain_completions(qid(1)).unwrap().consumed, 2);

        device_post(&reg, 1, 0, entry(3, 0));
        assert_eq!(reg.drain_completions(qid(1)).unwrap().consumed, 1);

        if let Some(QueueSlot::Completion(cq)) = reg.get(qid(1)) {
            assert_eq!(cq.read_index(), 1);
        } else {
            panic!("cq missing after drain");
        }
        assert_eq!(sq_of(&reg, 3).head(), 1);
    }
}
