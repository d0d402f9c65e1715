//! Queue engine error types.

use core::fmt;

use dma_coherent::DmaError;

pub type Result<T> = core::result::Result<T, QueueError>;

/// Errors from queue creation, registration and completion routing.
///
/// Routing failures (`OutOfRangeQueueId`, `UnknownOrWrongKindQueue`,
/// `OrderingViolation`, `QueueDesynchronized`) describe malformed or
/// misdirected device responses: the offending entry is dropped, the
/// drain keeps going, and nothing panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Coherent allocation failed; the queue was never created.
    AllocationFailure,
    /// Element count/size is zero or does not fit the descriptor fields.
    InvalidElementCount,
    /// Device reported a completion for an id outside the queue table.
    OutOfRangeQueueId,
    /// No queue with that id, or the id names a completion queue.
    UnknownOrWrongKindQueue,
    /// Completion index does not match the submission queue head.
    OrderingViolation,
    /// Queue was quarantined by an earlier ordering violation.
    QueueDesynchronized,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure => write!(f, "coherent queue memory allocation failed"),
            Self::InvalidElementCount => write!(f, "element count does not fit the queue descriptor"),
            Self::OutOfRangeQueueId => write!(f, "queue id out of range"),
            Self::UnknownOrWrongKindQueue => write!(f, "no submission queue with that id"),
            Self::OrderingViolation => write!(f, "completion index does not match queue head"),
            Self::QueueDesynchronized => write!(f, "queue is desynchronized"),
        }
    }
}

impl From<DmaError> for QueueError {
    fn from(_: DmaError) -> Self {
        Self::AllocationFailure
    }
}
