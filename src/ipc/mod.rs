//! Buffer chains for IPC endpoints
//!
//! A [`BufChain`] is the bounded FIFO of page-sized buffer cells behind one
//! socket or channel endpoint. It stores either a byte stream or a sequence
//! of datagrams (never both on one chain), accepts writes copied in from
//! user memory, and serves reads copied back out.
//!
//! The chain has no internal locking; the owning dispatcher serializes
//! access with the endpoint lock and translates [`ChainError::ShouldWait`]
//! into readiness signaling and blocking.

mod chain;

pub use chain::{total_cell_bytes, BufChain, CELL_PAYLOAD, CHAIN_CAPACITY};

use crate::mem::user::UserCopyError;

/// Errors returned by chain reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    /// No capacity left, or no pages available; retry once the chain
    /// drains.
    ShouldWait,
    /// A single datagram larger than the chain can ever hold.
    OutOfRange,
    /// Zero-length datagram, or a datagram payload that faulted.
    InvalidArgs,
    /// User memory faulted mid-operation; `copied` bytes had already been
    /// transferred and remain transferred.
    Fault {
        /// Bytes moved before the fault (committed to the chain on a
        /// stream write, delivered to the caller on a read).
        copied: usize,
        /// The underlying access error.
        cause: UserCopyError,
    },
}
